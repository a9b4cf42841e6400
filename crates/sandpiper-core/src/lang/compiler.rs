//! Lowers the syntax tree to stack-machine code.
//!
//! Scoping follows the language rules: module-level names are globals,
//! names assigned anywhere in a function body are locals of that function,
//! comprehension targets live in hidden slots of the enclosing code object,
//! and free variables of nested functions and lambdas are captured by value
//! when the function object is created.

use std::collections::HashMap;

use super::ast::*;
use super::bytecode::{CaptureSource, CodeObject, CompiledProgram, Constant, Op};
use super::error::Fault;

type CResult<T> = Result<T, Fault>;

/// Compile a parsed module. `externals` are the host functions the program may call.
pub fn compile_module(module: &Module, externals: &[String]) -> CResult<CompiledProgram> {
    let mut compiler = Compiler {
        units: vec![Unit::new("<module>", UnitKind::Module, None)],
        codes: vec![CodeObject::new("<module>")],
        constants: Vec::new(),
        names: Vec::new(),
        name_index: HashMap::new(),
    };

    match module.body.split_last() {
        Some((last, rest)) => {
            for stmt in rest {
                compiler.stmt(stmt)?;
            }
            match &last.kind {
                // The final expression statement is the program's result.
                StmtKind::Expr(expr) => {
                    compiler.set_line(last.line);
                    compiler.expr(expr)?;
                    compiler.emit(Op::Return);
                }
                _ => {
                    compiler.stmt(last)?;
                    compiler.emit_const(Constant::None);
                    compiler.emit(Op::Return);
                }
            }
        }
        None => {
            compiler.emit_const(Constant::None);
            compiler.emit(Op::Return);
        }
    }

    let module_unit = compiler.units.pop().ok_or_else(|| Fault::compile("empty scope stack", 0))?;
    let mut code = module_unit.code;
    code.num_locals = module_unit.next_slot;
    compiler.codes[CompiledProgram::MODULE as usize] = code;

    Ok(CompiledProgram {
        codes: compiler.codes,
        constants: compiler.constants,
        names: compiler.names,
        externals: externals.to_vec(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitKind {
    Module,
    Function,
}

struct LoopCtx {
    continue_target: usize,
    breaks: Vec<usize>,
    /// `for` loops keep their iterator on the stack; `break` must drop it.
    holds_iterator: bool,
}

/// One code object under construction.
struct Unit {
    code: CodeObject,
    kind: UnitKind,
    locals: HashMap<String, u32>,
    comp_scopes: Vec<HashMap<String, u32>>,
    capture_names: Vec<String>,
    loops: Vec<LoopCtx>,
    self_name: Option<String>,
    next_slot: u32,
    line: u32,
}

impl Unit {
    fn new(name: &str, kind: UnitKind, self_name: Option<String>) -> Self {
        Self {
            code: CodeObject::new(name),
            kind,
            locals: HashMap::new(),
            comp_scopes: Vec::new(),
            capture_names: Vec::new(),
            loops: Vec::new(),
            self_name,
            next_slot: 0,
            line: 1,
        }
    }

    fn alloc_slot(&mut self) -> u32 {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    fn declare_local(&mut self, name: &str) -> u32 {
        if let Some(slot) = self.locals.get(name) {
            return *slot;
        }
        let slot = self.alloc_slot();
        self.locals.insert(name.to_string(), slot);
        slot
    }

    fn lookup_local(&self, name: &str) -> Option<u32> {
        for scope in self.comp_scopes.iter().rev() {
            if let Some(slot) = scope.get(name) {
                return Some(*slot);
            }
        }
        match self.kind {
            UnitKind::Function => self.locals.get(name).copied(),
            UnitKind::Module => None,
        }
    }
}

enum Access {
    Local(u32),
    Capture(u32),
    Global(u32),
}

enum Body<'a> {
    Block(&'a [Stmt]),
    Expr(&'a Expr),
}

enum CompElt<'a> {
    List(&'a Expr),
    Set(&'a Expr),
    Dict(&'a Expr, &'a Expr),
}

struct Compiler {
    units: Vec<Unit>,
    codes: Vec<CodeObject>,
    constants: Vec<Constant>,
    names: Vec<String>,
    name_index: HashMap<String, u32>,
}

impl Compiler {
    fn unit(&self) -> &Unit {
        &self.units[self.units.len() - 1]
    }

    fn unit_mut(&mut self) -> &mut Unit {
        let last = self.units.len() - 1;
        &mut self.units[last]
    }

    fn set_line(&mut self, line: u32) {
        self.unit_mut().line = line;
    }

    fn error(&self, message: impl Into<String>) -> Fault {
        Fault::compile(message, self.unit().line)
    }

    fn emit(&mut self, op: Op) -> usize {
        let unit = self.unit_mut();
        unit.code.ops.push(op);
        unit.code.lines.push(unit.line);
        unit.code.ops.len() - 1
    }

    fn here(&self) -> usize {
        self.unit().code.ops.len()
    }

    /// Point the jump at `at` to the current position.
    fn patch(&mut self, at: usize) {
        let target = self.here() as u32;
        let op = &mut self.unit_mut().code.ops[at];
        *op = match *op {
            Op::Jump(_) => Op::Jump(target),
            Op::JumpIfFalse(_) => Op::JumpIfFalse(target),
            Op::JumpIfTrue(_) => Op::JumpIfTrue(target),
            Op::JumpIfFalseOrPop(_) => Op::JumpIfFalseOrPop(target),
            Op::JumpIfTrueOrPop(_) => Op::JumpIfTrueOrPop(target),
            Op::ForIter(_) => Op::ForIter(target),
            other => other,
        };
    }

    fn add_const(&mut self, constant: Constant) -> u32 {
        if let Some(idx) = self.constants.iter().position(|c| *c == constant) {
            return idx as u32;
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u32
    }

    fn emit_const(&mut self, constant: Constant) -> usize {
        let idx = self.add_const(constant);
        self.emit(Op::Const(idx))
    }

    fn name_idx(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.name_index.get(name) {
            return *idx;
        }
        let idx = self.names.len() as u32;
        self.names.push(name.to_string());
        self.name_index.insert(name.to_string(), idx);
        idx
    }

    // -- name resolution -----------------------------------------------------

    fn resolve(&mut self, name: &str) -> Access {
        let depth = self.units.len() - 1;
        if let Some(slot) = self.units[depth].lookup_local(name) {
            return Access::Local(slot);
        }
        if self.units[depth].kind == UnitKind::Function {
            if let Some(idx) = self.capture(depth, name) {
                return Access::Capture(idx);
            }
        }
        Access::Global(self.name_idx(name))
    }

    /// Capture index of `name` in the unit at `depth`, registering a new
    /// capture when an enclosing function binds the name.
    fn capture(&mut self, depth: usize, name: &str) -> Option<u32> {
        if let Some(idx) = self.units[depth]
            .capture_names
            .iter()
            .position(|n| n == name)
        {
            return Some(idx as u32);
        }
        if depth == 0 {
            return None;
        }
        let parent = depth - 1;
        let source = if self.units[parent].kind == UnitKind::Function
            && self.units[depth].self_name.as_deref() == Some(name)
        {
            CaptureSource::SelfRef
        } else if let Some(slot) = self.units[parent].lookup_local(name) {
            CaptureSource::Local(slot)
        } else if self.units[parent].kind == UnitKind::Module {
            return None;
        } else {
            CaptureSource::Capture(self.capture(parent, name)?)
        };
        let unit = &mut self.units[depth];
        unit.capture_names.push(name.to_string());
        unit.code.captures.push(source);
        Some((unit.code.captures.len() - 1) as u32)
    }

    fn load_name(&mut self, name: &str) {
        let op = match self.resolve(name) {
            Access::Local(slot) => Op::LoadLocal(slot),
            Access::Capture(idx) => Op::LoadCapture(idx),
            Access::Global(idx) => Op::LoadGlobal(idx),
        };
        self.emit(op);
    }

    fn store_name(&mut self, name: &str) {
        let op = match self.unit().lookup_local(name) {
            Some(slot) => Op::StoreLocal(slot),
            None if self.unit().kind == UnitKind::Module => Op::StoreGlobal(self.name_idx(name)),
            None => Op::StoreLocal(self.unit_mut().declare_local(name)),
        };
        self.emit(op);
    }

    fn store_target(&mut self, target: &Target) -> CResult<()> {
        match target {
            Target::Name(name) => self.store_name(name),
            Target::Subscript { value, index } => {
                self.expr(value)?;
                self.expr(index)?;
                self.emit(Op::StoreSubscript);
            }
            Target::Tuple(items) => {
                self.emit(Op::UnpackSequence(items.len() as u32));
                for item in items {
                    self.store_target(item)?;
                }
            }
        }
        Ok(())
    }

    // -- statements ----------------------------------------------------------

    fn block(&mut self, body: &[Stmt]) -> CResult<()> {
        for stmt in body {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> CResult<()> {
        self.set_line(stmt.line);
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.expr(expr)?;
                self.emit(Op::Pop);
            }
            StmtKind::Assign { targets, value } => {
                self.expr(value)?;
                for (i, target) in targets.iter().enumerate() {
                    if i + 1 < targets.len() {
                        self.emit(Op::Dup);
                    }
                    self.store_target(target)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => match target {
                Target::Name(name) => {
                    self.load_name(name);
                    self.expr(value)?;
                    self.emit(Op::Binary(*op));
                    self.store_name(name);
                }
                Target::Subscript {
                    value: container,
                    index,
                } => {
                    self.expr(container)?;
                    self.expr(index)?;
                    self.emit(Op::DupTwo);
                    self.emit(Op::Subscript);
                    self.expr(value)?;
                    self.emit(Op::Binary(*op));
                    self.emit(Op::RotThree);
                    self.emit(Op::StoreSubscript);
                }
                Target::Tuple(_) => {
                    return Err(self.error("illegal expression for augmented assignment"))
                }
            },
            StmtKind::If { test, body, orelse } => {
                self.expr(test)?;
                let skip_body = self.emit(Op::JumpIfFalse(0));
                self.block(body)?;
                if orelse.is_empty() {
                    self.patch(skip_body);
                } else {
                    let skip_else = self.emit(Op::Jump(0));
                    self.patch(skip_body);
                    self.block(orelse)?;
                    self.patch(skip_else);
                }
            }
            StmtKind::While { test, body } => {
                let start = self.here();
                self.expr(test)?;
                let exit = self.emit(Op::JumpIfFalse(0));
                self.loop_body(start, false, body)?;
                self.patch(exit);
                self.finish_loop();
            }
            StmtKind::For { target, iter, body } => {
                self.expr(iter)?;
                self.emit(Op::GetIter);
                let start = self.here();
                let exit = self.emit(Op::ForIter(0));
                self.store_target(target)?;
                self.loop_body(start, true, body)?;
                self.patch(exit);
                self.finish_loop();
            }
            StmtKind::Break => {
                let holds_iterator = match self.unit().loops.last() {
                    Some(ctx) => ctx.holds_iterator,
                    None => return Err(self.error("'break' outside loop")),
                };
                if holds_iterator {
                    self.emit(Op::Pop);
                }
                let jump = self.emit(Op::Jump(0));
                if let Some(ctx) = self.unit_mut().loops.last_mut() {
                    ctx.breaks.push(jump);
                }
            }
            StmtKind::Continue => {
                let target = match self.unit().loops.last() {
                    Some(ctx) => ctx.continue_target,
                    None => return Err(self.error("'continue' not properly in loop")),
                };
                self.emit(Op::Jump(target as u32));
            }
            StmtKind::Pass => {}
            StmtKind::FunctionDef { name, params, body } => {
                self.function(name, params, Body::Block(body))?;
                self.store_name(name);
            }
            StmtKind::Return(value) => {
                if self.unit().kind == UnitKind::Module {
                    return Err(self.error("'return' outside function"));
                }
                match value {
                    Some(value) => self.expr(value)?,
                    None => {
                        self.emit_const(Constant::None);
                    }
                }
                self.emit(Op::Return);
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    let Target::Subscript { value, index } = target else {
                        return Err(self.error("only subscripts can be deleted"));
                    };
                    self.expr(value)?;
                    self.expr(index)?;
                    self.emit(Op::DeleteSubscript);
                }
            }
            StmtKind::Assert { test, message } => {
                self.expr(test)?;
                let ok = self.emit(Op::JumpIfTrue(0));
                if let Some(message) = message {
                    self.expr(message)?;
                }
                self.emit(Op::AssertFail {
                    has_msg: message.is_some(),
                });
                self.patch(ok);
            }
        }
        Ok(())
    }

    fn loop_body(&mut self, start: usize, holds_iterator: bool, body: &[Stmt]) -> CResult<()> {
        self.unit_mut().loops.push(LoopCtx {
            continue_target: start,
            breaks: Vec::new(),
            holds_iterator,
        });
        self.block(body)?;
        self.emit(Op::Jump(start as u32));
        Ok(())
    }

    fn finish_loop(&mut self) {
        if let Some(ctx) = self.unit_mut().loops.pop() {
            for jump in ctx.breaks {
                self.patch(jump);
            }
        }
    }

    fn function(&mut self, name: &str, params: &[Param], body: Body<'_>) -> CResult<()> {
        // Defaults are evaluated once, in the defining scope.
        let mut defaults = 0u32;
        for param in params {
            if let Some(default) = &param.default {
                self.expr(default)?;
                defaults += 1;
            }
        }

        let self_name = matches!(body, Body::Block(_)).then(|| name.to_string());
        let mut unit = Unit::new(name, UnitKind::Function, self_name);
        unit.line = self.unit().line;
        for param in params {
            unit.declare_local(&param.name);
        }
        if let Body::Block(stmts) = &body {
            let mut assigned = Vec::new();
            collect_assigned(stmts, &mut assigned);
            for local in assigned {
                unit.declare_local(&local);
            }
        }
        self.units.push(unit);

        match body {
            Body::Block(stmts) => {
                self.block(stmts)?;
                self.emit_const(Constant::None);
                self.emit(Op::Return);
            }
            Body::Expr(expr) => {
                self.expr(expr)?;
                self.emit(Op::Return);
            }
        }

        let unit = self
            .units
            .pop()
            .ok_or_else(|| Fault::compile("empty scope stack", 0))?;
        let mut code = unit.code;
        code.params = params.iter().map(|p| p.name.clone()).collect();
        code.num_defaults = defaults;
        code.num_locals = unit.next_slot;
        let code_idx = self.codes.len() as u32;
        self.codes.push(code);

        self.emit(Op::MakeFunction {
            code: code_idx,
            defaults,
        });
        Ok(())
    }

    // -- expressions ---------------------------------------------------------

    fn expr(&mut self, expr: &Expr) -> CResult<()> {
        self.set_line(expr.line);
        match &expr.kind {
            ExprKind::None => {
                self.emit_const(Constant::None);
            }
            ExprKind::Bool(b) => {
                self.emit_const(Constant::Bool(*b));
            }
            ExprKind::Int(i) => {
                self.emit_const(Constant::Int(*i));
            }
            ExprKind::Float(f) => {
                self.emit_const(Constant::Float(*f));
            }
            ExprKind::Str(s) => {
                self.emit_const(Constant::Str(s.clone()));
            }
            ExprKind::FString(parts) => {
                for part in parts {
                    match part {
                        FPart::Literal(text) => {
                            self.emit_const(Constant::Str(text.clone()));
                        }
                        FPart::Field {
                            expr,
                            conversion,
                            spec,
                        } => {
                            self.expr(expr)?;
                            if let Some(spec) = spec {
                                self.emit_const(Constant::Str(spec.clone()));
                            }
                            self.emit(Op::FormatValue {
                                conversion: *conversion,
                                has_spec: spec.is_some(),
                            });
                        }
                    }
                }
                self.emit(Op::BuildString(parts.len() as u32));
            }
            ExprKind::Name(name) => self.load_name(name),
            ExprKind::List(items) => {
                self.exprs(items)?;
                self.emit(Op::BuildList(items.len() as u32));
            }
            ExprKind::Tuple(items) => {
                self.exprs(items)?;
                self.emit(Op::BuildTuple(items.len() as u32));
            }
            ExprKind::Set(items) => {
                self.exprs(items)?;
                self.emit(Op::BuildSet(items.len() as u32));
            }
            ExprKind::Dict(pairs) => {
                for (key, value) in pairs {
                    self.expr(key)?;
                    self.expr(value)?;
                }
                self.emit(Op::BuildDict(pairs.len() as u32));
            }
            ExprKind::Binary { op, left, right } => {
                self.expr(left)?;
                self.expr(right)?;
                self.emit(Op::Binary(*op));
            }
            ExprKind::Unary { op, operand } => {
                self.expr(operand)?;
                self.emit(Op::Unary(*op));
            }
            ExprKind::Logical { op, left, right } => {
                self.expr(left)?;
                let short = match op {
                    BoolOp::And => self.emit(Op::JumpIfFalseOrPop(0)),
                    BoolOp::Or => self.emit(Op::JumpIfTrueOrPop(0)),
                };
                self.expr(right)?;
                self.patch(short);
            }
            ExprKind::Compare { left, rest } => self.compare(left, rest)?,
            ExprKind::IfElse { test, body, orelse } => {
                self.expr(test)?;
                let to_else = self.emit(Op::JumpIfFalse(0));
                self.expr(body)?;
                let to_end = self.emit(Op::Jump(0));
                self.patch(to_else);
                self.expr(orelse)?;
                self.patch(to_end);
            }
            ExprKind::Lambda { params, body } => {
                self.function("<lambda>", params, Body::Expr(body))?;
            }
            ExprKind::Call { func, args, kwargs } => {
                let method = match &func.kind {
                    ExprKind::Attribute { value, name } => {
                        self.expr(value)?;
                        Some(self.name_idx(name))
                    }
                    _ => {
                        self.expr(func)?;
                        None
                    }
                };
                self.exprs(args)?;
                for (_, value) in kwargs {
                    self.expr(value)?;
                }
                let kwnames = (!kwargs.is_empty()).then(|| {
                    self.add_const(Constant::Names(
                        kwargs.iter().map(|(k, _)| k.clone()).collect(),
                    ))
                });
                self.set_line(expr.line);
                let argc = args.len() as u32;
                match method {
                    Some(name) => self.emit(Op::CallMethod {
                        name,
                        argc,
                        kwnames,
                    }),
                    None => self.emit(Op::Call { argc, kwnames }),
                };
            }
            ExprKind::Attribute { name, .. } => {
                return Err(self.error(format!(
                    "attribute access is only supported for method calls (.{name})"
                )))
            }
            ExprKind::Subscript { value, index } => {
                self.expr(value)?;
                self.expr(index)?;
                self.emit(Op::Subscript);
            }
            ExprKind::Slice { lower, upper, step } => {
                for part in [lower, upper, step] {
                    match part {
                        Some(e) => self.expr(e)?,
                        None => {
                            self.emit_const(Constant::None);
                        }
                    }
                }
                self.emit(Op::BuildSlice);
            }
            ExprKind::ListComp { elt, generators } => {
                self.comprehension(generators, CompElt::List(elt))?
            }
            ExprKind::SetComp { elt, generators } => {
                self.comprehension(generators, CompElt::Set(elt))?
            }
            ExprKind::DictComp {
                key,
                value,
                generators,
            } => self.comprehension(generators, CompElt::Dict(key, value))?,
        }
        Ok(())
    }

    fn exprs(&mut self, items: &[Expr]) -> CResult<()> {
        for item in items {
            self.expr(item)?;
        }
        Ok(())
    }

    /// `a < b < c` evaluates `b` once and short-circuits on the first false link.
    fn compare(&mut self, left: &Expr, rest: &[(CmpOp, Expr)]) -> CResult<()> {
        self.expr(left)?;
        let mut cleanups = Vec::new();
        for (i, (op, right)) in rest.iter().enumerate() {
            self.expr(right)?;
            if i + 1 < rest.len() {
                self.emit(Op::Dup);
                self.emit(Op::RotThree);
                self.emit(Op::Compare(*op));
                cleanups.push(self.emit(Op::JumpIfFalseOrPop(0)));
            } else {
                self.emit(Op::Compare(*op));
            }
        }
        if cleanups.is_empty() {
            return Ok(());
        }
        let done = self.emit(Op::Jump(0));
        for jump in cleanups {
            self.patch(jump);
        }
        self.emit(Op::RotTwo);
        self.emit(Op::Pop);
        self.patch(done);
        Ok(())
    }

    fn comprehension(&mut self, generators: &[Comprehension], elt: CompElt<'_>) -> CResult<()> {
        let Some(first) = generators.first() else {
            return Err(self.error("comprehension without 'for'"));
        };
        let acc = self.unit_mut().alloc_slot();
        match elt {
            CompElt::List(_) => self.emit(Op::BuildList(0)),
            CompElt::Set(_) => self.emit(Op::BuildSet(0)),
            CompElt::Dict(..) => self.emit(Op::BuildDict(0)),
        };
        self.emit(Op::StoreLocal(acc));

        // The outermost iterable is evaluated in the enclosing scope.
        self.expr(&first.iter)?;
        self.unit_mut().comp_scopes.push(HashMap::new());

        let mut loops = Vec::with_capacity(generators.len());
        for (i, generator) in generators.iter().enumerate() {
            if i > 0 {
                self.expr(&generator.iter)?;
            }
            self.emit(Op::GetIter);
            let start = self.here();
            let exit = self.emit(Op::ForIter(0));
            self.declare_comprehension_target(&generator.target);
            self.store_target(&generator.target)?;
            for condition in &generator.conditions {
                self.expr(condition)?;
                self.emit(Op::JumpIfFalse(start as u32));
            }
            loops.push((start, exit));
        }

        match elt {
            CompElt::List(e) => {
                self.expr(e)?;
                self.emit(Op::ListAppend(acc));
            }
            CompElt::Set(e) => {
                self.expr(e)?;
                self.emit(Op::SetAdd(acc));
            }
            CompElt::Dict(k, v) => {
                self.expr(k)?;
                self.expr(v)?;
                self.emit(Op::DictInsert(acc));
            }
        }

        for (start, exit) in loops.into_iter().rev() {
            self.emit(Op::Jump(start as u32));
            self.patch(exit);
        }
        self.unit_mut().comp_scopes.pop();
        self.emit(Op::LoadLocal(acc));
        Ok(())
    }

    fn declare_comprehension_target(&mut self, target: &Target) {
        let mut names = Vec::new();
        target_names(target, &mut names);
        let unit = self.unit_mut();
        for name in names {
            let slot = unit.alloc_slot();
            if let Some(scope) = unit.comp_scopes.last_mut() {
                scope.insert(name, slot);
            }
        }
    }
}

fn target_names(target: &Target, out: &mut Vec<String>) {
    match target {
        Target::Name(name) => out.push(name.clone()),
        Target::Tuple(items) => items.iter().for_each(|t| target_names(t, out)),
        Target::Subscript { .. } => {}
    }
}

/// Names bound by a function body, not descending into nested functions.
fn collect_assigned(body: &[Stmt], out: &mut Vec<String>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Assign { targets, .. } => {
                targets.iter().for_each(|t| target_names(t, out));
            }
            StmtKind::AugAssign { target, .. } => target_names(target, out),
            StmtKind::For { target, body, .. } => {
                target_names(target, out);
                collect_assigned(body, out);
            }
            StmtKind::If { body, orelse, .. } => {
                collect_assigned(body, out);
                collect_assigned(orelse, out);
            }
            StmtKind::While { body, .. } => collect_assigned(body, out),
            StmtKind::FunctionDef { name, .. } => out.push(name.clone()),
            _ => {}
        }
    }
}
