//! Stack machine with pause/resume at external calls.
//!
//! A run ends in one of three ways: the module returns a value, a fault is
//! raised, or the program calls a host function. In the last case the whole
//! machine state is handed back as a [`Suspended`] value together with the
//! call; the host performs the call and resumes the machine with its result.
//! Nothing keeps running in the background while a machine is suspended.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::ast::{BinOp, CmpOp, UnaryOp};
use super::bytecode::{CaptureSource, CompiledProgram, Constant, Op};
use super::error::{Fault, ResourceKind};
use super::format::{self, Render};
use super::value::{Builtin, Function, HeapObject, IterState, Key, ObjId, Object, Value};

/// Clock and interrupt checks happen every this many instructions.
const CHECK_INTERVAL: u32 = 1024;
/// Nesting bound when rendering or exporting container values.
const MAX_RENDER_DEPTH: usize = 64;
/// Charged bytes below which no collection is attempted.
const COLLECT_FLOOR: u64 = 4 * 1024 * 1024;

/// Per-run resource ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// Running time only; time spent paused at an external call is not counted.
    pub max_duration: Duration,
    pub max_memory_bytes: u64,
    pub max_allocations: u64,
    pub max_recursion_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(30),
            max_memory_bytes: 128 * 1024 * 1024,
            max_allocations: 5_000_000,
            max_recursion_depth: 200,
        }
    }
}

/// Shared flag polled by the interpreter; raising it stops a running program
/// with [`Fault::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

/// A host function call requested by a paused program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalCall {
    pub name: String,
    pub args: Vec<Object>,
    pub kwargs: Vec<(String, Object)>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed { value: Object, stdout: String },
    Paused { call: ExternalCall, state: Suspended },
    Faulted { fault: Fault, stdout: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(super) struct Frame {
    pub(super) code: u32,
    pub(super) ip: usize,
    pub(super) locals: Vec<Option<Value>>,
    pub(super) captures: Vec<Option<Value>>,
    pub(super) stack: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(super) struct MachineState {
    pub(super) heap: Vec<HeapObject>,
    pub(super) globals: BTreeMap<String, Value>,
    pub(super) frames: Vec<Frame>,
    pub(super) stdout: String,
    pub(super) allocations: u64,
    /// Live bytes as of the last collection plus everything charged since.
    pub(super) memory: u64,
    /// Live bytes measured by the last collection.
    #[serde(default)]
    pub(super) live_floor: u64,
    /// `memory` level that triggers the next collection.
    #[serde(default)]
    pub(super) next_collect: u64,
    /// Heap slots released by collection, reused by later allocations.
    #[serde(default)]
    pub(super) free: Vec<ObjId>,
    pub(super) elapsed: Duration,
}

/// A program frozen at an external call.
#[derive(Debug, Clone)]
pub struct Suspended {
    program: Arc<CompiledProgram>,
    state: MachineState,
    call: ExternalCall,
}

#[derive(Serialize)]
struct SuspendedRef<'a> {
    program: &'a CompiledProgram,
    state: &'a MachineState,
    call: &'a ExternalCall,
}

#[derive(Deserialize)]
struct SuspendedOwned {
    program: CompiledProgram,
    state: MachineState,
    call: ExternalCall,
}

impl Suspended {
    /// The pending call.
    pub fn call(&self) -> &ExternalCall {
        &self.call
    }

    /// Output printed before the pause.
    pub fn stdout(&self) -> &str {
        &self.state.stdout
    }

    /// Continue with `value` as the result of the pending call.
    pub fn resume(self, value: Object, limits: &Limits, interrupt: &InterruptFlag) -> RunOutcome {
        let mut vm = Vm::new(self.program, self.state, limits, interrupt);
        vm.drive(Some(value))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&SuspendedRef {
            program: &self.program,
            state: &self.state,
            call: &self.call,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let owned: SuspendedOwned = serde_json::from_slice(bytes)?;
        Ok(Self {
            program: Arc::new(owned.program),
            state: owned.state,
            call: owned.call,
        })
    }
}

/// Start a compiled program from the top.
pub fn run(program: Arc<CompiledProgram>, limits: &Limits, interrupt: &InterruptFlag) -> RunOutcome {
    let num_locals = program
        .codes
        .get(CompiledProgram::MODULE as usize)
        .map(|c| c.num_locals)
        .unwrap_or(0);
    let state = MachineState {
        frames: vec![Frame {
            code: CompiledProgram::MODULE,
            ip: 0,
            locals: vec![None; num_locals as usize],
            captures: Vec::new(),
            stack: Vec::new(),
        }],
        ..MachineState::default()
    };
    let mut vm = Vm::new(program, state, limits, interrupt);
    vm.drive(None)
}

pub(super) enum Flow {
    Next,
    Return(Value),
    External(ExternalCall),
}

pub(super) enum Exit {
    Returned(Value),
    Paused(ExternalCall),
}

pub(crate) struct Vm {
    pub(super) program: Arc<CompiledProgram>,
    pub(super) state: MachineState,
    pub(super) limits: Limits,
    interrupt: InterruptFlag,
    started: Instant,
    ticks: u32,
    /// Number of host-invoked callbacks (sort keys, `map`, ...) on the stack.
    callback_depth: u32,
}

impl Vm {
    fn new(
        program: Arc<CompiledProgram>,
        state: MachineState,
        limits: &Limits,
        interrupt: &InterruptFlag,
    ) -> Self {
        Self {
            program,
            state,
            limits: limits.clone(),
            interrupt: interrupt.clone(),
            started: Instant::now(),
            ticks: 0,
            callback_depth: 0,
        }
    }

    fn drive(&mut self, inject: Option<Object>) -> RunOutcome {
        let result = match inject {
            Some(value) => self
                .import(&value)
                .and_then(|v| self.push(v))
                .and_then(|_| self.execute(0)),
            None => self.execute(0),
        };
        self.state.elapsed += self.started.elapsed();

        match result {
            Ok(Exit::Returned(value)) => RunOutcome::Completed {
                value: self.export(&value),
                stdout: std::mem::take(&mut self.state.stdout),
            },
            Ok(Exit::Paused(call)) => RunOutcome::Paused {
                call: call.clone(),
                state: Suspended {
                    program: Arc::clone(&self.program),
                    state: std::mem::take(&mut self.state),
                    call,
                },
            },
            Err(fault) => RunOutcome::Faulted {
                fault,
                stdout: std::mem::take(&mut self.state.stdout),
            },
        }
    }

    /// Run until the frame stack drops back to `base` frames.
    pub(super) fn execute(&mut self, base: usize) -> Result<Exit, Fault> {
        let program = Arc::clone(&self.program);
        loop {
            self.tick()?;
            self.maybe_collect()?;
            let (code_idx, ip) = {
                let frame = self.frame()?;
                (frame.code, frame.ip)
            };
            let code = program
                .codes
                .get(code_idx as usize)
                .ok_or_else(|| Fault::runtime("invalid code object"))?;
            let op = *code
                .ops
                .get(ip)
                .ok_or_else(|| Fault::runtime("instruction pointer out of range"))?;
            self.frame_mut()?.ip = ip + 1;

            match self.step(op, &program) {
                Ok(Flow::Next) => {}
                Ok(Flow::Return(value)) => {
                    self.state.frames.pop();
                    if self.state.frames.len() <= base {
                        return Ok(Exit::Returned(value));
                    }
                    self.push(value)?;
                }
                Ok(Flow::External(call)) => return Ok(Exit::Paused(call)),
                Err(fault) => return Err(fault.at_line(code.line_at(ip))),
            }
        }
    }

    fn tick(&mut self) -> Result<(), Fault> {
        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % CHECK_INTERVAL == 0 {
            self.check_clock()?;
        }
        Ok(())
    }

    pub(super) fn check_clock(&self) -> Result<(), Fault> {
        if self.interrupt.is_raised() {
            return Err(Fault::Cancelled);
        }
        if self.state.elapsed + self.started.elapsed() > self.limits.max_duration {
            return Err(Fault::ResourceExceeded(ResourceKind::Timeout));
        }
        Ok(())
    }

    // -- memory accounting ---------------------------------------------------

    /// Account for `bytes` of new data.
    ///
    /// Exceeding the ceiling is fatal right away only when the allocation
    /// cannot fit beside the live set, or inside a callback where no
    /// collection can run. Otherwise the next instruction boundary collects
    /// and re-checks.
    pub(super) fn charge(&mut self, bytes: u64) -> Result<(), Fault> {
        let max = self.limits.max_memory_bytes;
        self.state.memory = self.state.memory.saturating_add(bytes);
        if self.state.memory > max
            && (self.callback_depth > 0 || self.state.live_floor.saturating_add(bytes) > max)
        {
            return Err(Fault::ResourceExceeded(ResourceKind::Memory));
        }
        Ok(())
    }

    /// Collect at an instruction boundary once charged memory passes the
    /// threshold, then enforce the ceiling against the live set.
    fn maybe_collect(&mut self) -> Result<(), Fault> {
        if self.callback_depth > 0 {
            return Ok(());
        }
        let max = self.limits.max_memory_bytes;
        let threshold = self.state.next_collect.max(COLLECT_FLOOR).min(max);
        if self.state.memory <= threshold {
            return Ok(());
        }
        self.collect_garbage();
        if self.state.memory > max {
            return Err(Fault::ResourceExceeded(ResourceKind::Memory));
        }
        Ok(())
    }

    /// Mark everything reachable from globals and frames, release the rest
    /// and reset `memory` to the live size.
    ///
    /// Only sound between instructions at callback depth zero, when every
    /// value in use sits in a frame or a global.
    pub(super) fn collect_garbage(&mut self) {
        let state = &mut self.state;
        let mut marked = vec![false; state.heap.len()];
        let mut pending: Vec<ObjId> = Vec::new();
        let mut live = 0u64;

        let roots = state.globals.values().chain(state.frames.iter().flat_map(|frame| {
            frame
                .locals
                .iter()
                .chain(&frame.captures)
                .flatten()
                .chain(&frame.stack)
        }));
        for value in roots {
            live += value_size(value);
            trace_refs(value, &mut pending);
        }

        while let Some(id) = pending.pop() {
            let idx = id as usize;
            match marked.get_mut(idx) {
                Some(seen) if !*seen => *seen = true,
                _ => continue,
            }
            let object = &state.heap[idx];
            live += heap_size(object);
            heap_children(object, &mut pending);
        }

        state.free.clear();
        for (idx, slot) in state.heap.iter_mut().enumerate() {
            if !marked[idx] {
                *slot = HeapObject::List(Vec::new());
                state.free.push(idx as ObjId);
            }
        }

        state.memory = live;
        state.live_floor = live;
        state.next_collect = live.saturating_mul(2);
    }

    pub(super) fn alloc(&mut self, object: HeapObject) -> Result<Value, Fault> {
        self.state.allocations += 1;
        if self.state.allocations > self.limits.max_allocations {
            return Err(Fault::ResourceExceeded(ResourceKind::Allocations));
        }
        self.charge(heap_size(&object))?;
        match self.state.free.pop() {
            Some(id) => {
                self.state.heap[id as usize] = object;
                Ok(Value::Ref(id))
            }
            None => {
                self.state.heap.push(object);
                Ok(Value::Ref((self.state.heap.len() - 1) as ObjId))
            }
        }
    }

    pub(super) fn new_str(&mut self, s: String) -> Result<Value, Fault> {
        self.charge(24 + s.len() as u64)?;
        Ok(Value::Str(s))
    }

    pub(super) fn new_list(&mut self, items: Vec<Value>) -> Result<Value, Fault> {
        self.alloc(HeapObject::List(items))
    }

    pub(super) fn new_iter(&mut self, items: Vec<Value>) -> Result<Value, Fault> {
        self.alloc(HeapObject::Iterator(IterState::Seq { items, pos: 0 }))
    }

    pub(super) fn new_set(&mut self, items: Vec<Value>) -> Result<Value, Fault> {
        let mut set = IndexMap::with_capacity(items.len());
        for item in items {
            set.entry(self.key_of(&item)?).or_insert(item);
        }
        self.alloc(HeapObject::Set(set))
    }

    pub(super) fn new_dict(&mut self, pairs: Vec<(Value, Value)>) -> Result<Value, Fault> {
        let mut map = IndexMap::with_capacity(pairs.len());
        for (k, v) in pairs {
            map.insert(self.key_of(&k)?, (k, v));
        }
        self.alloc(HeapObject::Dict(map))
    }

    // -- frame and stack -----------------------------------------------------

    fn frame(&self) -> Result<&Frame, Fault> {
        self.state
            .frames
            .last()
            .ok_or_else(|| Fault::runtime("no active frame"))
    }

    fn frame_mut(&mut self) -> Result<&mut Frame, Fault> {
        self.state
            .frames
            .last_mut()
            .ok_or_else(|| Fault::runtime("no active frame"))
    }

    pub(super) fn push(&mut self, value: Value) -> Result<(), Fault> {
        self.frame_mut()?.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, Fault> {
        self.frame_mut()?
            .stack
            .pop()
            .ok_or_else(|| Fault::runtime("stack underflow"))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, Fault> {
        let stack = &mut self.frame_mut()?.stack;
        if stack.len() < n {
            return Err(Fault::runtime("stack underflow"));
        }
        let at = stack.len() - n;
        Ok(stack.split_off(at))
    }

    fn top(&self) -> Result<&Value, Fault> {
        self.frame()?
            .stack
            .last()
            .ok_or_else(|| Fault::runtime("stack underflow"))
    }

    fn jump(&mut self, target: u32) -> Result<(), Fault> {
        self.frame_mut()?.ip = target as usize;
        Ok(())
    }

    pub(super) fn obj(&self, id: ObjId) -> Result<&HeapObject, Fault> {
        self.state
            .heap
            .get(id as usize)
            .ok_or_else(|| Fault::runtime("dangling reference"))
    }

    pub(super) fn obj_mut(&mut self, id: ObjId) -> Result<&mut HeapObject, Fault> {
        self.state
            .heap
            .get_mut(id as usize)
            .ok_or_else(|| Fault::runtime("dangling reference"))
    }

    fn local_container(&self, slot: u32) -> Result<ObjId, Fault> {
        match self.frame()?.locals.get(slot as usize) {
            Some(Some(Value::Ref(id))) => Ok(*id),
            _ => Err(Fault::runtime("comprehension accumulator missing")),
        }
    }

    // -- instruction dispatch ------------------------------------------------

    fn step(&mut self, op: Op, program: &CompiledProgram) -> Result<Flow, Fault> {
        match op {
            Op::Const(idx) => {
                let value = match program.constants.get(idx as usize) {
                    Some(Constant::None) => Value::None,
                    Some(Constant::Bool(b)) => Value::Bool(*b),
                    Some(Constant::Int(i)) => Value::Int(*i),
                    Some(Constant::Float(f)) => Value::Float(*f),
                    Some(Constant::Str(s)) => Value::Str(s.clone()),
                    _ => return Err(Fault::runtime("invalid constant")),
                };
                self.push(value)?;
            }
            Op::LoadGlobal(idx) => {
                let name = program.name(idx);
                let value = match self.state.globals.get(name) {
                    Some(v) => v.clone(),
                    None if program.is_external(name) => Value::External(name.to_string()),
                    None => Value::Builtin(
                        Builtin::lookup(name).ok_or_else(|| Fault::name_error(name))?,
                    ),
                };
                self.push(value)?;
            }
            Op::StoreGlobal(idx) => {
                let value = self.pop()?;
                self.state
                    .globals
                    .insert(program.name(idx).to_string(), value);
            }
            Op::LoadLocal(slot) => {
                let value = self
                    .frame()?
                    .locals
                    .get(slot as usize)
                    .cloned()
                    .flatten()
                    .ok_or_else(|| {
                        Fault::runtime("UnboundLocalError: local variable referenced before assignment")
                    })?;
                self.push(value)?;
            }
            Op::StoreLocal(slot) => {
                let value = self.pop()?;
                let frame = self.frame_mut()?;
                let slot = slot as usize;
                if slot >= frame.locals.len() {
                    frame.locals.resize(slot + 1, None);
                }
                frame.locals[slot] = Some(value);
            }
            Op::LoadCapture(idx) => {
                let value = self
                    .frame()?
                    .captures
                    .get(idx as usize)
                    .cloned()
                    .flatten()
                    .ok_or_else(|| {
                        Fault::runtime(
                            "NameError: free variable referenced before assignment in enclosing scope",
                        )
                    })?;
                self.push(value)?;
            }

            Op::Pop => {
                self.pop()?;
            }
            Op::Dup => {
                let value = self.top()?.clone();
                self.push(value)?;
            }
            Op::DupTwo => {
                let pair = self.pop_n(2)?;
                for value in pair.iter().chain(pair.iter()) {
                    self.push(value.clone())?;
                }
            }
            Op::RotTwo => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(a)?;
            }
            Op::RotThree => {
                let c = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(c)?;
                self.push(a)?;
                self.push(b)?;
            }

            Op::Binary(op) => {
                let right = self.pop()?;
                let left = self.pop()?;
                let result = self.binary(op, left, right)?;
                self.push(result)?;
            }
            Op::Unary(op) => {
                let operand = self.pop()?;
                let result = self.unary(op, operand)?;
                self.push(result)?;
            }
            Op::Compare(op) => {
                let right = self.pop()?;
                let left = self.pop()?;
                let result = self.compare_op(op, &left, &right)?;
                self.push(Value::Bool(result))?;
            }

            Op::Jump(target) => self.jump(target)?,
            Op::JumpIfFalse(target) => {
                let value = self.pop()?;
                if !self.truthy(&value) {
                    self.jump(target)?;
                }
            }
            Op::JumpIfTrue(target) => {
                let value = self.pop()?;
                if self.truthy(&value) {
                    self.jump(target)?;
                }
            }
            Op::JumpIfFalseOrPop(target) => {
                if self.truthy(self.top()?) {
                    self.pop()?;
                } else {
                    self.jump(target)?;
                }
            }
            Op::JumpIfTrueOrPop(target) => {
                if self.truthy(self.top()?) {
                    self.jump(target)?;
                } else {
                    self.pop()?;
                }
            }

            Op::BuildList(n) => {
                let items = self.pop_n(n as usize)?;
                let list = self.new_list(items)?;
                self.push(list)?;
            }
            Op::BuildTuple(n) => {
                let items = self.pop_n(n as usize)?;
                self.charge(24 + 16 * items.len() as u64)?;
                self.push(Value::Tuple(items))?;
            }
            Op::BuildSet(n) => {
                let items = self.pop_n(n as usize)?;
                let set = self.new_set(items)?;
                self.push(set)?;
            }
            Op::BuildDict(n) => {
                let flat = self.pop_n(2 * n as usize)?;
                let mut pairs = Vec::with_capacity(n as usize);
                let mut it = flat.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    pairs.push((k, v));
                }
                let dict = self.new_dict(pairs)?;
                self.push(dict)?;
            }
            Op::BuildSlice => {
                let step = self.pop()?;
                let stop = self.pop()?;
                let start = self.pop()?;
                let bound = |v: &Value| match v {
                    Value::None => Ok(None),
                    Value::Int(i) => Ok(Some(*i)),
                    Value::Bool(b) => Ok(Some(*b as i64)),
                    _ => Err(Fault::type_error(
                        "slice indices must be integers or None",
                    )),
                };
                let slice = Value::Slice {
                    start: bound(&start)?,
                    stop: bound(&stop)?,
                    step: bound(&step)?,
                };
                self.push(slice)?;
            }
            Op::ListAppend(slot) => {
                let value = self.pop()?;
                let id = self.local_container(slot)?;
                self.charge(16)?;
                if let HeapObject::List(items) = self.obj_mut(id)? {
                    items.push(value);
                }
            }
            Op::SetAdd(slot) => {
                let value = self.pop()?;
                let id = self.local_container(slot)?;
                let key = self.key_of(&value)?;
                self.charge(32)?;
                if let HeapObject::Set(set) = self.obj_mut(id)? {
                    set.entry(key).or_insert(value);
                }
            }
            Op::DictInsert(slot) => {
                let value = self.pop()?;
                let key = self.pop()?;
                let id = self.local_container(slot)?;
                let hashed = self.key_of(&key)?;
                self.charge(48)?;
                if let HeapObject::Dict(map) = self.obj_mut(id)? {
                    map.insert(hashed, (key, value));
                }
            }

            Op::Subscript => {
                let index = self.pop()?;
                let container = self.pop()?;
                let value = self.subscript(&container, &index)?;
                self.push(value)?;
            }
            Op::StoreSubscript => {
                let index = self.pop()?;
                let container = self.pop()?;
                let value = self.pop()?;
                self.store_subscript(&container, index, value)?;
            }
            Op::DeleteSubscript => {
                let index = self.pop()?;
                let container = self.pop()?;
                self.delete_subscript(&container, &index)?;
            }

            Op::GetIter => {
                let value = self.pop()?;
                let iter = self.get_iter(value)?;
                self.push(iter)?;
            }
            Op::ForIter(target) => {
                let Value::Ref(id) = *self.top()? else {
                    return Err(Fault::runtime("loop without iterator"));
                };
                match self.iter_next(id)? {
                    Some(item) => self.push(item)?,
                    None => {
                        self.pop()?;
                        self.jump(target)?;
                    }
                }
            }
            Op::UnpackSequence(n) => {
                let value = self.pop()?;
                let items = self.iterate(&value)?;
                let n = n as usize;
                match items.len().cmp(&n) {
                    Ordering::Less => {
                        return Err(Fault::value_error(format!(
                            "not enough values to unpack (expected {n}, got {})",
                            items.len()
                        )))
                    }
                    Ordering::Greater => {
                        return Err(Fault::value_error(format!(
                            "too many values to unpack (expected {n})"
                        )))
                    }
                    Ordering::Equal => {}
                }
                for item in items.into_iter().rev() {
                    self.push(item)?;
                }
            }

            Op::Call { argc, kwnames } => {
                let kwargs = self.pop_kwargs(program, kwnames)?;
                let args = self.pop_n(argc as usize)?;
                let callee = self.pop()?;
                return self.call(callee, args, kwargs);
            }
            Op::CallMethod {
                name,
                argc,
                kwnames,
            } => {
                let kwargs = self.pop_kwargs(program, kwnames)?;
                let args = self.pop_n(argc as usize)?;
                let receiver = self.pop()?;
                let result = self.call_method(receiver, program.name(name), args, kwargs)?;
                self.push(result)?;
            }
            Op::MakeFunction { code, defaults } => {
                let defaults = self.pop_n(defaults as usize)?;
                let sources = &program
                    .codes
                    .get(code as usize)
                    .ok_or_else(|| Fault::runtime("invalid code object"))?
                    .captures;
                let frame = self.frame()?;
                let captures: Vec<Option<Value>> = sources
                    .iter()
                    .map(|source| match source {
                        CaptureSource::Local(slot) => frame.locals.get(*slot as usize).cloned().flatten(),
                        CaptureSource::Capture(idx) => frame.captures.get(*idx as usize).cloned().flatten(),
                        CaptureSource::SelfRef => None,
                    })
                    .collect();
                let function = self.alloc(HeapObject::Function(Function {
                    code,
                    defaults,
                    captures,
                }))?;
                if let Value::Ref(id) = function {
                    if let HeapObject::Function(f) = self.obj_mut(id)? {
                        for (slot, source) in sources.iter().enumerate() {
                            if *source == CaptureSource::SelfRef {
                                f.captures[slot] = Some(Value::Ref(id));
                            }
                        }
                    }
                }
                self.push(function)?;
            }
            Op::Return => {
                let value = self.pop()?;
                return Ok(Flow::Return(value));
            }

            Op::FormatValue {
                conversion,
                has_spec,
            } => {
                let spec = if has_spec {
                    match self.pop()? {
                        Value::Str(s) => s,
                        _ => String::new(),
                    }
                } else {
                    String::new()
                };
                let value = self.pop()?;
                let value = match conversion {
                    Some('r') | Some('a') => Value::Str(self.repr(&value)),
                    Some('s') => Value::Str(self.to_str(&value)),
                    _ => value,
                };
                let text = format::format_value(&value, &spec, &self.to_str(&value))?;
                let text = self.new_str(text)?;
                self.push(text)?;
            }
            Op::BuildString(n) => {
                let parts = self.pop_n(n as usize)?;
                let mut out = String::new();
                for part in &parts {
                    match part {
                        Value::Str(s) => out.push_str(s),
                        other => out.push_str(&self.to_str(other)),
                    }
                }
                let text = self.new_str(out)?;
                self.push(text)?;
            }
            Op::AssertFail { has_msg } => {
                let message = if has_msg {
                    let value = self.pop()?;
                    format!("AssertionError: {}", self.to_str(&value))
                } else {
                    "AssertionError".to_string()
                };
                return Err(Fault::runtime(message));
            }
        }
        Ok(Flow::Next)
    }

    fn pop_kwargs(
        &mut self,
        program: &CompiledProgram,
        kwnames: Option<u32>,
    ) -> Result<Vec<(String, Value)>, Fault> {
        let Some(idx) = kwnames else {
            return Ok(Vec::new());
        };
        let Some(Constant::Names(names)) = program.constants.get(idx as usize) else {
            return Err(Fault::runtime("invalid keyword names"));
        };
        let values = self.pop_n(names.len())?;
        Ok(names.iter().cloned().zip(values).collect())
    }

    // -- calls ---------------------------------------------------------------

    fn call(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Flow, Fault> {
        match callee {
            Value::Builtin(builtin) => {
                let result = self.call_builtin(builtin, args, kwargs)?;
                self.push(result)?;
                Ok(Flow::Next)
            }
            Value::External(name) => {
                if self.callback_depth > 0 {
                    return Err(Fault::runtime(format!(
                        "{name}() cannot be called from inside a callback"
                    )));
                }
                let call = ExternalCall {
                    args: args.iter().map(|a| self.export(a)).collect(),
                    kwargs: kwargs
                        .iter()
                        .map(|(k, v)| (k.clone(), self.export(v)))
                        .collect(),
                    name,
                };
                Ok(Flow::External(call))
            }
            Value::Ref(id) if matches!(self.obj(id)?, HeapObject::Function(_)) => {
                self.push_frame(id, args, kwargs)?;
                Ok(Flow::Next)
            }
            other => Err(Fault::type_error(format!(
                "'{}' object is not callable",
                self.type_name(&other)
            ))),
        }
    }

    fn push_frame(
        &mut self,
        id: ObjId,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<(), Fault> {
        let HeapObject::Function(function) = self.obj(id)?.clone() else {
            return Err(Fault::type_error("object is not callable"));
        };
        if self.state.frames.len() >= self.limits.max_recursion_depth {
            return Err(Fault::ResourceExceeded(ResourceKind::Recursion));
        }
        let program = Arc::clone(&self.program);
        let code = program
            .codes
            .get(function.code as usize)
            .ok_or_else(|| Fault::runtime("invalid code object"))?;
        let name = &code.name;
        let nparams = code.params.len();

        if args.len() > nparams {
            return Err(Fault::type_error(format!(
                "{name}() takes {nparams} positional argument{} but {} were given",
                if nparams == 1 { "" } else { "s" },
                args.len()
            )));
        }
        let mut locals: Vec<Option<Value>> = vec![None; (code.num_locals as usize).max(nparams)];
        for (slot, arg) in args.into_iter().enumerate() {
            locals[slot] = Some(arg);
        }
        for (key, value) in kwargs {
            let slot = code.params.iter().position(|p| *p == key).ok_or_else(|| {
                Fault::type_error(format!("{name}() got an unexpected keyword argument '{key}'"))
            })?;
            if locals[slot].is_some() {
                return Err(Fault::type_error(format!(
                    "{name}() got multiple values for argument '{key}'"
                )));
            }
            locals[slot] = Some(value);
        }
        let first_default = nparams.saturating_sub(function.defaults.len());
        for (offset, default) in function.defaults.iter().enumerate() {
            let slot = first_default + offset;
            if locals[slot].is_none() {
                locals[slot] = Some(default.clone());
            }
        }
        if let Some(missing) = (0..nparams).find(|i| locals[*i].is_none()) {
            return Err(Fault::type_error(format!(
                "{name}() missing required positional argument: '{}'",
                code.params[missing]
            )));
        }

        self.state.frames.push(Frame {
            code: function.code,
            ip: 0,
            locals,
            captures: function.captures,
            stack: Vec::new(),
        });
        Ok(())
    }

    /// Invoke a callable from inside a builtin (sort keys, `map`, `filter`).
    pub(super) fn call_callable(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, Fault> {
        match callee {
            Value::Builtin(builtin) => self.call_builtin(*builtin, args, Vec::new()),
            Value::Ref(id) if matches!(self.obj(*id)?, HeapObject::Function(_)) => {
                let base = self.state.frames.len();
                self.push_frame(*id, args, Vec::new())?;
                self.callback_depth += 1;
                let result = self.execute(base);
                self.callback_depth -= 1;
                match result? {
                    Exit::Returned(value) => Ok(value),
                    Exit::Paused(call) => Err(Fault::runtime(format!(
                        "{}() cannot be called from inside a callback",
                        call.name
                    ))),
                }
            }
            Value::External(name) => Err(Fault::runtime(format!(
                "{name}() cannot be used as a callback"
            ))),
            other => Err(Fault::type_error(format!(
                "'{}' object is not callable",
                self.type_name(other)
            ))),
        }
    }

    // -- value semantics -----------------------------------------------------

    pub(super) fn type_name(&self, value: &Value) -> &'static str {
        match value {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::Ref(id) => self.obj(*id).map(HeapObject::type_name).unwrap_or("object"),
            Value::Builtin(b) if b.is_type() => "type",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::External(_) => "function",
            Value::Slice { .. } => "slice",
        }
    }

    pub(super) fn key_of(&self, value: &Value) -> Result<Key, Fault> {
        Key::of(value).ok_or_else(|| {
            Fault::type_error(format!("unhashable type: '{}'", self.type_name(value)))
        })
    }

    pub(super) fn truthy(&self, value: &Value) -> bool {
        match value {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Ref(id) => match self.obj(*id) {
                Ok(HeapObject::List(items)) => !items.is_empty(),
                Ok(HeapObject::Dict(map)) => !map.is_empty(),
                Ok(HeapObject::Set(set)) => !set.is_empty(),
                _ => true,
            },
            _ => true,
        }
    }

    pub(super) fn values_equal(&self, a: &Value, b: &Value) -> bool {
        self.equal_depth(a, b, 0)
    }

    fn equal_depth(&self, a: &Value, b: &Value, depth: usize) -> bool {
        if depth > MAX_RENDER_DEPTH {
            return false;
        }
        if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
            return x.eq_num(&y);
        }
        match (a, b) {
            (Value::None, Value::None) => true,
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Tuple(x), Value::Tuple(y)) => self.seq_equal(x, y, depth),
            (Value::Builtin(x), Value::Builtin(y)) => x == y,
            (Value::External(x), Value::External(y)) => x == y,
            (Value::Ref(x), Value::Ref(y)) if x == y => true,
            (Value::Ref(x), Value::Ref(y)) => match (self.obj(*x), self.obj(*y)) {
                (Ok(HeapObject::List(p)), Ok(HeapObject::List(q))) => self.seq_equal(p, q, depth),
                (Ok(HeapObject::Dict(p)), Ok(HeapObject::Dict(q))) => {
                    p.len() == q.len()
                        && p.iter().all(|(k, (_, v))| {
                            q.get(k)
                                .is_some_and(|(_, w)| self.equal_depth(v, w, depth + 1))
                        })
                }
                (Ok(HeapObject::Set(p)), Ok(HeapObject::Set(q))) => {
                    p.len() == q.len() && p.keys().all(|k| q.contains_key(k))
                }
                _ => false,
            },
            (
                Value::Slice {
                    start: a1,
                    stop: a2,
                    step: a3,
                },
                Value::Slice {
                    start: b1,
                    stop: b2,
                    step: b3,
                },
            ) => (a1, a2, a3) == (b1, b2, b3),
            _ => false,
        }
    }

    fn seq_equal(&self, x: &[Value], y: &[Value], depth: usize) -> bool {
        x.len() == y.len()
            && x
                .iter()
                .zip(y)
                .all(|(p, q)| self.equal_depth(p, q, depth + 1))
    }

    pub(super) fn compare_values(&self, a: &Value, b: &Value, symbol: &str) -> Result<Ordering, Fault> {
        if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
            return Ok(x.cmp_num(&y));
        }
        let unsupported = || {
            Fault::type_error(format!(
                "'{symbol}' not supported between instances of '{}' and '{}'",
                self.type_name(a),
                self.type_name(b)
            ))
        };
        match (a, b) {
            (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
            (Value::Tuple(x), Value::Tuple(y)) => self.compare_seq(x, y, symbol),
            (Value::Ref(x), Value::Ref(y)) => match (self.obj(*x)?, self.obj(*y)?) {
                (HeapObject::List(p), HeapObject::List(q)) => self.compare_seq(p, q, symbol),
                _ => Err(unsupported()),
            },
            _ => Err(unsupported()),
        }
    }

    fn compare_seq(&self, x: &[Value], y: &[Value], symbol: &str) -> Result<Ordering, Fault> {
        for (p, q) in x.iter().zip(y) {
            if !self.values_equal(p, q) {
                return self.compare_values(p, q, symbol);
            }
        }
        Ok(x.len().cmp(&y.len()))
    }

    fn compare_op(&self, op: CmpOp, a: &Value, b: &Value) -> Result<bool, Fault> {
        Ok(match op {
            CmpOp::Eq => self.values_equal(a, b),
            CmpOp::NotEq => !self.values_equal(a, b),
            CmpOp::Lt => self.compare_values(a, b, op.symbol())? == Ordering::Less,
            CmpOp::LtEq => self.compare_values(a, b, op.symbol())? != Ordering::Greater,
            CmpOp::Gt => self.compare_values(a, b, op.symbol())? == Ordering::Greater,
            CmpOp::GtEq => self.compare_values(a, b, op.symbol())? != Ordering::Less,
            CmpOp::In => self.contains(b, a)?,
            CmpOp::NotIn => !self.contains(b, a)?,
            CmpOp::Is => is_same(a, b),
            CmpOp::IsNot => !is_same(a, b),
        })
    }

    pub(super) fn contains(&self, container: &Value, item: &Value) -> Result<bool, Fault> {
        match container {
            Value::Str(s) => match item {
                Value::Str(needle) => Ok(s.contains(needle.as_str())),
                other => Err(Fault::type_error(format!(
                    "'in <string>' requires string as left operand, not {}",
                    self.type_name(other)
                ))),
            },
            Value::Tuple(items) => Ok(items.iter().any(|v| self.values_equal(v, item))),
            Value::Ref(id) => match self.obj(*id)? {
                HeapObject::List(items) => Ok(items.iter().any(|v| self.values_equal(v, item))),
                HeapObject::Dict(map) => Ok(map.contains_key(&self.key_of(item)?)),
                HeapObject::Set(set) => Ok(set.contains_key(&self.key_of(item)?)),
                HeapObject::Iterator(IterState::Seq { items, pos }) => {
                    Ok(items[*pos..].iter().any(|v| self.values_equal(v, item)))
                }
                HeapObject::Iterator(IterState::Range { next, stop, step }) => match as_int(item) {
                    Some(i) => Ok(if *step > 0 {
                        i >= *next && i < *stop && (i - next) % step == 0
                    } else {
                        i <= *next && i > *stop && (next - i) % (-step) == 0
                    }),
                    None => Ok(false),
                },
                other => Err(Fault::type_error(format!(
                    "argument of type '{}' is not iterable",
                    other.type_name()
                ))),
            },
            other => Err(Fault::type_error(format!(
                "argument of type '{}' is not iterable",
                self.type_name(other)
            ))),
        }
    }

    fn unary(&mut self, op: UnaryOp, operand: Value) -> Result<Value, Fault> {
        match (op, &operand) {
            (UnaryOp::Not, v) => Ok(Value::Bool(!self.truthy(v))),
            (UnaryOp::Neg, Value::Int(i)) => i.checked_neg().map(Value::Int).ok_or_else(Fault::overflow),
            (UnaryOp::Neg, Value::Bool(b)) => Ok(Value::Int(-(*b as i64))),
            (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
            (UnaryOp::Pos, Value::Int(i)) => Ok(Value::Int(*i)),
            (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
            (UnaryOp::Pos, Value::Bool(b)) => Ok(Value::Int(*b as i64)),
            (op, v) => Err(Fault::type_error(format!(
                "bad operand type for unary {}: '{}'",
                if op == UnaryOp::Neg { "-" } else { "+" },
                self.type_name(v)
            ))),
        }
    }

    pub(super) fn binary(&mut self, op: BinOp, left: Value, right: Value) -> Result<Value, Fault> {
        if let (Some(x), Some(y)) = (as_number(&left), as_number(&right)) {
            return match (x, y) {
                (Num::Int(a), Num::Int(b)) => int_binary(op, a, b),
                (a, b) => float_binary(op, a.as_f64(), b.as_f64()),
            };
        }

        match (op, &left, &right) {
            (BinOp::Add, Value::Str(a), Value::Str(b)) => {
                let mut out = String::with_capacity(a.len() + b.len());
                out.push_str(a);
                out.push_str(b);
                self.new_str(out)
            }
            (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
                self.charge(16 * (a.len() + b.len()) as u64)?;
                Ok(Value::Tuple(a.iter().chain(b).cloned().collect()))
            }
            (BinOp::Add, Value::Ref(a), Value::Ref(b)) => match (self.obj(*a)?, self.obj(*b)?) {
                (HeapObject::List(x), HeapObject::List(y)) => {
                    let joined = x.iter().chain(y).cloned().collect();
                    self.new_list(joined)
                }
                _ => Err(self.unsupported(op, &left, &right)),
            },
            (BinOp::Mul, Value::Str(_) | Value::Tuple(_) | Value::Ref(_), Value::Int(_) | Value::Bool(_)) => {
                self.repeat(&left, as_int(&right).unwrap_or(0))
            }
            (BinOp::Mul, Value::Int(_) | Value::Bool(_), Value::Str(_) | Value::Tuple(_) | Value::Ref(_)) => {
                self.repeat(&right, as_int(&left).unwrap_or(0))
            }
            (BinOp::Mod, Value::Str(template), args) => {
                let args = match args {
                    Value::Tuple(items) => items.clone(),
                    other => vec![other.clone()],
                };
                let text = format::percent_format(template, &args, &*self)?;
                self.new_str(text)
            }
            (BinOp::Sub, Value::Ref(a), Value::Ref(b)) => match (self.obj(*a)?, self.obj(*b)?) {
                (HeapObject::Set(x), HeapObject::Set(y)) => {
                    let kept = x
                        .iter()
                        .filter(|(k, _)| !y.contains_key(*k))
                        .map(|(_, v)| v.clone())
                        .collect();
                    self.new_set(kept)
                }
                _ => Err(self.unsupported(op, &left, &right)),
            },
            _ => Err(self.unsupported(op, &left, &right)),
        }
    }

    fn unsupported(&self, op: BinOp, left: &Value, right: &Value) -> Fault {
        Fault::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            self.type_name(left),
            self.type_name(right)
        ))
    }

    fn repeat(&mut self, value: &Value, times: i64) -> Result<Value, Fault> {
        let times = times.max(0) as u64;
        match value {
            Value::Str(s) => {
                self.charge((s.len() as u64).saturating_mul(times))?;
                Ok(Value::Str(s.repeat(times as usize)))
            }
            Value::Tuple(items) => {
                self.charge((16 * items.len() as u64).saturating_mul(times))?;
                Ok(Value::Tuple(repeat_items(items, times as usize)))
            }
            Value::Ref(id) => match self.obj(*id)? {
                HeapObject::List(items) => {
                    let items = items.clone();
                    self.charge((16 * items.len() as u64).saturating_mul(times))?;
                    self.new_list(repeat_items(&items, times as usize))
                }
                other => Err(Fault::type_error(format!(
                    "can't multiply sequence by non-int of type '{}'",
                    other.type_name()
                ))),
            },
            other => Err(Fault::type_error(format!(
                "can't multiply sequence by non-int of type '{}'",
                self.type_name(other)
            ))),
        }
    }

    // -- subscripts ----------------------------------------------------------

    fn subscript(&mut self, container: &Value, index: &Value) -> Result<Value, Fault> {
        match container {
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                match index {
                    Value::Slice { start, stop, step } => {
                        let picked: String = slice_indices(chars.len(), *start, *stop, *step)?
                            .into_iter()
                            .map(|i| chars[i])
                            .collect();
                        self.new_str(picked)
                    }
                    _ => {
                        let i = self.index_arg(index, "string")?;
                        normalize_index(i, chars.len())
                            .map(|i| Value::Str(chars[i].to_string()))
                            .ok_or_else(|| Fault::index_error("string index out of range"))
                    }
                }
            }
            Value::Tuple(items) => match index {
                Value::Slice { start, stop, step } => {
                    let picked = slice_indices(items.len(), *start, *stop, *step)?
                        .into_iter()
                        .map(|i| items[i].clone())
                        .collect();
                    Ok(Value::Tuple(picked))
                }
                _ => {
                    let i = self.index_arg(index, "tuple")?;
                    normalize_index(i, items.len())
                        .map(|i| items[i].clone())
                        .ok_or_else(|| Fault::index_error("tuple index out of range"))
                }
            },
            Value::Ref(id) => match self.obj(*id)? {
                HeapObject::List(items) => match index {
                    Value::Slice { start, stop, step } => {
                        let picked = slice_indices(items.len(), *start, *stop, *step)?
                            .into_iter()
                            .map(|i| items[i].clone())
                            .collect();
                        self.new_list(picked)
                    }
                    _ => {
                        let i = self.index_arg(index, "list")?;
                        normalize_index(i, items.len())
                            .map(|i| items[i].clone())
                            .ok_or_else(|| Fault::index_error("list index out of range"))
                    }
                },
                HeapObject::Dict(map) => {
                    let key = self.key_of(index)?;
                    map.get(&key)
                        .map(|(_, v)| v.clone())
                        .ok_or_else(|| Fault::key_error(self.repr(index)))
                }
                other => Err(Fault::type_error(format!(
                    "'{}' object is not subscriptable",
                    other.type_name()
                ))),
            },
            other => Err(Fault::type_error(format!(
                "'{}' object is not subscriptable",
                self.type_name(other)
            ))),
        }
    }

    fn index_arg(&self, index: &Value, what: &str) -> Result<i64, Fault> {
        as_int(index).ok_or_else(|| {
            Fault::type_error(format!(
                "{what} indices must be integers or slices, not {}",
                self.type_name(index)
            ))
        })
    }

    fn store_subscript(&mut self, container: &Value, index: Value, value: Value) -> Result<(), Fault> {
        let Value::Ref(id) = container else {
            return Err(Fault::type_error(format!(
                "'{}' object does not support item assignment",
                self.type_name(container)
            )));
        };
        let id = *id;
        match self.obj(id)? {
            HeapObject::List(items) => {
                if matches!(index, Value::Slice { .. }) {
                    return Err(Fault::type_error("slice assignment is not supported"));
                }
                let i = self.index_arg(&index, "list")?;
                let slot = normalize_index(i, items.len())
                    .ok_or_else(|| Fault::index_error("list assignment index out of range"))?;
                if let HeapObject::List(items) = self.obj_mut(id)? {
                    items[slot] = value;
                }
                Ok(())
            }
            HeapObject::Dict(_) => {
                let key = self.key_of(&index)?;
                self.charge(48)?;
                if let HeapObject::Dict(map) = self.obj_mut(id)? {
                    map.insert(key, (index, value));
                }
                Ok(())
            }
            other => Err(Fault::type_error(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }

    fn delete_subscript(&mut self, container: &Value, index: &Value) -> Result<(), Fault> {
        let Value::Ref(id) = container else {
            return Err(Fault::type_error(format!(
                "'{}' object does not support item deletion",
                self.type_name(container)
            )));
        };
        let id = *id;
        match self.obj(id)? {
            HeapObject::List(items) => {
                let i = self.index_arg(index, "list")?;
                let slot = normalize_index(i, items.len())
                    .ok_or_else(|| Fault::index_error("list assignment index out of range"))?;
                if let HeapObject::List(items) = self.obj_mut(id)? {
                    items.remove(slot);
                }
                Ok(())
            }
            HeapObject::Dict(_) => {
                let key = self.key_of(index)?;
                let missing = Fault::key_error(self.repr(index));
                match self.obj_mut(id)? {
                    HeapObject::Dict(map) => map.shift_remove(&key).map(|_| ()).ok_or(missing),
                    _ => Ok(()),
                }
            }
            other => Err(Fault::type_error(format!(
                "'{}' object does not support item deletion",
                other.type_name()
            ))),
        }
    }

    // -- iteration -----------------------------------------------------------

    fn get_iter(&mut self, value: Value) -> Result<Value, Fault> {
        if let Value::Ref(id) = value {
            if matches!(self.obj(id)?, HeapObject::Iterator(_)) {
                return Ok(value);
            }
        }
        let items = self.iterate(&value)?;
        self.new_iter(items)
    }

    fn iter_next(&mut self, id: ObjId) -> Result<Option<Value>, Fault> {
        match self.obj_mut(id)? {
            HeapObject::Iterator(IterState::Seq { items, pos }) => {
                let item = items.get(*pos).cloned();
                if item.is_some() {
                    *pos += 1;
                }
                Ok(item)
            }
            HeapObject::Iterator(IterState::Range { next, stop, step }) => {
                let more = if *step > 0 { *next < *stop } else { *next > *stop };
                if !more {
                    return Ok(None);
                }
                let current = *next;
                *next = next.saturating_add(*step);
                Ok(Some(Value::Int(current)))
            }
            _ => Err(Fault::runtime("loop without iterator")),
        }
    }

    /// Materialize the items of an iterable. Iterators are consumed.
    pub(super) fn iterate(&mut self, value: &Value) -> Result<Vec<Value>, Fault> {
        match value {
            Value::Str(s) => {
                self.charge(32 * s.len() as u64)?;
                Ok(s.chars().map(|c| Value::Str(c.to_string())).collect())
            }
            Value::Tuple(items) => Ok(items.clone()),
            Value::Ref(id) => {
                let id = *id;
                if let HeapObject::Iterator(IterState::Range { .. }) = self.obj(id)? {
                    let remaining = self.len_of(value)? as u64;
                    self.charge(remaining.saturating_mul(16))?;
                }
                match self.obj_mut(id)? {
                    HeapObject::List(items) => Ok(items.clone()),
                    HeapObject::Dict(map) => Ok(map.values().map(|(k, _)| k.clone()).collect()),
                    HeapObject::Set(set) => Ok(set.values().cloned().collect()),
                    HeapObject::Iterator(IterState::Seq { items, pos }) => {
                        let rest = items[*pos..].to_vec();
                        *pos = items.len();
                        Ok(rest)
                    }
                    HeapObject::Iterator(IterState::Range { next, stop, step }) => {
                        let mut out = Vec::new();
                        let mut i = *next;
                        while (*step > 0 && i < *stop) || (*step < 0 && i > *stop) {
                            out.push(Value::Int(i));
                            i = match i.checked_add(*step) {
                                Some(n) => n,
                                None => break,
                            };
                        }
                        *next = *stop;
                        Ok(out)
                    }
                    HeapObject::Function(_) => {
                        Err(Fault::type_error("'function' object is not iterable"))
                    }
                }
            }
            other => Err(Fault::type_error(format!(
                "'{}' object is not iterable",
                self.type_name(other)
            ))),
        }
    }

    pub(super) fn len_of(&self, value: &Value) -> Result<usize, Fault> {
        match value {
            Value::Str(s) => Ok(s.chars().count()),
            Value::Tuple(items) => Ok(items.len()),
            Value::Ref(id) => match self.obj(*id)? {
                HeapObject::List(items) => Ok(items.len()),
                HeapObject::Dict(map) => Ok(map.len()),
                HeapObject::Set(set) => Ok(set.len()),
                HeapObject::Iterator(state @ IterState::Range { .. }) => Ok(state.remaining()),
                other => Err(Fault::type_error(format!(
                    "object of type '{}' has no len()",
                    other.type_name()
                ))),
            },
            other => Err(Fault::type_error(format!(
                "object of type '{}' has no len()",
                self.type_name(other)
            ))),
        }
    }

    // -- rendering -----------------------------------------------------------

    pub(super) fn repr(&self, value: &Value) -> String {
        let mut out = String::new();
        self.write_repr(value, 0, &mut out);
        out
    }

    pub(super) fn to_str(&self, value: &Value) -> String {
        match value {
            Value::Str(s) => s.clone(),
            other => self.repr(other),
        }
    }

    fn write_repr(&self, value: &Value, depth: usize, out: &mut String) {
        if depth > MAX_RENDER_DEPTH {
            out.push_str("...");
            return;
        }
        let seq = |items: &mut dyn Iterator<Item = &Value>, out: &mut String| {
            for (i, item) in items.enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                self.write_repr(item, depth + 1, out);
            }
        };
        match value {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(i) => out.push_str(&i.to_string()),
            Value::Float(f) => out.push_str(&format::float_repr(*f)),
            Value::Str(s) => out.push_str(&format::quote_str(s)),
            Value::Tuple(items) => {
                out.push('(');
                seq(&mut items.iter(), out);
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Value::Builtin(b) if b.is_type() => out.push_str(&format!("<class '{}'>", b.name())),
            Value::Builtin(b) => out.push_str(&format!("<built-in function {}>", b.name())),
            Value::External(name) => out.push_str(&format!("<function {name}>")),
            Value::Slice { start, stop, step } => {
                let part = |p: &Option<i64>| p.map(|v| v.to_string()).unwrap_or_else(|| "None".into());
                out.push_str(&format!("slice({}, {}, {})", part(start), part(stop), part(step)));
            }
            Value::Ref(id) => match self.obj(*id) {
                Ok(HeapObject::List(items)) => {
                    out.push('[');
                    seq(&mut items.iter(), out);
                    out.push(']');
                }
                Ok(HeapObject::Dict(map)) => {
                    out.push('{');
                    for (i, (k, v)) in map.values().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        self.write_repr(k, depth + 1, out);
                        out.push_str(": ");
                        self.write_repr(v, depth + 1, out);
                    }
                    out.push('}');
                }
                Ok(HeapObject::Set(set)) if set.is_empty() => out.push_str("set()"),
                Ok(HeapObject::Set(set)) => {
                    out.push('{');
                    seq(&mut set.values(), out);
                    out.push('}');
                }
                Ok(HeapObject::Function(f)) => {
                    let name = self
                        .program
                        .codes
                        .get(f.code as usize)
                        .map(|c| c.name.as_str())
                        .unwrap_or("?");
                    out.push_str(&format!("<function {name}>"));
                }
                Ok(HeapObject::Iterator(_)) => out.push_str("<iterator object>"),
                Err(_) => out.push_str("<?>"),
            },
        }
    }

    // -- host boundary -------------------------------------------------------

    /// Copy a host value onto the heap.
    pub(super) fn import(&mut self, object: &Object) -> Result<Value, Fault> {
        Ok(match object {
            Object::None => Value::None,
            Object::Bool(b) => Value::Bool(*b),
            Object::Int(i) => Value::Int(*i),
            Object::Float(f) => Value::Float(*f),
            Object::Str(s) | Object::Repr(s) => self.new_str(s.clone())?,
            Object::List(items) => {
                let items = items
                    .iter()
                    .map(|o| self.import(o))
                    .collect::<Result<Vec<_>, _>>()?;
                self.new_list(items)?
            }
            Object::Tuple(items) => Value::Tuple(
                items
                    .iter()
                    .map(|o| self.import(o))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Object::Set(items) => {
                let items = items
                    .iter()
                    .map(|o| self.import(o))
                    .collect::<Result<Vec<_>, _>>()?;
                self.new_set(items)?
            }
            Object::Dict(entries) => {
                let mut pairs = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    pairs.push((self.import(k)?, self.import(v)?));
                }
                self.new_dict(pairs)?
            }
        })
    }

    /// Copy a value off the heap for the host.
    pub(super) fn export(&self, value: &Value) -> Object {
        self.export_depth(value, 0)
    }

    fn export_depth(&self, value: &Value, depth: usize) -> Object {
        if depth > MAX_RENDER_DEPTH {
            return Object::Repr("...".into());
        }
        let all = |items: &mut dyn Iterator<Item = &Value>| -> Vec<Object> {
            items.map(|v| self.export_depth(v, depth + 1)).collect()
        };
        match value {
            Value::None => Object::None,
            Value::Bool(b) => Object::Bool(*b),
            Value::Int(i) => Object::Int(*i),
            Value::Float(f) => Object::Float(*f),
            Value::Str(s) => Object::Str(s.clone()),
            Value::Tuple(items) => Object::Tuple(all(&mut items.iter())),
            Value::Ref(id) => match self.obj(*id) {
                Ok(HeapObject::List(items)) => Object::List(all(&mut items.iter())),
                Ok(HeapObject::Set(set)) => Object::Set(all(&mut set.values())),
                Ok(HeapObject::Dict(map)) => Object::Dict(
                    map.values()
                        .map(|(k, v)| (self.export_depth(k, depth + 1), self.export_depth(v, depth + 1)))
                        .collect(),
                ),
                _ => Object::Repr(self.repr(value)),
            },
            other => Object::Repr(self.repr(other)),
        }
    }
}

impl Render for Vm {
    fn to_str(&self, value: &Value) -> String {
        Vm::to_str(self, value)
    }

    fn to_repr(&self, value: &Value) -> String {
        self.repr(value)
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub(super) fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn eq_num(&self, other: &Num) -> bool {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => a == b,
            (a, b) => a.as_f64() == b.as_f64(),
        }
    }

    fn cmp_num(&self, other: &Num) -> Ordering {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => a.cmp(b),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal),
        }
    }
}

pub(super) fn as_number(value: &Value) -> Option<Num> {
    match value {
        Value::Int(i) => Some(Num::Int(*i)),
        Value::Bool(b) => Some(Num::Int(*b as i64)),
        Value::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

pub(super) fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

fn is_same(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Ref(x), Value::Ref(y)) => x == y,
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        _ => false,
    }
}

fn int_binary(op: BinOp, a: i64, b: i64) -> Result<Value, Fault> {
    let overflow = Fault::overflow;
    Ok(match op {
        BinOp::Add => Value::Int(a.checked_add(b).ok_or_else(overflow)?),
        BinOp::Sub => Value::Int(a.checked_sub(b).ok_or_else(overflow)?),
        BinOp::Mul => Value::Int(a.checked_mul(b).ok_or_else(overflow)?),
        BinOp::Div => {
            if b == 0 {
                return Err(Fault::zero_division());
            }
            Value::Float(a as f64 / b as f64)
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(Fault::zero_division());
            }
            let q = a.checked_div(b).ok_or_else(overflow)?;
            Value::Int(if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q })
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(Fault::zero_division());
            }
            let r = a.checked_rem(b).ok_or_else(overflow)?;
            Value::Int(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r })
        }
        BinOp::Pow => {
            if b < 0 {
                if a == 0 {
                    return Err(Fault::zero_division());
                }
                Value::Float((a as f64).powf(b as f64))
            } else {
                let exp = u32::try_from(b).map_err(|_| Fault::overflow())?;
                Value::Int(a.checked_pow(exp).ok_or_else(overflow)?)
            }
        }
    })
}

fn float_binary(op: BinOp, a: f64, b: f64) -> Result<Value, Fault> {
    Ok(Value::Float(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(Fault::zero_division());
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(Fault::zero_division());
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(Fault::zero_division());
            }
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
                r + b
            } else {
                r
            }
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(Fault::zero_division());
            }
            let r = a.powf(b);
            if r.is_nan() && !a.is_nan() && !b.is_nan() {
                return Err(Fault::value_error(
                    "negative number cannot be raised to a fractional power",
                ));
            }
            if r.is_infinite() && a.is_finite() && b.is_finite() {
                return Err(Fault::runtime("OverflowError: numerical result out of range"));
            }
            r
        }
    }))
}

fn repeat_items(items: &[Value], times: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend_from_slice(items);
    }
    out
}

pub(super) fn normalize_index(i: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let i = if i < 0 { i + len } else { i };
    (0..len).contains(&i).then_some(i as usize)
}

pub(super) fn slice_indices(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<Vec<usize>, Fault> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(Fault::value_error("slice step cannot be zero"));
    }
    let len = len as i64;
    let (lower, upper) = if step > 0 { (0, len) } else { (-1, len - 1) };
    let clamp = |bound: Option<i64>, default: i64| match bound {
        None => default,
        Some(b) if b < 0 => (b + len).max(lower),
        Some(b) => b.min(upper),
    };
    let start = clamp(start, if step > 0 { lower } else { upper });
    let stop = clamp(stop, if step > 0 { upper } else { lower });

    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(i as usize);
        i += step;
    }
    Ok(out)
}

fn value_size(value: &Value) -> u64 {
    match value {
        Value::Str(s) => 24 + s.len() as u64,
        Value::Tuple(items) => 24 + items.iter().map(value_size).sum::<u64>(),
        _ => 16,
    }
}

fn trace_refs(value: &Value, out: &mut Vec<ObjId>) {
    match value {
        Value::Ref(id) => out.push(*id),
        Value::Tuple(items) => items.iter().for_each(|item| trace_refs(item, out)),
        _ => {}
    }
}

fn heap_children(object: &HeapObject, out: &mut Vec<ObjId>) {
    match object {
        HeapObject::List(items) | HeapObject::Iterator(IterState::Seq { items, .. }) => {
            items.iter().for_each(|item| trace_refs(item, out))
        }
        HeapObject::Dict(map) => map.values().for_each(|(k, v)| {
            trace_refs(k, out);
            trace_refs(v, out);
        }),
        HeapObject::Set(set) => set.values().for_each(|v| trace_refs(v, out)),
        HeapObject::Function(f) => f
            .defaults
            .iter()
            .chain(f.captures.iter().flatten())
            .for_each(|v| trace_refs(v, out)),
        HeapObject::Iterator(IterState::Range { .. }) => {}
    }
}

fn heap_size(object: &HeapObject) -> u64 {
    64 + match object {
        HeapObject::List(items) => items.iter().map(value_size).sum(),
        HeapObject::Dict(map) => map
            .values()
            .map(|(k, v)| 16 + value_size(k) + value_size(v))
            .sum(),
        HeapObject::Set(set) => set.values().map(|v| 16 + value_size(v)).sum(),
        HeapObject::Function(f) => 16 * (f.defaults.len() + f.captures.len()) as u64,
        HeapObject::Iterator(IterState::Seq { items, .. }) => 16 * items.len() as u64,
        HeapObject::Iterator(IterState::Range { .. }) => 24,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_indices() {
        assert_eq!(slice_indices(5, Some(1), Some(3), None).unwrap(), vec![1, 2]);
        assert_eq!(slice_indices(5, None, None, Some(-1)).unwrap(), vec![4, 3, 2, 1, 0]);
        assert_eq!(slice_indices(5, Some(-2), None, None).unwrap(), vec![3, 4]);
        assert_eq!(slice_indices(5, None, None, Some(2)).unwrap(), vec![0, 2, 4]);
        assert!(slice_indices(5, Some(10), None, None).unwrap().is_empty());
        assert!(slice_indices(5, None, None, Some(0)).is_err());
    }

    #[test]
    fn test_python_division_semantics() {
        assert_eq!(int_binary(BinOp::FloorDiv, -7, 2).unwrap(), Value::Int(-4));
        assert_eq!(int_binary(BinOp::Mod, -7, 3).unwrap(), Value::Int(2));
        assert_eq!(int_binary(BinOp::Div, 7, 2).unwrap(), Value::Float(3.5));
        assert_eq!(int_binary(BinOp::Pow, 2, -1).unwrap(), Value::Float(0.5));
        assert!(int_binary(BinOp::Mod, 1, 0).is_err());
        assert!(int_binary(BinOp::Mul, i64::MAX, 2).is_err());
        assert_eq!(float_binary(BinOp::Mod, -1.0, 3.0).unwrap(), Value::Float(2.0));
    }

    #[test]
    fn test_interrupt_flag_is_shared() {
        let flag = InterruptFlag::new();
        let clone = flag.clone();
        clone.raise();
        assert!(flag.is_raised());
    }
}
