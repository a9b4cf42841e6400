//! Compiled form of a program.
//!
//! A [`CompiledProgram`] is plain data: it can be dumped to bytes and loaded
//! back to re-run a program from scratch without re-parsing.

use serde::{Deserialize, Serialize};

use super::ast::{BinOp, CmpOp, UnaryOp};

/// Stack-machine instruction. Jump targets are absolute op indices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Const(u32),
    LoadGlobal(u32),
    StoreGlobal(u32),
    LoadLocal(u32),
    StoreLocal(u32),
    LoadCapture(u32),

    Pop,
    Dup,
    /// `a b -> a b a b`
    DupTwo,
    /// `a b -> b a`
    RotTwo,
    /// `a b c -> c a b`
    RotThree,

    Binary(BinOp),
    Unary(UnaryOp),
    Compare(CmpOp),

    Jump(u32),
    JumpIfFalse(u32),
    JumpIfTrue(u32),
    /// Jump keeping the condition if false, otherwise pop it.
    JumpIfFalseOrPop(u32),
    JumpIfTrueOrPop(u32),

    BuildList(u32),
    BuildTuple(u32),
    BuildSet(u32),
    /// Pops `2 * n` values (key, value pairs).
    BuildDict(u32),
    /// Pops step, upper, lower.
    BuildSlice,
    /// Append TOS to the list held in a local slot (comprehensions).
    ListAppend(u32),
    SetAdd(u32),
    /// Pops value then key.
    DictInsert(u32),

    Subscript,
    /// Stack: `value container index`.
    StoreSubscript,
    DeleteSubscript,

    GetIter,
    /// Push the next item, or pop the iterator and jump when exhausted.
    ForIter(u32),
    /// Pushes items in reverse so the first item ends up on top.
    UnpackSequence(u32),

    /// Stack: `callee args.. kwvalues..`. `kwnames` indexes a `Names` constant.
    Call { argc: u32, kwnames: Option<u32> },
    /// Stack: `receiver args.. kwvalues..`.
    CallMethod {
        name: u32,
        argc: u32,
        kwnames: Option<u32>,
    },
    /// Pops `defaults` values and builds a function from `codes[code]`.
    MakeFunction { code: u32, defaults: u32 },
    Return,

    FormatValue {
        conversion: Option<char>,
        has_spec: bool,
    },
    BuildString(u32),
    AssertFail { has_msg: bool },
}

/// Literal stored in the constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Keyword argument names of a call site.
    Names(Vec<String>),
}

/// Where a closure's captured value comes from when the function is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureSource {
    /// Local slot of the defining frame.
    Local(u32),
    /// Capture slot of the defining frame.
    Capture(u32),
    /// The function object being created (recursive nested defs).
    SelfRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeObject {
    pub name: String,
    pub params: Vec<String>,
    pub num_defaults: u32,
    pub num_locals: u32,
    pub captures: Vec<CaptureSource>,
    pub ops: Vec<Op>,
    /// Source line of each op.
    pub lines: Vec<u32>,
}

impl CodeObject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            num_defaults: 0,
            num_locals: 0,
            captures: Vec::new(),
            ops: Vec::new(),
            lines: Vec::new(),
        }
    }

    pub fn line_at(&self, ip: usize) -> u32 {
        self.lines.get(ip).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledProgram {
    /// `codes[0]` is the module body.
    pub codes: Vec<CodeObject>,
    pub constants: Vec<Constant>,
    pub names: Vec<String>,
    /// Host functions the program may call; calling one pauses execution.
    pub externals: Vec<String>,
}

impl CompiledProgram {
    pub const MODULE: u32 = 0;

    /// Serialize the compiled program.
    pub fn dump(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn load(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn is_external(&self, name: &str) -> bool {
        self.externals.iter().any(|e| e == name)
    }

    pub fn name(&self, idx: u32) -> &str {
        self.names.get(idx as usize).map(String::as_str).unwrap_or("")
    }

    pub fn op_count(&self) -> usize {
        self.codes.iter().map(|c| c.ops.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_load() {
        let mut code = CodeObject::new("<module>");
        code.ops = vec![Op::Const(0), Op::Return];
        code.lines = vec![1, 1];
        let program = CompiledProgram {
            codes: vec![code],
            constants: vec![Constant::Float(0.5)],
            names: vec![],
            externals: vec!["count".into()],
        };
        let bytes = program.dump().unwrap();
        assert_eq!(CompiledProgram::load(&bytes).unwrap(), program);
        assert!(program.is_external("count"));
        assert_eq!(program.op_count(), 2);
    }
}
