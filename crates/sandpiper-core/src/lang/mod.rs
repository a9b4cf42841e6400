//! Sandboxed interpreter for a restricted Python subset.
//!
//! Source is tokenized ([`lexer`]), parsed into an AST ([`parser`]) and
//! compiled to a flat instruction list ([`compiler`]). The [`vm`] runs the
//! compiled program under resource limits and pauses whenever the program
//! calls one of the host functions declared at compile time.
//!
//! # Modules
//!
//! - [`lexer`]: logos token stream with indentation tracking
//! - [`parser`]: recursive descent / Pratt parser producing [`ast::Module`]
//! - [`compiler`]: scope resolution and bytecode emission
//! - [`vm`]: stack machine, `run()` / [`vm::Suspended::resume`]
//! - [`value`]: runtime and host-boundary value types
//! - [`format`]: `repr`, f-string specs, `%` and `str.format`

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod format;
pub mod lexer;
pub mod parser;
pub mod value;
pub mod vm;

mod builtins;
mod methods;

pub use bytecode::CompiledProgram;
pub use error::{Fault, ResourceKind};
pub use value::Object;
pub use vm::{run, ExternalCall, InterruptFlag, Limits, RunOutcome, Suspended};

/// Parse and compile `source`. Calls to any name in `externals` pause the
/// program and surface as [`ExternalCall`]s.
pub fn compile(source: &str, externals: &[&str]) -> Result<CompiledProgram, Fault> {
    let module = parser::parse(source)?;
    let externals: Vec<String> = externals.iter().map(|s| s.to_string()).collect();
    compiler::compile_module(&module, &externals)
}
