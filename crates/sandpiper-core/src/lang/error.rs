//! Fault taxonomy of the restricted-language interpreter.

use serde::{Deserialize, Serialize};

/// Which resource limit was breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Timeout,
    Memory,
    Allocations,
    Recursion,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Timeout => write!(f, "time limit exceeded"),
            ResourceKind::Memory => write!(f, "memory limit exceeded"),
            ResourceKind::Allocations => write!(f, "allocation limit exceeded"),
            ResourceKind::Recursion => write!(f, "maximum recursion depth exceeded"),
        }
    }
}

/// Every way a program can fail to produce a value.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum Fault {
    /// Syntax error or use of a forbidden construct.
    #[error("Syntax error: {message} (line {line})")]
    Compile { message: String, line: u32 },

    /// Uncaught error raised while running. `line` is filled in by the VM loop.
    #[error("Runtime error: {message}{}", .line.map(|l| format!(" (line {l})")).unwrap_or_default())]
    Runtime { message: String, line: Option<u32> },

    #[error("Resource limit exceeded: {0}")]
    ResourceExceeded(ResourceKind),

    #[error("Execution cancelled")]
    Cancelled,
}

impl Fault {
    pub fn compile(message: impl Into<String>, line: u32) -> Self {
        Fault::Compile {
            message: message.into(),
            line,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Fault::Runtime {
            message: message.into(),
            line: None,
        }
    }

    pub fn type_error(message: impl std::fmt::Display) -> Self {
        Fault::runtime(format!("TypeError: {message}"))
    }

    pub fn value_error(message: impl std::fmt::Display) -> Self {
        Fault::runtime(format!("ValueError: {message}"))
    }

    pub fn index_error(message: impl std::fmt::Display) -> Self {
        Fault::runtime(format!("IndexError: {message}"))
    }

    pub fn key_error(message: impl std::fmt::Display) -> Self {
        Fault::runtime(format!("KeyError: {message}"))
    }

    pub fn name_error(name: &str) -> Self {
        Fault::runtime(format!("NameError: name '{name}' is not defined"))
    }

    pub fn zero_division() -> Self {
        Fault::runtime("ZeroDivisionError: division by zero")
    }

    pub fn overflow() -> Self {
        Fault::runtime("OverflowError: integer overflow")
    }

    /// Attach a source line to a runtime fault that does not have one yet.
    pub fn at_line(self, at: u32) -> Self {
        match self {
            Fault::Runtime {
                message,
                line: None,
            } => Fault::Runtime {
                message,
                line: Some(at),
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display() {
        assert_eq!(
            Fault::compile("'import' is not allowed", 3).to_string(),
            "Syntax error: 'import' is not allowed (line 3)"
        );
        assert_eq!(
            Fault::zero_division().at_line(2).to_string(),
            "Runtime error: ZeroDivisionError: division by zero (line 2)"
        );
        assert_eq!(
            Fault::ResourceExceeded(ResourceKind::Timeout).to_string(),
            "Resource limit exceeded: time limit exceeded"
        );
    }

    #[test]
    fn test_at_line_keeps_existing_line() {
        let fault = Fault::runtime("boom").at_line(1).at_line(9);
        assert_eq!(
            fault,
            Fault::Runtime {
                message: "boom".into(),
                line: Some(1)
            }
        );
    }
}
