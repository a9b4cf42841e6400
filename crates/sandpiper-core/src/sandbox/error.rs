//! Validation failures of the bounded operations.

use crate::lang::Object;

/// A request the dispatcher refuses to forward to the store.
///
/// These never abort an execution: they are handed back to the program as
/// an ordinary value (see [`ValidationFault::to_object`]).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationFault {
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Unknown table: {table}. Available: {}", .available.join(", "))]
    UnknownTable {
        table: String,
        available: Vec<String>,
    },

    #[error("Unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("{operation}() missing required argument: '{param}'")]
    MissingArgument { operation: String, param: String },

    #[error("{operation}() got an unexpected keyword argument '{param}'")]
    UnexpectedArgument { operation: String, param: String },

    #[error("{operation}() takes at most {max} positional argument(s) ({given} given)")]
    TooManyArguments {
        operation: String,
        max: usize,
        given: usize,
    },

    #[error("{operation}() got multiple values for argument '{param}'")]
    DuplicateArgument { operation: String, param: String },

    #[error("Invalid argument '{param}': {reason}")]
    InvalidArgument { param: String, reason: String },

    #[error("Only equality filters are supported; column '{column}' was given a {found}")]
    NonEqualityFilter { column: String, found: String },

    #[error("Invalid identifier: '{0}'")]
    InvalidIdentifier(String),

    #[error("Invalid order_by: '{0}'. Expected 'column' or 'column ASC|DESC'")]
    InvalidOrderBy(String),

    #[error("limit must be between 1 and {max} (got {given})")]
    LimitOutOfRange { given: i64, max: usize },
}

impl ValidationFault {
    /// The value injected into the program in place of a result.
    pub fn to_object(&self) -> Object {
        Object::Dict(vec![
            (Object::str("error"), Object::str(self.to_string())),
            (Object::str("error_kind"), Object::str("validation")),
        ])
    }
}
