//! The four bounded operations and their parameter lists.

use serde::{Deserialize, Serialize};

/// An operation sandboxed code may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Tables,
    Describe,
    Count,
    Fetch,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Tables,
        Operation::Describe,
        Operation::Count,
        Operation::Fetch,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Tables => "tables",
            Operation::Describe => "describe",
            Operation::Count => "count",
            Operation::Fetch => "fetch",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    /// Parameter names in positional order.
    pub fn params(&self) -> &'static [&'static str] {
        match self {
            Operation::Tables => &[],
            Operation::Describe => &["table"],
            Operation::Count => &["table", "where"],
            Operation::Fetch => &["table", "columns", "where", "order_by", "limit"],
        }
    }

    /// Names the interpreter must treat as host calls.
    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(Operation::name).collect()
    }
}

/// Keyword accepted in place of `table`.
pub const TABLE_ALIAS: &str = "table_name";

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trips_names() {
        for op in Operation::ALL {
            assert_eq!(Operation::parse(op.name()), Some(op));
        }
        assert_eq!(Operation::parse("query"), None);
        assert_eq!(Operation::names(), vec!["tables", "describe", "count", "fetch"]);
    }

    #[test]
    fn test_fetch_params_order() {
        assert_eq!(
            Operation::Fetch.params(),
            &["table", "columns", "where", "order_by", "limit"]
        );
        assert!(Operation::Tables.params().is_empty());
    }
}
