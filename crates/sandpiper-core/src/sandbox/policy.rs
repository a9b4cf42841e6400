//! Fetch bounds.

use serde::{Deserialize, Serialize};

use super::error::ValidationFault;

/// Bounds applied to `fetch` before it reaches the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPolicy {
    pub max_limit: usize,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self { max_limit: 10_000 }
    }
}

impl FetchPolicy {
    pub fn new(max_limit: usize) -> Self {
        Self { max_limit }
    }

    /// A missing limit is capped to `max_limit`; an explicit one must lie in
    /// `1..=max_limit`.
    pub fn resolve_limit(&self, requested: Option<i64>) -> Result<usize, ValidationFault> {
        match requested {
            None => Ok(self.max_limit),
            Some(n) if n >= 1 && (n as u64) <= self.max_limit as u64 => Ok(n as usize),
            Some(n) => Err(ValidationFault::LimitOutOfRange {
                given: n,
                max: self.max_limit,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_limit() {
        let policy = FetchPolicy::new(100);
        assert_eq!(policy.resolve_limit(None), Ok(100));
        assert_eq!(policy.resolve_limit(Some(5)), Ok(5));
        assert_eq!(policy.resolve_limit(Some(100)), Ok(100));
        assert_eq!(
            policy.resolve_limit(Some(101)),
            Err(ValidationFault::LimitOutOfRange {
                given: 101,
                max: 100
            })
        );
        assert!(policy.resolve_limit(Some(0)).is_err());
        assert!(policy.resolve_limit(Some(-3)).is_err());
    }
}
