//! Engine-level error taxonomy.

use sandpiper_state::StorageError;

/// A collaborator the turn depends on is unavailable. Aborts the turn.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UpstreamFault {
    #[error("model unavailable: {0}")]
    Model(String),

    #[error("data store unavailable: {0}")]
    Store(String),
}

/// Sandpiper core errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Upstream(#[from] UpstreamFault),

    #[error("invalid program snapshot: {0}")]
    Snapshot(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_display() {
        let err = CoreError::Config("max_fetch_limit must be greater than zero".into());
        assert!(err.to_string().starts_with("configuration error"));

        let err: CoreError = UpstreamFault::Model("connection reset".into()).into();
        assert_eq!(err.to_string(), "model unavailable: connection reset");

        let err: CoreError = StorageError::ArtifactNotFound {
            artifact_id: "a-1".into(),
        }
        .into();
        assert!(err.to_string().contains("artifact not found: a-1"));
    }

    #[test]
    fn test_digest_mismatch_error() {
        let err = CoreError::DigestMismatch {
            expected: "abc123".into(),
            actual: "def456".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("abc123"));
        assert!(msg.contains("def456"));
    }
}
