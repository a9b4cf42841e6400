//! Error types for sandpiper-state

use thiserror::Error;

/// Errors that can occur while connecting to or initializing a backend
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the storage traits
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("table not found: {table}")]
    TableNotFound { table: String },

    #[error("column not found: {table}.{column}")]
    ColumnNotFound { table: String, column: String },

    #[error("conversation not found: {conversation_id}")]
    ConversationNotFound { conversation_id: String },

    #[error("artifact not found: {artifact_id}")]
    ArtifactNotFound { artifact_id: String },

    #[error("dataset load failed for {path}: {reason}")]
    DatasetLoad { path: String, reason: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether this error reflects an unavailable backend rather than a bad request.
    pub fn is_backend(&self) -> bool {
        matches!(self, StorageError::Backend(_))
    }
}
