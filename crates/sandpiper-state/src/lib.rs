//! Sandpiper-State: storage layer for Sandpiper
//!
//! ## Key Components
//!
//! - `TableStore` / `MemoryTableStore`: the read-only columnar store behind
//!   the bounded data access layer
//! - `loader`: builds a `MemoryTableStore` from JSON / NDJSON dataset files
//! - `ConversationStore`: append-only conversation history, with an
//!   in-memory fake and a SurrealDB implementation

mod error;
pub mod fakes;
pub mod loader;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;
pub mod table;

pub use error::{StateError, StorageError};
pub use fakes::MemoryConversationStore;
pub use storage_traits::{
    ArtifactRecord, Cell, ColumnInfo, ColumnType, ConversationId, ConversationRecord,
    ConversationStore, EqualityFilter, FetchQuery, MessageRecord, MessageRole, OrderBy, Row,
    SortDirection, StorageResult, TableStore, TurnRecord, TurnStatus, DEFAULT_CONVERSATION_TITLE,
};
pub use surreal_store::SurrealConversationStore;
pub use table::{MemoryTableStore, Table};

/// Result type for sandpiper-state operations
pub type Result<T> = std::result::Result<T, StateError>;
