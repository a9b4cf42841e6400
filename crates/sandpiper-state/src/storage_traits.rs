//! Storage trait definitions for Sandpiper
//!
//! These traits define the two storage collaborators of the engine:
//! - `TableStore`: the read-only backing store of the bounded data access
//!   layer (list tables, describe, count and fetch under equality filters)
//! - `ConversationStore`: append-only persistence of conversations,
//!   messages, artifacts and turn records
//!
//! All traits are async and backend-agnostic. In-memory implementations
//! live in `table` and `fakes`; `surreal_store` persists conversations to
//! SurrealDB.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// TableStore: bounded, read-only data access
// ---------------------------------------------------------------------------

/// Declared type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnType {
    Bigint,
    Double,
    Varchar,
    Boolean,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::Bigint => write!(f, "BIGINT"),
            ColumnType::Double => write!(f, "DOUBLE"),
            ColumnType::Varchar => write!(f, "VARCHAR"),
            ColumnType::Boolean => write!(f, "BOOLEAN"),
        }
    }
}

/// Column name and declared type, as returned by `describe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub column_name: String,
    pub column_type: ColumnType,
}

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Cell {
    /// Equality as used by filters: numeric cells compare across int/float.
    pub fn matches(&self, other: &Cell) -> bool {
        match (self, other) {
            (Cell::Int(a), Cell::Float(b)) | (Cell::Float(b), Cell::Int(a)) => (*a as f64) == *b,
            (Cell::Bool(a), Cell::Int(b)) | (Cell::Int(b), Cell::Bool(a)) => (*a as i64) == *b,
            _ => self == other,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

impl From<&Cell> for serde_json::Value {
    fn from(cell: &Cell) -> Self {
        match cell {
            Cell::Null => serde_json::Value::Null,
            Cell::Bool(b) => serde_json::Value::Bool(*b),
            Cell::Int(i) => serde_json::Value::from(*i),
            Cell::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Cell::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// One fetched row: `(column, value)` pairs in projection order.
pub type Row = Vec<(String, Cell)>;

/// Conjunction of `column = value` terms. A `Null` value means `IS NULL`.
///
/// Ranges and disjunctions are not expressible.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EqualityFilter {
    pub terms: Vec<(String, Cell)>,
}

impl EqualityFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a term and return `self` (builder pattern).
    pub fn with_term(mut self, column: impl Into<String>, value: Cell) -> Self {
        self.terms.push((column.into(), value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// Sort direction for `fetch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Single-column ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

/// A fully validated fetch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchQuery {
    pub table: String,
    /// Projection; `None` selects every column in declaration order.
    pub columns: Option<Vec<String>>,
    pub filter: EqualityFilter,
    pub order_by: Option<OrderBy>,
    pub limit: usize,
}

/// Read-only columnar backing store.
///
/// Guarantees:
/// - Operations never mutate stored data; concurrent readers need no locking.
/// - `fetch` returns rows in table order unless `order_by` is given, and
///   never more than `limit` rows.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Names of all tables, sorted.
    async fn table_names(&self) -> StorageResult<Vec<String>>;

    /// Column metadata for a table. `TableNotFound` if absent.
    async fn describe(&self, table: &str) -> StorageResult<Vec<ColumnInfo>>;

    /// Number of rows matching the filter.
    async fn count(&self, table: &str, filter: &EqualityFilter) -> StorageResult<u64>;

    /// Rows matching the query.
    async fn fetch(&self, query: &FetchQuery) -> StorageResult<Vec<Row>>;
}

// ---------------------------------------------------------------------------
// ConversationStore: append-only history
// ---------------------------------------------------------------------------

/// Unique identifier for a conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Generate a new random ConversationId
    pub fn new() -> Self {
        ConversationId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Title given to conversations until the first message renames them.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New conversation";

/// Conversation header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A stored chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Durable record of one sandboxed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub id: String,
    pub conversation_id: ConversationId,
    /// Turn that produced the artifact
    pub turn_id: String,
    /// Creation order within the turn (0-based)
    pub seq: u64,
    pub code: String,
    /// Result payload as JSON (absent for faulted or valueless runs)
    pub result: Option<serde_json::Value>,
    /// `table` | `key-value` | `scalar` | `other` | `absent`
    pub result_kind: String,
    pub error: Option<String>,
    /// Captured `print` output
    pub stdout: String,
    /// Execution timing (compile, run, per external call)
    #[serde(default)]
    pub timing: serde_json::Value,
    /// Serialized compiled program, for replay from scratch
    pub program_snapshot: Option<Vec<u8>>,
    /// SHA-256 hex digest of `program_snapshot`
    pub snapshot_digest: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Terminal status of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Record written once a turn ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: String,
    pub conversation_id: ConversationId,
    pub status: TurnStatus,
    pub artifact_ids: Vec<String>,
    /// Aggregate timing as emitted on the `done` event
    pub timing: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Append-only conversation history.
///
/// Guarantees:
/// - Messages, artifacts and turns come back in creation order.
/// - Artifacts are immutable once appended.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create a conversation with the given title.
    async fn create_conversation(&self, title: &str) -> StorageResult<ConversationRecord>;

    /// Fetch a conversation header. `ConversationNotFound` if absent.
    async fn get_conversation(&self, id: &ConversationId) -> StorageResult<ConversationRecord>;

    /// All conversations, most recently updated first.
    async fn list_conversations(&self) -> StorageResult<Vec<ConversationRecord>>;

    /// Replace the title of a conversation.
    async fn update_title(&self, id: &ConversationId, title: &str) -> StorageResult<()>;

    /// Append a message.
    async fn add_message(
        &self,
        id: &ConversationId,
        role: MessageRole,
        content: &str,
    ) -> StorageResult<MessageRecord>;

    /// Messages of a conversation in creation order.
    async fn get_messages(&self, id: &ConversationId) -> StorageResult<Vec<MessageRecord>>;

    /// Append an artifact. The owning conversation must exist.
    async fn append_artifact(&self, artifact: ArtifactRecord) -> StorageResult<()>;

    /// Fetch an artifact by id. `ArtifactNotFound` if absent.
    async fn get_artifact(&self, artifact_id: &str) -> StorageResult<ArtifactRecord>;

    /// Artifacts of a conversation in creation order.
    async fn list_artifacts(&self, id: &ConversationId) -> StorageResult<Vec<ArtifactRecord>>;

    /// Append a turn record. The owning conversation must exist.
    async fn append_turn(&self, turn: TurnRecord) -> StorageResult<()>;

    /// Turn records of a conversation in creation order.
    async fn list_turns(&self, id: &ConversationId) -> StorageResult<Vec<TurnRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_numeric_matching() {
        assert!(Cell::Int(1).matches(&Cell::Float(1.0)));
        assert!(Cell::Float(2.0).matches(&Cell::Int(2)));
        assert!(Cell::Bool(true).matches(&Cell::Int(1)));
        assert!(!Cell::Text("1".into()).matches(&Cell::Int(1)));
        assert!(Cell::Null.matches(&Cell::Null));
    }

    #[test]
    fn test_cell_untagged_serde() {
        let cells = vec![
            Cell::Null,
            Cell::Bool(true),
            Cell::Int(7),
            Cell::Float(1.5),
            Cell::Text("x".into()),
        ];
        let json = serde_json::to_string(&cells).unwrap();
        assert_eq!(json, r#"[null,true,7,1.5,"x"]"#);
    }

    #[test]
    fn test_column_type_display() {
        assert_eq!(ColumnType::Bigint.to_string(), "BIGINT");
        assert_eq!(ColumnType::Varchar.to_string(), "VARCHAR");
    }

    #[test]
    fn test_filter_builder() {
        let f = EqualityFilter::new()
            .with_term("survived", Cell::Int(1))
            .with_term("sex", Cell::Text("female".into()));
        assert_eq!(f.terms.len(), 2);
        assert!(!f.is_empty());
    }
}
