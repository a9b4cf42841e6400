//! SurrealDB row types
//!
//! These mirror the `storage_traits` records but carry the SurrealDB record
//! id and use SurrealDB's native datetime encoding. Conversion happens at the
//! `surreal_store` boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Conversation header row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRow {
    /// SurrealDB record ID, assigned on insert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub conversation_id: String,
    pub title: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl ConversationRow {
    pub fn new(conversation_id: String, title: String) -> Self {
        let now = Utc::now();
        ConversationRow {
            id: None,
            conversation_id,
            title,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Message row. `ordinal` preserves insertion order when timestamps tie.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub message_id: String,
    pub conversation_id: String,
    /// "user" | "assistant"
    pub role: String,
    pub content: String,
    pub ordinal: u64,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

/// Artifact row. The program snapshot is stored hex-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub artifact_id: String,
    pub conversation_id: String,
    pub turn_id: String,
    pub seq: u64,
    pub code: String,
    pub result: Option<serde_json::Value>,
    pub result_kind: String,
    pub error: Option<String>,
    pub stdout: String,
    #[serde(default)]
    pub timing: serde_json::Value,
    pub program_snapshot: Option<String>,
    pub snapshot_digest: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

/// Turn row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub turn_id: String,
    pub conversation_id: String,
    /// "completed" | "failed" | "cancelled"
    pub status: String,
    pub artifact_ids: Vec<String>,
    pub timing: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

/// Result row of a `count() ... GROUP ALL` query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountRow {
    pub count: u64,
}
