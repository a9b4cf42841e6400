//! SurrealDB-backed ConversationStore implementation
//!
//! Uses the row types in `schema` for persistence, converting to and from
//! `storage_traits` records at the boundary.

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::{ArtifactRow, ConversationRow, CountRow, MessageRow, TurnRow};
use crate::storage_traits::{
    ArtifactRecord, ConversationId, ConversationRecord, ConversationStore, MessageRecord,
    MessageRole, StorageResult, TurnRecord, TurnStatus,
};

fn backend(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// SurrealDB-backed implementation of [`ConversationStore`].
pub struct SurrealConversationStore {
    db: Surreal<Any>,
}

impl SurrealConversationStore {
    /// Create an in-memory instance.
    ///
    /// Connects to `mem://`, selects `sandpiper/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB endpoint (`mem://`, `surrealkv://path`, `ws://host`).
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {url}: {e}")))?;

        db.use_ns("sandpiper")
            .use_db("main")
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        info!("SurrealConversationStore connected ({})", url);
        Ok(Self { db })
    }

    /// Open local persistence under `path`, creating the directory if needed.
    pub async fn local(path: &std::path::Path) -> crate::Result<Self> {
        std::fs::create_dir_all(path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::connect(&format!("surrealkv://{}", path.display())).await
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_conversation(&self, cid: &str) -> StorageResult<ConversationRow> {
        let mut res = self
            .db
            .query("SELECT * FROM conversations WHERE conversation_id = $cid")
            .bind(("cid", cid.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<ConversationRow> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::ConversationNotFound {
                conversation_id: cid.to_string(),
            })
    }

    async fn touch(&self, cid: &str) -> StorageResult<()> {
        self.db
            .query("UPDATE conversations SET updated_at = time::now() WHERE conversation_id = $cid")
            .bind(("cid", cid.to_string()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn message_count(&self, cid: &str) -> StorageResult<u64> {
        let mut res = self
            .db
            .query("SELECT count() FROM messages WHERE conversation_id = $cid GROUP ALL")
            .bind(("cid", cid.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<CountRow> = res.take(0).map_err(backend)?;
        Ok(rows.first().map(|r| r.count).unwrap_or(0))
    }

    fn row_to_conversation(row: ConversationRow) -> ConversationRecord {
        ConversationRecord {
            id: ConversationId(row.conversation_id),
            title: row.title,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }

    fn row_to_message(row: MessageRow) -> StorageResult<MessageRecord> {
        let role = match row.role.as_str() {
            "user" => MessageRole::User,
            "assistant" => MessageRole::Assistant,
            other => return Err(StorageError::Backend(format!("unknown message role: {other}"))),
        };
        Ok(MessageRecord {
            id: row.message_id,
            conversation_id: ConversationId(row.conversation_id),
            role,
            content: row.content,
            created_at: row.created_at,
        })
    }

    fn artifact_to_row(record: ArtifactRecord) -> ArtifactRow {
        ArtifactRow {
            id: None,
            artifact_id: record.id,
            conversation_id: record.conversation_id.0,
            turn_id: record.turn_id,
            seq: record.seq,
            code: record.code,
            result: record.result,
            result_kind: record.result_kind,
            error: record.error,
            stdout: record.stdout,
            timing: record.timing,
            program_snapshot: record.program_snapshot.map(hex::encode),
            snapshot_digest: record.snapshot_digest,
            created_at: record.created_at,
        }
    }

    fn row_to_artifact(row: ArtifactRow) -> StorageResult<ArtifactRecord> {
        let program_snapshot = row
            .program_snapshot
            .map(hex::decode)
            .transpose()
            .map_err(|e| StorageError::Backend(format!("corrupt program snapshot: {e}")))?;
        Ok(ArtifactRecord {
            id: row.artifact_id,
            conversation_id: ConversationId(row.conversation_id),
            turn_id: row.turn_id,
            seq: row.seq,
            code: row.code,
            result: row.result,
            result_kind: row.result_kind,
            error: row.error,
            stdout: row.stdout,
            timing: row.timing,
            program_snapshot,
            snapshot_digest: row.snapshot_digest,
            created_at: row.created_at,
        })
    }

    fn row_to_turn(row: TurnRow) -> StorageResult<TurnRecord> {
        let status = match row.status.as_str() {
            "completed" => TurnStatus::Completed,
            "failed" => TurnStatus::Failed,
            "cancelled" => TurnStatus::Cancelled,
            other => return Err(StorageError::Backend(format!("unknown turn status: {other}"))),
        };
        Ok(TurnRecord {
            turn_id: row.turn_id,
            conversation_id: ConversationId(row.conversation_id),
            status,
            artifact_ids: row.artifact_ids,
            timing: row.timing,
            created_at: row.created_at,
        })
    }
}

fn status_str(status: TurnStatus) -> &'static str {
    match status {
        TurnStatus::Completed => "completed",
        TurnStatus::Failed => "failed",
        TurnStatus::Cancelled => "cancelled",
    }
}

#[async_trait]
impl ConversationStore for SurrealConversationStore {
    async fn create_conversation(&self, title: &str) -> StorageResult<ConversationRecord> {
        let id = ConversationId::new();
        let row = ConversationRow::new(id.0.clone(), title.to_string());

        debug!(conversation_id = %id, "creating conversation");

        let created: Option<ConversationRow> = self
            .db
            .create("conversations")
            .content(row)
            .await
            .map_err(backend)?;

        created
            .map(Self::row_to_conversation)
            .ok_or_else(|| StorageError::Backend("conversation insert returned nothing".into()))
    }

    async fn get_conversation(&self, id: &ConversationId) -> StorageResult<ConversationRecord> {
        self.fetch_conversation(&id.0)
            .await
            .map(Self::row_to_conversation)
    }

    async fn list_conversations(&self) -> StorageResult<Vec<ConversationRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM conversations ORDER BY updated_at DESC")
            .await
            .map_err(backend)?;
        let rows: Vec<ConversationRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().map(Self::row_to_conversation).collect())
    }

    async fn update_title(&self, id: &ConversationId, title: &str) -> StorageResult<()> {
        self.fetch_conversation(&id.0).await?;
        self.db
            .query(
                "UPDATE conversations SET title = $title, updated_at = time::now() \
                 WHERE conversation_id = $cid",
            )
            .bind(("title", title.to_string()))
            .bind(("cid", id.0.clone()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn add_message(
        &self,
        id: &ConversationId,
        role: MessageRole,
        content: &str,
    ) -> StorageResult<MessageRecord> {
        self.fetch_conversation(&id.0).await?;
        let ordinal = self.message_count(&id.0).await?;

        let row = MessageRow {
            id: None,
            message_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: id.0.clone(),
            role: role.to_string(),
            content: content.to_string(),
            ordinal,
            created_at: chrono::Utc::now(),
        };

        let created: Option<MessageRow> = self
            .db
            .create("messages")
            .content(row)
            .await
            .map_err(backend)?;
        self.touch(&id.0).await?;

        created
            .ok_or_else(|| StorageError::Backend("message insert returned nothing".into()))
            .and_then(Self::row_to_message)
    }

    async fn get_messages(&self, id: &ConversationId) -> StorageResult<Vec<MessageRecord>> {
        self.fetch_conversation(&id.0).await?;
        let mut res = self
            .db
            .query("SELECT * FROM messages WHERE conversation_id = $cid ORDER BY ordinal ASC")
            .bind(("cid", id.0.clone()))
            .await
            .map_err(backend)?;
        let rows: Vec<MessageRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(Self::row_to_message).collect()
    }

    async fn append_artifact(&self, artifact: ArtifactRecord) -> StorageResult<()> {
        self.fetch_conversation(&artifact.conversation_id.0).await?;

        debug!(artifact_id = %artifact.id, turn_id = %artifact.turn_id, "appending artifact");

        let _created: Option<ArtifactRow> = self
            .db
            .create("artifacts")
            .content(Self::artifact_to_row(artifact))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_artifact(&self, artifact_id: &str) -> StorageResult<ArtifactRecord> {
        let mut res = self
            .db
            .query("SELECT * FROM artifacts WHERE artifact_id = $aid")
            .bind(("aid", artifact_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<ArtifactRow> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::ArtifactNotFound {
                artifact_id: artifact_id.to_string(),
            })
            .and_then(Self::row_to_artifact)
    }

    async fn list_artifacts(&self, id: &ConversationId) -> StorageResult<Vec<ArtifactRecord>> {
        self.fetch_conversation(&id.0).await?;
        let mut res = self
            .db
            .query(
                "SELECT * FROM artifacts WHERE conversation_id = $cid \
                 ORDER BY created_at ASC, seq ASC",
            )
            .bind(("cid", id.0.clone()))
            .await
            .map_err(backend)?;
        let rows: Vec<ArtifactRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(Self::row_to_artifact).collect()
    }

    async fn append_turn(&self, turn: TurnRecord) -> StorageResult<()> {
        self.fetch_conversation(&turn.conversation_id.0).await?;
        let cid = turn.conversation_id.0.clone();

        let row = TurnRow {
            id: None,
            turn_id: turn.turn_id,
            conversation_id: turn.conversation_id.0,
            status: status_str(turn.status).to_string(),
            artifact_ids: turn.artifact_ids,
            timing: turn.timing,
            created_at: turn.created_at,
        };

        let _created: Option<TurnRow> = self
            .db
            .create("turns")
            .content(row)
            .await
            .map_err(backend)?;
        self.touch(&cid).await
    }

    async fn list_turns(&self, id: &ConversationId) -> StorageResult<Vec<TurnRecord>> {
        self.fetch_conversation(&id.0).await?;
        let mut res = self
            .db
            .query("SELECT * FROM turns WHERE conversation_id = $cid ORDER BY created_at ASC")
            .bind(("cid", id.0.clone()))
            .await
            .map_err(backend)?;
        let rows: Vec<TurnRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(Self::row_to_turn).collect()
    }
}
