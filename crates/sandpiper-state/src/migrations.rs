//! SurrealDB schema initialization
//!
//! Defines the conversation history tables with their unique and ordering
//! indexes. Safe to call multiple times.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Sandpiper tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Sandpiper SurrealDB schema");

    init_conversations_table(db).await?;
    init_messages_table(db).await?;
    init_artifacts_table(db).await?;
    init_turns_table(db).await?;

    info!("Sandpiper schema initialization complete");
    Ok(())
}

/// Initialize `conversations` table
///
/// ```text
/// TABLE conversations {
///   conversation_id: STRING (unique)
///   title:           STRING
///   created_at:      DATETIME
///   updated_at:      DATETIME (indexed)
/// }
/// ```
async fn init_conversations_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing conversations table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS conversations SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_conversation_id ON TABLE conversations COLUMNS conversation_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_updated_at ON TABLE conversations COLUMNS updated_at;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// Initialize `messages` table
///
/// `(conversation_id, ordinal)` is unique; messages are append-only.
async fn init_messages_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing messages table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS messages SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_message_id ON TABLE messages COLUMNS message_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_conversation_ordinal ON TABLE messages COLUMNS conversation_id, ordinal UNIQUE;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// Initialize `artifacts` table
///
/// Artifacts are immutable: no update or delete permission.
async fn init_artifacts_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing artifacts table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS artifacts SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_artifact_id ON TABLE artifacts COLUMNS artifact_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_artifact_conversation ON TABLE artifacts COLUMNS conversation_id;
        DEFINE INDEX IF NOT EXISTS idx_turn_seq ON TABLE artifacts COLUMNS turn_id, seq UNIQUE;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// Initialize `turns` table
async fn init_turns_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing turns table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS turns SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_turn_id ON TABLE turns COLUMNS turn_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_turn_conversation ON TABLE turns COLUMNS conversation_id;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}
