//! In-memory fakes for storage traits
//!
//! Provides `MemoryConversationStore`, which satisfies the
//! [`ConversationStore`] contract without any external dependencies.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

#[derive(Debug)]
struct ConversationState {
    record: ConversationRecord,
    messages: Vec<MessageRecord>,
    artifact_ids: Vec<String>,
    turns: Vec<TurnRecord>,
}

#[derive(Debug, Default)]
struct Inner {
    conversations: HashMap<String, ConversationState>,
    artifacts: HashMap<String, ArtifactRecord>,
}

impl Inner {
    fn conversation_mut(&mut self, id: &ConversationId) -> StorageResult<&mut ConversationState> {
        self.conversations
            .get_mut(&id.0)
            .ok_or_else(|| StorageError::ConversationNotFound {
                conversation_id: id.0.clone(),
            })
    }

    fn conversation(&self, id: &ConversationId) -> StorageResult<&ConversationState> {
        self.conversations
            .get(&id.0)
            .ok_or_else(|| StorageError::ConversationNotFound {
                conversation_id: id.0.clone(),
            })
    }
}

/// In-memory conversation store keyed by conversation id.
#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    inner: Mutex<Inner>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create_conversation(&self, title: &str) -> StorageResult<ConversationRecord> {
        let now = Utc::now();
        let record = ConversationRecord {
            id: ConversationId::new(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.conversations.insert(
            record.id.0.clone(),
            ConversationState {
                record: record.clone(),
                messages: Vec::new(),
                artifact_ids: Vec::new(),
                turns: Vec::new(),
            },
        );
        Ok(record)
    }

    async fn get_conversation(&self, id: &ConversationId) -> StorageResult<ConversationRecord> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.conversation(id)?.record.clone())
    }

    async fn list_conversations(&self) -> StorageResult<Vec<ConversationRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<ConversationRecord> = inner
            .conversations
            .values()
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    async fn update_title(&self, id: &ConversationId, title: &str) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.conversation_mut(id)?;
        state.record.title = title.to_string();
        state.record.updated_at = Utc::now();
        Ok(())
    }

    async fn add_message(
        &self,
        id: &ConversationId,
        role: MessageRole,
        content: &str,
    ) -> StorageResult<MessageRecord> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.conversation_mut(id)?;
        let now = Utc::now();
        let message = MessageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: id.clone(),
            role,
            content: content.to_string(),
            created_at: now,
        };
        state.messages.push(message.clone());
        state.record.updated_at = now;
        Ok(message)
    }

    async fn get_messages(&self, id: &ConversationId) -> StorageResult<Vec<MessageRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.conversation(id)?.messages.clone())
    }

    async fn append_artifact(&self, artifact: ArtifactRecord) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.artifacts.contains_key(&artifact.id) {
            return Err(StorageError::Backend(format!(
                "artifact {} already exists",
                artifact.id
            )));
        }
        inner
            .conversation_mut(&artifact.conversation_id)?
            .artifact_ids
            .push(artifact.id.clone());
        inner.artifacts.insert(artifact.id.clone(), artifact);
        Ok(())
    }

    async fn get_artifact(&self, artifact_id: &str) -> StorageResult<ArtifactRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .artifacts
            .get(artifact_id)
            .cloned()
            .ok_or_else(|| StorageError::ArtifactNotFound {
                artifact_id: artifact_id.to_string(),
            })
    }

    async fn list_artifacts(&self, id: &ConversationId) -> StorageResult<Vec<ArtifactRecord>> {
        let inner = self.inner.lock().unwrap();
        let state = inner.conversation(id)?;
        Ok(state
            .artifact_ids
            .iter()
            .filter_map(|aid| inner.artifacts.get(aid).cloned())
            .collect())
    }

    async fn append_turn(&self, turn: TurnRecord) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.conversation_mut(&turn.conversation_id)?;
        state.record.updated_at = Utc::now();
        state.turns.push(turn);
        Ok(())
    }

    async fn list_turns(&self, id: &ConversationId) -> StorageResult<Vec<TurnRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.conversation(id)?.turns.clone())
    }
}
