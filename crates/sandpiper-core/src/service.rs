//! Conversation service: turns, history and replay over one engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sandpiper_state::{
    ArtifactRecord, ConversationId, ConversationRecord, ConversationStore, MessageRecord,
    MessageRole, TableStore, TurnRecord, TurnStatus, DEFAULT_CONVERSATION_TITLE,
};

use crate::config::EngineConfig;
use crate::domain::Result;
use crate::obs::TurnSpan;
use crate::sandbox::{Dispatcher, Executor, FetchPolicy};
use crate::turn::prompt::{build_prompt, derive_title};
use crate::turn::{
    spawn_turn, ModelClient, TurnContext, TurnEvent, TurnOrchestrator, TurnOutcome, TurnStream,
};

/// A conversation with its full history. Artifact snapshots are stripped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationDetail {
    pub conversation: ConversationRecord,
    pub messages: Vec<MessageRecord>,
    pub artifacts: Vec<ArtifactRecord>,
    pub turns: Vec<TurnRecord>,
}

/// Fresh result of re-running a stored artifact. Nothing is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayResult {
    pub artifact_id: String,
    pub code: String,
    pub result: Option<Json>,
    pub result_kind: String,
    pub error: Option<String>,
    pub stdout: String,
}

pub struct ChatService {
    conversations: Arc<dyn ConversationStore>,
    executor: Arc<Executor>,
    orchestrator: Arc<TurnOrchestrator>,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn TableStore>,
        conversations: Arc<dyn ConversationStore>,
        model: Arc<dyn ModelClient>,
        config: EngineConfig,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            store,
            FetchPolicy::new(config.max_fetch_limit),
        ));
        let executor = Arc::new(
            Executor::new(dispatcher, config.interpreter_limits())
                .with_dispatch_timeout(config.dispatch_timeout()),
        );
        let orchestrator = Arc::new(TurnOrchestrator::new(
            model,
            Arc::clone(&executor),
            Arc::clone(&conversations),
            config,
        ));
        Self {
            conversations,
            executor,
            orchestrator,
        }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Record `message` and start a turn for it.
    ///
    /// The returned stream yields `init` first, then the turn's events.
    /// A missing `conversation_id` creates a new conversation.
    pub async fn start_turn(
        &self,
        conversation_id: Option<ConversationId>,
        message: &str,
    ) -> Result<TurnStream> {
        let conversation = match conversation_id {
            Some(id) => self.conversations.get_conversation(&id).await?,
            None => {
                self.conversations
                    .create_conversation(DEFAULT_CONVERSATION_TITLE)
                    .await?
            }
        };
        let id = conversation.id.clone();

        self.conversations
            .add_message(&id, MessageRole::User, message)
            .await?;
        let history = self.conversations.get_messages(&id).await?;

        let ctx = TurnContext {
            conversation_id: id.clone(),
            turn_id: uuid::Uuid::new_v4().to_string(),
            prompt: build_prompt(&history, message),
        };
        info!(conversation_id = %id, turn_id = %ctx.turn_id, "starting turn");

        let orchestrator = Arc::clone(&self.orchestrator);
        let conversations = Arc::clone(&self.conversations);
        let message = message.to_string();
        let retitle = conversation.title == DEFAULT_CONVERSATION_TITLE;
        let span = TurnSpan::new(&id.0, &ctx.turn_id);

        Ok(spawn_turn(move |sink, cancel| {
            span.instrument(async move {
                let init = TurnEvent::Init {
                    conversation_id: ctx.conversation_id.0.clone(),
                };
                if !sink.emit(init) {
                    return;
                }
                let outcome = orchestrator.run(&ctx, &sink, &cancel).await;
                record_outcome(conversations.as_ref(), &ctx, &outcome, &message, retitle).await;
            })
        }))
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationRecord>> {
        Ok(self.conversations.list_conversations().await?)
    }

    pub async fn get_conversation(&self, id: &ConversationId) -> Result<ConversationDetail> {
        let conversation = self.conversations.get_conversation(id).await?;
        let messages = self.conversations.get_messages(id).await?;
        let artifacts = self
            .conversations
            .list_artifacts(id)
            .await?
            .into_iter()
            .map(without_snapshot)
            .collect();
        let turns = self.conversations.list_turns(id).await?;
        Ok(ConversationDetail {
            conversation,
            messages,
            artifacts,
            turns,
        })
    }

    pub async fn get_artifact(&self, artifact_id: &str) -> Result<ArtifactRecord> {
        Ok(without_snapshot(
            self.conversations.get_artifact(artifact_id).await?,
        ))
    }

    /// Re-run a stored artifact against the current store.
    ///
    /// Uses the compiled snapshot when present (checking its digest) and
    /// recompiles the source otherwise.
    pub async fn replay(&self, artifact_id: &str) -> Result<ReplayResult> {
        let record = self.conversations.get_artifact(artifact_id).await?;
        let cancel = CancellationToken::new();
        let report = match &record.program_snapshot {
            Some(snapshot) => {
                self.executor
                    .replay(
                        &record.code,
                        snapshot,
                        record.snapshot_digest.as_deref(),
                        &cancel,
                    )
                    .await?
            }
            None => self.executor.execute(&record.code, &cancel).await,
        };
        if let Some(fault) = report.upstream {
            return Err(fault.into());
        }

        let artifact = report.artifact;
        Ok(ReplayResult {
            artifact_id: record.id,
            code: record.code,
            result: artifact.result.to_json(),
            result_kind: artifact.result_kind().as_str().to_string(),
            error: artifact.error,
            stdout: artifact.stdout,
        })
    }
}

/// Store the assistant reply and retitle the conversation after a turn that
/// was not cancelled.
async fn record_outcome(
    conversations: &dyn ConversationStore,
    ctx: &TurnContext,
    outcome: &TurnOutcome,
    message: &str,
    retitle: bool,
) {
    if outcome.status == TurnStatus::Cancelled {
        return;
    }
    let id = &ctx.conversation_id;
    if !outcome.narration.trim().is_empty() {
        if let Err(err) = conversations
            .add_message(id, MessageRole::Assistant, &outcome.narration)
            .await
        {
            warn!(error = %err, "failed to store assistant message");
        }
    }
    if retitle {
        if let Err(err) = conversations.update_title(id, &derive_title(message)).await {
            warn!(error = %err, "failed to update conversation title");
        }
    }
}

fn without_snapshot(mut record: ArtifactRecord) -> ArtifactRecord {
    record.program_snapshot = None;
    record
}
