//! Turn orchestrator: drives one model turn and narrates it as events.

use std::sync::Arc;

use chrono::Utc;
use sandpiper_state::{ConversationId, ConversationStore, StorageError, TurnRecord, TurnStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::events::{ArtifactPayload, TurnEvent};
use super::feedback;
use super::model::{ModelBlock, ModelClient, ModelTurnProducer};
use super::multiplexer::EventSink;
use super::status::StatusTrigger;
use crate::config::EngineConfig;
use crate::domain::{Artifact, TurnClock, TurnTiming, UpstreamFault};
use crate::metrics::METRICS;
use crate::obs;
use crate::sandbox::Executor;

/// Identity and input of one turn.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub conversation_id: ConversationId,
    pub turn_id: String,
    pub prompt: String,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    pub artifact_ids: Vec<String>,
    /// Narration fragments joined by blank lines.
    pub narration: String,
    pub timing: TurnTiming,
}

enum Stop {
    Cancelled,
    Upstream(UpstreamFault),
}

struct TurnState {
    clock: TurnClock,
    artifact_ids: Vec<String>,
    narration: String,
}

pub struct TurnOrchestrator {
    model: Arc<dyn ModelClient>,
    executor: Arc<Executor>,
    conversations: Arc<dyn ConversationStore>,
    config: EngineConfig,
}

impl TurnOrchestrator {
    pub fn new(
        model: Arc<dyn ModelClient>,
        executor: Arc<Executor>,
        conversations: Arc<dyn ConversationStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            model,
            executor,
            conversations,
            config,
        }
    }

    /// Run the turn to completion, cancellation or upstream failure.
    ///
    /// A completed or failed turn always ends with a `done` event. A
    /// cancelled turn emits nothing further once cancellation is observed,
    /// but its artifacts and turn record are still stored.
    #[instrument(skip_all, fields(conversation_id = %ctx.conversation_id, turn_id = %ctx.turn_id))]
    pub async fn run(
        &self,
        ctx: &TurnContext,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        obs::emit_turn_started(&ctx.conversation_id.0, &ctx.turn_id);
        let mut state = TurnState {
            clock: TurnClock::start(),
            artifact_ids: Vec::new(),
            narration: String::new(),
        };

        let stop = self.drive(ctx, sink, cancel, &mut state).await.err();
        let TurnState {
            clock,
            artifact_ids,
            narration,
        } = state;
        let timing = clock.finish();

        let status = match stop {
            None => {
                let done = TurnEvent::Done {
                    artifact_ids: artifact_ids.clone(),
                    timing: timing.clone(),
                };
                if !cancel.is_cancelled() && sink.emit(done) {
                    METRICS.inc_turns_completed();
                    obs::emit_turn_finished(
                        &ctx.turn_id,
                        artifact_ids.len(),
                        timing.model_steps,
                        timing.total_ms,
                    );
                    TurnStatus::Completed
                } else {
                    METRICS.inc_turns_cancelled();
                    obs::emit_turn_cancelled(&ctx.turn_id);
                    TurnStatus::Cancelled
                }
            }
            Some(Stop::Cancelled) => {
                METRICS.inc_turns_cancelled();
                obs::emit_turn_cancelled(&ctx.turn_id);
                TurnStatus::Cancelled
            }
            Some(Stop::Upstream(fault)) => {
                obs::emit_turn_aborted(&ctx.turn_id, &fault);
                if !cancel.is_cancelled() {
                    sink.emit(TurnEvent::Error(fault.to_string()));
                    sink.emit(TurnEvent::Done {
                        artifact_ids: artifact_ids.clone(),
                        timing: timing.clone(),
                    });
                }
                TurnStatus::Failed
            }
        };

        let record = TurnRecord {
            turn_id: ctx.turn_id.clone(),
            conversation_id: ctx.conversation_id.clone(),
            status,
            artifact_ids: artifact_ids.clone(),
            timing: serde_json::to_value(&timing).unwrap_or_default(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.conversations.append_turn(record).await {
            warn!(error = %err, "failed to store turn record");
        }
        METRICS.flush();

        TurnOutcome {
            status,
            artifact_ids,
            narration,
            timing,
        }
    }

    async fn drive(
        &self,
        ctx: &TurnContext,
        sink: &EventSink,
        cancel: &CancellationToken,
        state: &mut TurnState,
    ) -> Result<(), Stop> {
        send(sink, cancel, StatusTrigger::TurnStarted.event())?;

        let mut producer: Box<dyn ModelTurnProducer> = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Stop::Cancelled),
            started = self.model.start_turn(&ctx.prompt) => started.map_err(Stop::Upstream)?,
        };
        send(sink, cancel, StatusTrigger::AwaitingModel.event())?;

        let mut steps = 0usize;
        loop {
            if steps >= self.config.max_model_steps {
                debug!(steps, "model step limit reached");
                send(sink, cancel, StatusTrigger::StepLimit.event())?;
                break;
            }
            let step_start = state.clock.now_ms();
            let block = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Stop::Cancelled),
                block = producer.next_block() => block.map_err(Stop::Upstream)?,
            };
            steps += 1;
            state.clock.record_model_step(step_start);

            match block {
                ModelBlock::Text { text } => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    if !state.narration.is_empty() {
                        state.narration.push_str("\n\n");
                    }
                    state.narration.push_str(&text);
                    send(sink, cancel, TurnEvent::Text(text))?;
                }
                ModelBlock::Code { id, code } => {
                    let reply = self.execute_block(ctx, sink, cancel, state, &code).await?;
                    submit(producer.as_mut(), cancel, &id, reply).await?;
                }
                ModelBlock::LoadResult { id, uid } => {
                    send(sink, cancel, StatusTrigger::LoadingResult.event())?;
                    let tool_start = state.clock.now_ms();
                    let reply = self.load_result(ctx, &uid).await?;
                    state.clock.record_tool("load_result", tool_start, false, false);
                    submit(producer.as_mut(), cancel, &id, reply).await?;
                }
                ModelBlock::End => break,
            }
        }
        Ok(())
    }

    /// Execute one code block; returns the feedback for the model.
    async fn execute_block(
        &self,
        ctx: &TurnContext,
        sink: &EventSink,
        cancel: &CancellationToken,
        state: &mut TurnState,
        code: &str,
    ) -> Result<String, Stop> {
        send(sink, cancel, TurnEvent::Code(code.to_string()))?;
        send(sink, cancel, StatusTrigger::Executing.event())?;

        let tool_start = state.clock.now_ms();
        let report = self.executor.execute(code, cancel).await;
        let artifact = report.artifact;
        let seq = state.artifact_ids.len() as u64;
        let record = artifact.to_record(&ctx.conversation_id, &ctx.turn_id, seq);
        if let Err(err) = self.conversations.append_artifact(record).await {
            warn!(artifact_id = %artifact.id, error = %err, "failed to store artifact");
        }
        state.artifact_ids.push(artifact.id.clone());
        state
            .clock
            .record_tool("execute_code", tool_start, artifact.is_faulted(), true);

        if report.cancelled {
            return Err(Stop::Cancelled);
        }
        send(sink, cancel, TurnEvent::Artifact(ArtifactPayload::from(&artifact)))?;
        if let Some(fault) = report.upstream {
            return Err(Stop::Upstream(fault));
        }

        let next = if artifact.is_faulted() {
            StatusTrigger::ExecutionFailed
        } else {
            StatusTrigger::Analyzing
        };
        send(sink, cancel, next.event())?;
        Ok(feedback::summarize(&artifact))
    }

    async fn load_result(&self, ctx: &TurnContext, uid: &str) -> Result<String, Stop> {
        match self.conversations.get_artifact(uid).await {
            Ok(record) if record.conversation_id == ctx.conversation_id => Ok(feedback::render_loaded(
                &Artifact::from_record(&record),
                self.config.max_load_rows,
            )),
            Ok(_) | Err(StorageError::ArtifactNotFound { .. }) => Ok(feedback::missing_result(uid)),
            Err(err) => Err(Stop::Upstream(UpstreamFault::Store(err.to_string()))),
        }
    }
}

/// Emit unless the turn is cancelled. A vanished consumer counts as a cancel.
fn send(sink: &EventSink, cancel: &CancellationToken, event: TurnEvent) -> Result<(), Stop> {
    if cancel.is_cancelled() {
        return Err(Stop::Cancelled);
    }
    if !sink.emit(event) {
        cancel.cancel();
        return Err(Stop::Cancelled);
    }
    Ok(())
}

async fn submit(
    producer: &mut dyn ModelTurnProducer,
    cancel: &CancellationToken,
    call_id: &str,
    content: String,
) -> Result<(), Stop> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Stop::Cancelled),
        submitted = producer.submit_tool_result(call_id, content) => submitted.map_err(Stop::Upstream),
    }
}
