//! Structured observability hooks for turn and execution lifecycle events.
//!
//! This module provides:
//! - Conversation-scoped tracing spans via `TurnSpan`
//! - Emission functions for lifecycle events: turn start/finish, executions,
//!   external calls and validation rejections
//!
//! Events are emitted at `info!` level; filter with `RUST_LOG`.

use tracing::{info, warn, Instrument};

/// Conversation-scoped span covering one turn task.
///
/// ```ignore
/// let span = TurnSpan::new("conv-123", "turn-456");
/// tokio::spawn(span.instrument(async move { /* every event tagged */ }));
/// ```
pub struct TurnSpan {
    span: tracing::Span,
}

impl TurnSpan {
    pub fn new(conversation_id: &str, turn_id: &str) -> Self {
        let span = tracing::info_span!(
            "sandpiper.turn",
            conversation_id = %conversation_id,
            turn_id = %turn_id
        );
        Self { span }
    }

    /// Attach the span to a future so it follows the task across awaits.
    pub fn instrument<F: std::future::Future>(self, fut: F) -> tracing::instrument::Instrumented<F> {
        fut.instrument(self.span)
    }
}

pub fn emit_turn_started(conversation_id: &str, turn_id: &str) {
    info!(event = "turn.started", conversation_id = %conversation_id, turn_id = %turn_id);
}

/// Emit event: turn finished with artifact count and total duration.
pub fn emit_turn_finished(turn_id: &str, artifacts: usize, model_steps: usize, total_ms: u64) {
    info!(
        event = "turn.finished",
        turn_id = %turn_id,
        artifacts = artifacts,
        model_steps = model_steps,
        total_ms = total_ms,
    );
}

/// Emit event: turn aborted by an upstream fault (warning level).
pub fn emit_turn_aborted(turn_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "turn.aborted", turn_id = %turn_id, error = %error);
}

pub fn emit_turn_cancelled(turn_id: &str) {
    info!(event = "turn.cancelled", turn_id = %turn_id);
}

/// Emit event: one sandboxed execution finished.
pub fn emit_execution_finished(artifact_id: &str, result_kind: &str, faulted: bool, total_ms: u64) {
    info!(
        event = "execution.finished",
        artifact_id = %artifact_id,
        result_kind = %result_kind,
        faulted = faulted,
        total_ms = total_ms,
    );
}

/// Emit event: an external call was served by the dispatcher.
pub fn emit_external_call(operation: &str, kind: &str, rows: Option<u64>, duration_ms: u64) {
    info!(
        event = "external_call.dispatched",
        operation = %operation,
        kind = %kind,
        rows = rows,
        duration_ms = duration_ms,
    );
}

/// Emit event: an external call was rejected before reaching the store.
pub fn emit_validation_rejected(operation: &str, reason: &str) {
    info!(event = "external_call.rejected", operation = %operation, reason = %reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_turn_events_are_logged() {
        let span = TurnSpan::new("conv-1", "turn-1");
        let _entered = span.span.enter();
        emit_turn_started("conv-1", "turn-1");
        emit_validation_rejected("fetch", "Unknown table: nope");
        assert!(logs_contain("turn.started"));
        assert!(logs_contain("external_call.rejected"));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_turn_span_follows_future() {
        TurnSpan::new("conv-9", "turn-9")
            .instrument(async { emit_turn_cancelled("turn-9") })
            .await;
        assert!(logs_contain("turn.cancelled"));
        assert!(logs_contain("conv-9"));
    }
}
