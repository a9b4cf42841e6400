//! Execution loop: compile, run, serve pauses, classify.
//!
//! Interpreter slices run on the blocking pool. Between slices the loop owns
//! the [`Suspended`] state exclusively; the dispatcher only ever sees the
//! call. Every execution attempt produces exactly one [`Artifact`], faulted
//! or not.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::dispatcher::Dispatcher;
use super::operation::Operation;
use crate::domain::{
    snapshot_digest, Artifact, CallTiming, ClassifiedResult, CoreError, Result, UpstreamFault,
};
use crate::lang::{self, CompiledProgram, Fault, InterruptFlag, Limits, Object, RunOutcome, Suspended};
use crate::metrics::METRICS;
use crate::obs;

/// What one execution attempt produced.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub artifact: Artifact,
    /// The store became unavailable mid-run; the turn must stop.
    pub upstream: Option<UpstreamFault>,
    pub cancelled: bool,
}

enum Step {
    Start(Arc<CompiledProgram>),
    Resume(Suspended, Object),
}

/// Longest a single external call may wait on the store.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Executor {
    dispatcher: Arc<Dispatcher>,
    limits: Limits,
    dispatch_timeout: Duration,
}

impl Executor {
    pub fn new(dispatcher: Arc<Dispatcher>, limits: Limits) -> Self {
        Self {
            dispatcher,
            limits,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }

    /// Bound each external call; a call still pending after `timeout`
    /// counts as an unavailable store.
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Compile and run `code` to completion, serving every external call.
    #[instrument(skip_all, fields(code_len = code.len()))]
    pub async fn execute(&self, code: &str, cancel: &CancellationToken) -> ExecutionReport {
        let started = Instant::now();
        let mut artifact = Artifact::new(code);

        let program = match lang::compile(code, &Operation::names()) {
            Ok(program) => program,
            Err(fault) => {
                debug!(error = %fault, "program rejected at compile time");
                artifact.error = Some(fault.to_string());
                artifact.timing.compile_ms = started.elapsed().as_millis() as u64;
                return finish(artifact, started, None, false);
            }
        };
        artifact.timing.compile_ms = started.elapsed().as_millis() as u64;

        match program.dump() {
            Ok(bytes) => artifact = artifact.with_snapshot(bytes),
            Err(err) => warn!(error = %err, "program snapshot failed; artifact will not be replayable"),
        }

        self.drive(Arc::new(program), artifact, started, cancel).await
    }

    /// Re-run a compiled snapshot from scratch against the current store.
    pub async fn replay(
        &self,
        code: &str,
        snapshot: &[u8],
        expected_digest: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport> {
        let started = Instant::now();
        if let Some(expected) = expected_digest {
            let actual = snapshot_digest(snapshot);
            if actual != expected {
                return Err(CoreError::DigestMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        let program =
            CompiledProgram::load(snapshot).map_err(|e| CoreError::Snapshot(e.to_string()))?;
        let artifact = Artifact::new(code).with_snapshot(snapshot.to_vec());
        Ok(self.drive(Arc::new(program), artifact, started, cancel).await)
    }

    async fn drive(
        &self,
        program: Arc<CompiledProgram>,
        mut artifact: Artifact,
        started: Instant,
        cancel: &CancellationToken,
    ) -> ExecutionReport {
        let interrupt = InterruptFlag::new();
        let mut run_time = Duration::ZERO;
        let mut step = Step::Start(program);

        let (upstream, cancelled) = loop {
            let slice_started = Instant::now();
            let outcome = run_slice(step, self.limits.clone(), interrupt.clone(), cancel).await;
            run_time += slice_started.elapsed();

            match outcome {
                RunOutcome::Completed { value, stdout } => {
                    artifact.result = ClassifiedResult::classify(&value);
                    artifact.stdout = stdout;
                    break (None, false);
                }
                RunOutcome::Faulted { fault, stdout } => {
                    artifact.error = Some(fault.to_string());
                    artifact.stdout = stdout;
                    break (None, fault == Fault::Cancelled);
                }
                RunOutcome::Paused { call, state } => {
                    let call_started = Instant::now();
                    let dispatched = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            artifact.error = Some(Fault::Cancelled.to_string());
                            artifact.stdout = state.stdout().to_string();
                            break (None, true);
                        }
                        dispatched = tokio::time::timeout(
                            self.dispatch_timeout,
                            self.dispatcher.dispatch(&call),
                        ) => dispatched.unwrap_or_else(|_| {
                            warn!(operation = %call.name, "external call timed out");
                            Err(UpstreamFault::Store(format!(
                                "{}() timed out after {} ms",
                                call.name,
                                self.dispatch_timeout.as_millis()
                            )))
                        }),
                    };
                    match dispatched {
                        Ok(dispatched) => {
                            artifact.timing.calls.push(CallTiming {
                                operation: call.name.clone(),
                                duration_ms: call_started.elapsed().as_millis() as u64,
                                summary: dispatched.summary,
                            });
                            step = Step::Resume(state, dispatched.value);
                        }
                        Err(fault) => {
                            artifact.error = Some(fault.to_string());
                            artifact.stdout = state.stdout().to_string();
                            break (Some(fault), false);
                        }
                    }
                }
            }
        };

        artifact.timing.run_ms = run_time.as_millis() as u64;
        finish(artifact, started, upstream, cancelled || cancel.is_cancelled())
    }
}

/// Run one interpreter slice on the blocking pool. Cancellation raises the
/// interrupt flag and waits for the slice to notice it.
async fn run_slice(
    step: Step,
    limits: Limits,
    interrupt: InterruptFlag,
    cancel: &CancellationToken,
) -> RunOutcome {
    let flag = interrupt.clone();
    let mut handle = tokio::task::spawn_blocking(move || match step {
        Step::Start(program) => lang::run(program, &limits, &flag),
        Step::Resume(state, value) => state.resume(value, &limits, &flag),
    });

    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = cancel.cancelled() => {
            interrupt.raise();
            handle.await
        }
    };

    joined.unwrap_or_else(|err| RunOutcome::Faulted {
        fault: Fault::runtime(format!("interpreter task failed: {err}")),
        stdout: String::new(),
    })
}

fn finish(
    mut artifact: Artifact,
    started: Instant,
    upstream: Option<UpstreamFault>,
    cancelled: bool,
) -> ExecutionReport {
    artifact.timing.total_ms = started.elapsed().as_millis() as u64;
    let faulted = artifact.is_faulted();
    METRICS.inc_executions(faulted);
    obs::emit_execution_finished(
        &artifact.id,
        artifact.result_kind().as_str(),
        faulted,
        artifact.timing.total_ms,
    );
    ExecutionReport {
        artifact,
        upstream,
        cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ResultKind;
    use crate::sandbox::FetchPolicy;
    use sandpiper_state::MemoryTableStore;

    fn executor() -> Executor {
        let dispatcher = Dispatcher::new(Arc::new(MemoryTableStore::new()), FetchPolicy::default());
        Executor::new(Arc::new(dispatcher), Limits::default())
    }

    #[tokio::test]
    async fn test_compile_fault_yields_faulted_artifact_without_snapshot() {
        let report = executor()
            .execute("import os\nos.listdir('.')", &CancellationToken::new())
            .await;
        assert!(report.artifact.is_faulted());
        assert!(report.artifact.error.as_deref().unwrap().starts_with("Syntax error"));
        assert_eq!(report.artifact.result_kind(), ResultKind::Absent);
        assert!(report.artifact.program_snapshot.is_none());
        assert!(report.upstream.is_none());
    }

    #[tokio::test]
    async fn test_completed_program_is_classified() {
        let report = executor()
            .execute("x = [1, 2, 3]\nprint(len(x))\n{'total': sum(x)}", &CancellationToken::new())
            .await;
        assert_eq!(report.artifact.error, None);
        assert_eq!(report.artifact.result_kind(), ResultKind::KeyValue);
        assert_eq!(report.artifact.stdout, "3\n");
        assert!(report.artifact.snapshot_digest.is_some());
    }

    #[tokio::test]
    async fn test_tables_call_round_trip() {
        let report = executor()
            .execute("names = tables()\nlen(names)", &CancellationToken::new())
            .await;
        assert_eq!(report.artifact.result, ClassifiedResult::Scalar(serde_json::json!(0)));
        assert_eq!(report.artifact.timing.calls.len(), 1);
        assert_eq!(report.artifact.timing.calls[0].summary.kind, "tables");
    }

    #[tokio::test]
    async fn test_replay_rejects_digest_mismatch() {
        let exec = executor();
        let report = exec.execute("1 + 1", &CancellationToken::new()).await;
        let snapshot = report.artifact.program_snapshot.unwrap();
        let err = exec
            .replay("1 + 1", &snapshot, Some("deadbeef"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DigestMismatch { .. }));

        let again = exec
            .replay(
                "1 + 1",
                &snapshot,
                report.artifact.snapshot_digest.as_deref(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(again.artifact.result, ClassifiedResult::Scalar(serde_json::json!(2)));
    }
}
