//! Fixed status vocabulary. Status text is never model-generated.

use super::events::TurnEvent;

/// Transition points at which the orchestrator reports progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusTrigger {
    TurnStarted,
    AwaitingModel,
    Executing,
    ExecutionFailed,
    LoadingResult,
    Analyzing,
    StepLimit,
}

impl StatusTrigger {
    pub fn message(&self) -> &'static str {
        match self {
            StatusTrigger::TurnStarted => "Starting analysis...",
            StatusTrigger::AwaitingModel => "Agent is thinking...",
            StatusTrigger::Executing => "Running code in sandbox...",
            StatusTrigger::ExecutionFailed => "Code failed, agent may retry...",
            StatusTrigger::LoadingResult => "Loading result data...",
            StatusTrigger::Analyzing => "Analyzing results...",
            StatusTrigger::StepLimit => "Reached the step limit, finishing up...",
        }
    }

    pub fn event(&self) -> TurnEvent {
        TurnEvent::Status(self.message().to_string())
    }
}
