//! Domain models for Sandpiper.
//!
//! - `Artifact`: durable record of one sandboxed execution
//! - `ClassifiedResult` / `ResultKind`: shape-based result classification
//! - `ExecutionTiming` / `TurnTiming`: diagnostics attached to artifacts and turns

pub mod artifact;
pub mod classify;
pub mod error;
pub mod timing;

pub use artifact::{snapshot_digest, Artifact};
pub use classify::{ClassifiedResult, ResultKind};
pub use error::{CoreError, Result, UpstreamFault};
pub use timing::{
    CallSummary, CallTiming, ExecutionTiming, SpanKind, TimingSpan, ToolDetail, TurnClock,
    TurnTiming,
};
