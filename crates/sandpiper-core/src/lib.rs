//! Sandpiper-Core: sandboxed execution and turn streaming for data agents
//!
//! A model writes programs in a restricted Python-like language. The engine
//! compiles and runs them in a resource-limited interpreter that pauses at
//! every data request, serves the request through four bounded, read-only
//! operations, and resumes. Each turn's narration, code, artifacts and
//! timing are streamed to the client in order as they happen.
//!
//! ## Key Components
//!
//! - `lang`: restricted-language compiler and pausable interpreter
//! - `sandbox`: bounded data access dispatcher and execution loop
//! - `domain`: artifacts, result classification, timing, errors
//! - `turn`: turn orchestration and event multiplexing
//! - `service`: conversation-level entry points (turns, history, replay)

pub mod config;
pub mod domain;
pub mod lang;
pub mod metrics;
pub mod obs;
pub mod sandbox;
pub mod service;
pub mod telemetry;
pub mod turn;

pub use config::{EngineConfig, ResourceLimits};
pub use domain::{
    Artifact, ClassifiedResult, CoreError, ExecutionTiming, Result, ResultKind, TurnTiming,
    UpstreamFault,
};
pub use lang::{compile, CompiledProgram, Fault, Limits, Object, RunOutcome, Suspended};
pub use sandbox::{Dispatcher, ExecutionReport, Executor, FetchPolicy, ValidationFault};
pub use service::{ChatService, ConversationDetail, ReplayResult};
pub use telemetry::init_tracing;
pub use turn::{
    ModelBlock, ModelClient, ScriptedModelClient, TurnEvent, TurnOrchestrator, TurnStream,
};
