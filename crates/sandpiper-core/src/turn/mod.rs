//! Turn: model-driven orchestration and the client event stream.
//!
//! A turn runs as a background task feeding a [`multiplexer::TurnStream`].
//! The orchestrator asks the model for blocks, runs code blocks through the
//! [`crate::sandbox::Executor`] and reports every step as a [`TurnEvent`].
//!
//! # Modules
//!
//! - [`events`]: `TurnEvent` wire type
//! - [`status`]: fixed status vocabulary
//! - [`model`]: `ModelClient` / `ModelTurnProducer` traits, scripted client
//! - [`feedback`]: result summaries returned to the model
//! - [`prompt`]: prompt and title construction
//! - [`orchestrator`]: `TurnOrchestrator::run()`
//! - [`multiplexer`]: `spawn_turn()`, `EventSink`, `TurnStream`

pub mod events;
pub mod feedback;
pub mod model;
pub mod multiplexer;
pub mod orchestrator;
pub mod prompt;
pub mod status;

pub use events::{ArtifactPayload, TurnEvent};
pub use model::{ModelBlock, ModelClient, ModelTurnProducer, ScriptedModelClient};
pub use multiplexer::{spawn_turn, EventSink, TurnStream};
pub use orchestrator::{TurnContext, TurnOrchestrator, TurnOutcome};
pub use status::StatusTrigger;
