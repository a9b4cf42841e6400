//! Sandbox: bounded data access and the execution loop.
//!
//! Sandboxed programs reach data only through four host calls (`tables`,
//! `describe`, `count`, `fetch`). Each call pauses the interpreter; the
//! executor hands it to the dispatcher, which validates it, runs it against
//! the [`sandpiper_state::TableStore`] and resumes the program with the
//! result. Invalid requests are returned to the program as an error mapping
//! instead of failing the run.
//!
//! # Modules
//!
//! - [`operation`]: `Operation` enum and parameter lists
//! - [`request`]: argument binding and syntactic validation
//! - [`policy`]: `FetchPolicy` limit bounds
//! - [`dispatcher`]: schema checks and store access
//! - [`executor`]: compile / run / pause / resume loop producing artifacts
//! - [`error`]: `ValidationFault`

pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod operation;
pub mod policy;
pub mod request;

pub use dispatcher::{Dispatched, Dispatcher};
pub use error::ValidationFault;
pub use executor::{ExecutionReport, Executor};
pub use operation::Operation;
pub use policy::FetchPolicy;
pub use request::Request;
