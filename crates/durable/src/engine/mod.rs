//! Workflow execution engine
//!
//! The engine module provides the handler [`Registry`] and the
//! [`WorkflowExecutor`] that runs a single workflow instance.

mod executor;
mod registry;

pub(crate) use executor::panic_message;
pub use executor::{ExecutorError, RunOutcome, WorkflowExecutor, UNSPECIFIED_FAILURE};
pub use registry::{ActivityHandler, HandlerKind, Registry, RegistryError, WorkflowHandler};
