//! Workflow abstractions
//!
//! - [`Workflow`] trait for typed workflow bodies
//! - [`WorkflowContext`] handle used by a body to call activities
//! - [`WorkflowError`] for failures that end a workflow

mod context;
mod definition;

pub use context::{WorkflowContext, STORE_ERROR};
pub use definition::{Workflow, WorkflowError};
