//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowStore`] trait for workflow and activity-execution persistence
//! - [`InMemoryWorkflowStore`] for testing
//! - [`SqliteWorkflowStore`] for durable single-file storage

mod memory;
mod sqlite;
mod store;

pub use memory::InMemoryWorkflowStore;
pub use sqlite::{SqliteWorkflowStore, DEFAULT_MAX_CONNECTIONS};
pub use store::{
    ActivityExecution, ActivityOutcome, StoreError, WorkflowFilter, WorkflowInstance,
    WorkflowStatus, WorkflowStore, INTERRUPTED_BY_RESTART,
};
