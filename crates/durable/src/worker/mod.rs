//! Worker pool for workflow execution
//!
//! ```text
//! invoke / recovery ──submit──▶ queue ──▶ [worker 1] [worker 2] ... [worker N]
//!                                              │
//!                                              ▼
//!                                      WorkflowExecutor::run_instance
//! ```
//!
//! Workers are Tokio tasks. A workflow and all of its activity calls run on
//! the worker that picked it up.

mod pool;

pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
