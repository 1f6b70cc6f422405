//! # Durable Workflow Orchestrator
//!
//! A single-process, SQLite-backed engine that runs registered workflows in
//! the background and keeps a durable record of every step.
//!
//! ## Features
//!
//! - **Name-based registry**: workflows and activities are looked up by the name stored with each instance
//! - **Durable progress**: every workflow instance and every activity call is a row in the store
//! - **Bounded execution**: a fixed pool of worker tasks, one workflow per worker at a time
//! - **Crash recovery**: instances left `pending` or `processing` are resubmitted on start
//! - **Opt-in retries**: [`RetryPolicy`] wraps individual activity calls; nothing retries implicitly
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Orchestrator                           │
//! │  (register, start + recovery, invoke, status, stop)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  (max_workers tasks pulling workflow ids from a queue)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            WorkflowExecutor + WorkflowContext                │
//! │  (claims an instance, runs its body, records activities)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowStore                           │
//! │  (SQLite: workflows, activity_executions)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use tallyloom_durable::prelude::*;
//!
//! struct Double;
//!
//! #[async_trait]
//! impl Activity for Double {
//!     const TYPE: &'static str = "double";
//!     type Input = i64;
//!     type Output = i64;
//!
//!     async fn execute(&self, _ctx: &ActivityContext, x: i64) -> Result<i64, ActivityError> {
//!         Ok(x * 2)
//!     }
//! }
//!
//! struct DoubleWorkflow;
//!
//! #[async_trait]
//! impl Workflow for DoubleWorkflow {
//!     const TYPE: &'static str = "w";
//!     type Input = i64;
//!     type Output = i64;
//!
//!     async fn run(&self, ctx: &WorkflowContext, x: i64) -> Result<i64, WorkflowError> {
//!         Ok(ctx.execute::<Double>(x).await?)
//!     }
//! }
//!
//! let orchestrator = Orchestrator::connect(OrchestratorConfig::from_env()).await?;
//! orchestrator.register_activity(Double)?;
//! orchestrator.register_workflow(DoubleWorkflow)?;
//! orchestrator.start().await?;
//!
//! let id = orchestrator.invoke::<DoubleWorkflow>(5).await?;
//! ```

pub mod activity;
pub mod config;
pub mod engine;
pub mod orchestrator;
pub mod persistence;
pub mod recovery;
pub mod reliability;
pub mod status;
pub mod telemetry;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError};
    pub use crate::config::OrchestratorConfig;
    pub use crate::engine::{HandlerKind, Registry, RegistryError};
    pub use crate::orchestrator::{Orchestrator, OrchestratorError};
    pub use crate::persistence::{
        InMemoryWorkflowStore, SqliteWorkflowStore, StoreError, WorkflowFilter, WorkflowInstance,
        WorkflowStatus, WorkflowStore,
    };
    pub use crate::recovery::RecoveryReport;
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::WorkerPoolConfig;
    pub use crate::workflow::{Workflow, WorkflowContext, WorkflowError};

    pub use async_trait::async_trait;
    pub use serde::{Deserialize, Serialize};
    pub use serde_json::json;
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError};
pub use config::OrchestratorConfig;
pub use engine::{
    ExecutorError, HandlerKind, Registry, RegistryError, RunOutcome, WorkflowExecutor,
};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use persistence::{
    ActivityExecution, ActivityOutcome, InMemoryWorkflowStore, SqliteWorkflowStore, StoreError,
    WorkflowFilter, WorkflowInstance, WorkflowStatus, WorkflowStore,
};
pub use recovery::{RecoveryError, RecoveryReport};
pub use reliability::RetryPolicy;
pub use status::{StatusApi, StatusError};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use workflow::{Workflow, WorkflowContext, WorkflowError};
