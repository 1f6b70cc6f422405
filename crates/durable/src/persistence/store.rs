//! WorkflowStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error recorded on activity executions interrupted by a crash
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by process restart";

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    /// Activity execution not found
    #[error("activity execution not found: {0}")]
    ActivityExecutionNotFound(Uuid),

    /// State change not allowed from the row's current status
    #[error("invalid transition for workflow {workflow_id}: cannot {operation} from {from}")]
    InvalidTransition {
        workflow_id: Uuid,
        from: WorkflowStatus,
        operation: &'static str,
    },

    /// Activity execution already finalized
    #[error("activity execution {0} already finished")]
    ActivityAlreadyFinished(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether this error is a state machine precondition failure
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}

/// Workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Workflow recorded but not yet claimed by a worker
    Pending,

    /// Workflow is being executed by a worker
    Processing,

    /// Workflow returned a value
    Done,

    /// Workflow raised an error
    Failed,
}

impl WorkflowStatus {
    /// `done` and `failed` are never left once entered
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Serialization(format!(
                "unknown workflow status: {other}"
            ))),
        }
    }
}

/// One durable execution record of a workflow invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub name: String,
    pub input: serde_json::Value,
    pub status: WorkflowStatus,
    /// Activity in flight, only while `processing`
    pub current_activity: Option<String>,
    /// Set only when `done`
    pub output: Option<serde_json::Value>,
    /// Set only when `failed`
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Build a fresh `pending` instance stamped at `now`
    pub fn pending(name: &str, input: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.to_string(),
            input,
            status: WorkflowStatus::Pending,
            current_activity: None,
            output: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One durable record of a single activity call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub activity_name: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ActivityExecution {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// How an activity call ended
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome {
    Completed(serde_json::Value),
    Failed(String),
}

/// Filter for listing workflows
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub name: Option<String>,
    pub status: Option<WorkflowStatus>,
}

impl WorkflowFilter {
    /// Only workflows registered under `name`
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            status: None,
        }
    }

    /// Restrict to one status
    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, workflow: &WorkflowInstance) -> bool {
        if let Some(ref name) = self.name {
            if &workflow.name != name {
                return false;
            }
        }
        if let Some(status) = self.status {
            if workflow.status != status {
                return false;
            }
        }
        true
    }
}

/// Timestamp for a write against a workflow last stamped at `previous`
///
/// Never goes backwards, so `updated_at` and activity timestamps within one
/// workflow stay ordered even if the wall clock steps back.
pub(crate) fn monotonic_now(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous)
}

/// Durable store for workflow instances and activity executions
///
/// Every write touches a single workflow (and possibly its own activity
/// rows) atomically. Implementations must be thread-safe; concurrent
/// workers never contend on one row because a row is claimed only through
/// the `pending -> processing` precondition of [`mark_processing`].
///
/// [`mark_processing`]: WorkflowStore::mark_processing
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Operations
    // =========================================================================

    /// Insert a new `pending` workflow and return its id
    async fn create_workflow(&self, name: &str, input: serde_json::Value)
        -> Result<Uuid, StoreError>;

    /// Claim a workflow: `pending -> processing`
    ///
    /// Returns the claimed row. Fails with `InvalidTransition` if the row is
    /// not `pending`, which is how a second claimant learns it lost.
    async fn mark_processing(&self, workflow_id: Uuid) -> Result<WorkflowInstance, StoreError>;

    /// Set or clear the in-flight activity marker (only while `processing`)
    async fn set_current_activity(
        &self,
        workflow_id: Uuid,
        activity_name: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Terminal transition `processing -> done`
    async fn complete_workflow(
        &self,
        workflow_id: Uuid,
        output: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Terminal transition `processing -> failed`
    async fn fail_workflow(&self, workflow_id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Release a crashed claim: `processing -> pending`
    ///
    /// Clears `current_activity` and finalizes unfinished activity
    /// executions of the workflow with [`INTERRUPTED_BY_RESTART`].
    async fn reset_to_pending(&self, workflow_id: Uuid) -> Result<(), StoreError>;

    // =========================================================================
    // Activity Execution Operations
    // =========================================================================

    /// Record the start of an activity call and return its execution id
    async fn record_activity_start(
        &self,
        workflow_id: Uuid,
        activity_name: &str,
        input: serde_json::Value,
    ) -> Result<Uuid, StoreError>;

    /// Finalize an activity execution (append-only: only once)
    async fn record_activity_end(
        &self,
        execution_id: Uuid,
        outcome: ActivityOutcome,
    ) -> Result<(), StoreError>;

    /// Activity executions of a workflow, oldest first
    async fn list_activity_executions(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<ActivityExecution>, StoreError>;

    // =========================================================================
    // Reads
    // =========================================================================

    /// Point-in-time read of one workflow
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowInstance, StoreError>;

    /// Workflows matching `filter`, ordered by creation time
    async fn list_workflows(&self, filter: WorkflowFilter)
        -> Result<Vec<WorkflowInstance>, StoreError>;

    /// All `pending` and `processing` workflows, ordered by creation time
    async fn list_incomplete(&self) -> Result<Vec<WorkflowInstance>, StoreError>;
}
