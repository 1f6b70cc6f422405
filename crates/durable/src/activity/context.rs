//! Activity execution context

use uuid::Uuid;

/// Context provided to activities during execution
///
/// Identifies the durable records the call belongs to, which is what an
/// activity needs to build idempotency keys: a workflow restarted by
/// recovery re-runs its activities from the beginning with the same
/// `workflow_id` but a fresh `execution_id`.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Activity execution row recorded for this call
    pub execution_id: Uuid,

    /// Workflow instance that issued the call
    pub workflow_id: Uuid,

    /// Registered activity name
    pub activity_name: String,

    /// 1-based position of this call within the workflow run
    pub sequence: u32,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(
        execution_id: Uuid,
        workflow_id: Uuid,
        activity_name: impl Into<String>,
        sequence: u32,
    ) -> Self {
        Self {
            execution_id,
            workflow_id,
            activity_name: activity_name.into(),
            sequence,
        }
    }

    /// Key that is stable across recovery restarts of the same workflow
    ///
    /// Activities with external side effects can pass this to the remote
    /// system to make repeated calls idempotent.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.workflow_id, self.sequence, self.activity_name)
    }
}
