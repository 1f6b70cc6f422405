//! Read-only status queries
//!
//! Every call reads the store; nothing is cached, so a query always sees the
//! latest committed transition.

use std::sync::Arc;

use uuid::Uuid;

use crate::persistence::{
    ActivityExecution, StoreError, WorkflowFilter, WorkflowInstance, WorkflowStore,
};

/// Errors from status queries
#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    /// No workflow with this id
    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    /// Store error
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for StatusError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Projection of workflow state for callers
#[derive(Clone)]
pub struct StatusApi {
    store: Arc<dyn WorkflowStore>,
}

impl StatusApi {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }

    /// Full record of one workflow instance
    pub async fn get_status(&self, workflow_id: Uuid) -> Result<WorkflowInstance, StatusError> {
        Ok(self.store.get_workflow(workflow_id).await?)
    }

    /// Instances matching `filter`, oldest first
    pub async fn list(&self, filter: WorkflowFilter) -> Result<Vec<WorkflowInstance>, StatusError> {
        Ok(self.store.list_workflows(filter).await?)
    }

    /// Activity executions of one instance, in call order
    pub async fn activity_history(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<ActivityExecution>, StatusError> {
        self.store.get_workflow(workflow_id).await?;
        Ok(self.store.list_activity_executions(workflow_id).await?)
    }
}

impl std::fmt::Debug for StatusApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusApi").finish_non_exhaustive()
    }
}
