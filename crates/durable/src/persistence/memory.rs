//! In-memory implementation of WorkflowStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;

#[derive(Default)]
struct State {
    workflows: HashMap<Uuid, WorkflowInstance>,
    activity_executions: HashMap<Uuid, ActivityExecution>,
}

impl State {
    fn workflow_mut(&mut self, workflow_id: Uuid) -> Result<&mut WorkflowInstance, StoreError> {
        self.workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::NotFound(workflow_id))
    }

    /// Fetch a workflow that must currently be `processing`
    fn processing_mut(
        &mut self,
        workflow_id: Uuid,
        operation: &'static str,
    ) -> Result<&mut WorkflowInstance, StoreError> {
        let workflow = self.workflow_mut(workflow_id)?;
        if workflow.status != WorkflowStatus::Processing {
            return Err(StoreError::InvalidTransition {
                workflow_id,
                from: workflow.status,
                operation,
            });
        }
        Ok(workflow)
    }
}

/// In-memory implementation of WorkflowStore
///
/// Provides the same semantics as the SQLite implementation, minus
/// durability. A single lock guards both record sets so multi-row
/// operations like [`WorkflowStore::reset_to_pending`] stay atomic.
///
/// # Example
///
/// ```
/// use tallyloom_durable::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// assert_eq!(store.workflow_count(), 0);
/// ```
pub struct InMemoryWorkflowStore {
    state: RwLock<State>,
}

impl InMemoryWorkflowStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    /// Get the number of workflows
    pub fn workflow_count(&self) -> usize {
        self.state.read().workflows.len()
    }

    /// Get the number of activity executions across all workflows
    pub fn activity_execution_count(&self) -> usize {
        self.state.read().activity_executions.len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.workflows.clear();
        state.activity_executions.clear();
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_by_creation(mut workflows: Vec<WorkflowInstance>) -> Vec<WorkflowInstance> {
    workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    workflows
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_workflow(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<Uuid, StoreError> {
        let workflow = WorkflowInstance::pending(name, input, Utc::now());
        let workflow_id = workflow.id;
        self.state.write().workflows.insert(workflow_id, workflow);
        Ok(workflow_id)
    }

    async fn mark_processing(&self, workflow_id: Uuid) -> Result<WorkflowInstance, StoreError> {
        let mut state = self.state.write();
        let workflow = state.workflow_mut(workflow_id)?;
        if workflow.status != WorkflowStatus::Pending {
            return Err(StoreError::InvalidTransition {
                workflow_id,
                from: workflow.status,
                operation: "mark processing",
            });
        }

        workflow.status = WorkflowStatus::Processing;
        workflow.updated_at = monotonic_now(workflow.updated_at);
        Ok(workflow.clone())
    }

    async fn set_current_activity(
        &self,
        workflow_id: Uuid,
        activity_name: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let workflow = state.processing_mut(workflow_id, "set current activity")?;
        workflow.current_activity = activity_name.map(str::to_string);
        workflow.updated_at = monotonic_now(workflow.updated_at);
        Ok(())
    }

    async fn complete_workflow(
        &self,
        workflow_id: Uuid,
        output: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let workflow = state.processing_mut(workflow_id, "complete")?;
        workflow.status = WorkflowStatus::Done;
        workflow.current_activity = None;
        workflow.output = Some(output);
        workflow.error_message = None;
        workflow.updated_at = monotonic_now(workflow.updated_at);
        Ok(())
    }

    async fn fail_workflow(&self, workflow_id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let workflow = state.processing_mut(workflow_id, "fail")?;
        workflow.status = WorkflowStatus::Failed;
        workflow.current_activity = None;
        workflow.output = None;
        workflow.error_message = Some(error.to_string());
        workflow.updated_at = monotonic_now(workflow.updated_at);
        Ok(())
    }

    async fn reset_to_pending(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let workflow = state.processing_mut(workflow_id, "reset to pending")?;
        let now = monotonic_now(workflow.updated_at);
        workflow.status = WorkflowStatus::Pending;
        workflow.current_activity = None;
        workflow.updated_at = now;

        for execution in state.activity_executions.values_mut() {
            if execution.workflow_id == workflow_id && execution.finished_at.is_none() {
                execution.error = Some(INTERRUPTED_BY_RESTART.to_string());
                execution.finished_at = Some(now.max(execution.started_at));
            }
        }
        Ok(())
    }

    async fn record_activity_start(
        &self,
        workflow_id: Uuid,
        activity_name: &str,
        input: serde_json::Value,
    ) -> Result<Uuid, StoreError> {
        let mut state = self.state.write();
        let workflow = state.processing_mut(workflow_id, "record activity start")?;
        let now = monotonic_now(workflow.updated_at);
        workflow.updated_at = now;

        let execution = ActivityExecution {
            id: Uuid::now_v7(),
            workflow_id,
            activity_name: activity_name.to_string(),
            input,
            output: None,
            error: None,
            started_at: now,
            finished_at: None,
        };
        let execution_id = execution.id;
        state.activity_executions.insert(execution_id, execution);
        Ok(execution_id)
    }

    async fn record_activity_end(
        &self,
        execution_id: Uuid,
        outcome: ActivityOutcome,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let State {
            workflows,
            activity_executions,
        } = &mut *state;

        let execution = activity_executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ActivityExecutionNotFound(execution_id))?;
        if execution.is_finished() {
            return Err(StoreError::ActivityAlreadyFinished(execution_id));
        }

        let workflow = workflows
            .get_mut(&execution.workflow_id)
            .ok_or(StoreError::NotFound(execution.workflow_id))?;
        let now = monotonic_now(workflow.updated_at.max(execution.started_at));
        workflow.updated_at = now;

        match outcome {
            ActivityOutcome::Completed(output) => execution.output = Some(output),
            ActivityOutcome::Failed(error) => execution.error = Some(error),
        }
        execution.finished_at = Some(now);
        Ok(())
    }

    async fn list_activity_executions(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<ActivityExecution>, StoreError> {
        let state = self.state.read();
        if !state.workflows.contains_key(&workflow_id) {
            return Err(StoreError::NotFound(workflow_id));
        }

        let mut executions: Vec<_> = state
            .activity_executions
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        executions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        Ok(executions)
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowInstance, StoreError> {
        self.state
            .read()
            .workflows
            .get(&workflow_id)
            .cloned()
            .ok_or(StoreError::NotFound(workflow_id))
    }

    async fn list_workflows(
        &self,
        filter: WorkflowFilter,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let state = self.state.read();
        let workflows = state
            .workflows
            .values()
            .filter(|w| filter.matches(w))
            .cloned()
            .collect();
        Ok(sorted_by_creation(workflows))
    }

    async fn list_incomplete(&self) -> Result<Vec<WorkflowInstance>, StoreError> {
        let state = self.state.read();
        let workflows = state
            .workflows
            .values()
            .filter(|w| !w.status.is_terminal())
            .cloned()
            .collect();
        Ok(sorted_by_creation(workflows))
    }
}
