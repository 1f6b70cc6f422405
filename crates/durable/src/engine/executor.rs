//! Workflow executor
//!
//! The `WorkflowExecutor` runs one workflow instance end to end:
//! - Claiming the instance (`pending -> processing`)
//! - Resolving and invoking the registered body
//! - Persisting the terminal outcome (`done` or `failed`)

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::persistence::{StoreError, WorkflowStore};
use crate::workflow::{WorkflowContext, WorkflowError};

use super::registry::Registry;

/// Message persisted when a workflow fails with an empty error message
pub const UNSPECIFIED_FAILURE: &str = "workflow failed without an error message";

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// What a call to [`WorkflowExecutor::run_instance`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Body returned a value; instance is `done`
    Completed,

    /// Body returned an error or panicked; instance is `failed`
    Failed(String),

    /// Instance was not `pending`; someone else owns it or it is finished
    Skipped,
}

/// Executes workflow instances against a store and a registry
#[derive(Clone)]
pub struct WorkflowExecutor {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<Registry>,
}

impl WorkflowExecutor {
    /// Create a new executor
    pub fn new(store: Arc<dyn WorkflowStore>, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }

    /// Get the store
    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Get the registry
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Claim and run a workflow instance to a terminal state
    ///
    /// Losing the claim is not an error: the instance is skipped. Errors are
    /// returned only when the store itself fails, in which case the instance
    /// may be left `processing` for recovery to pick up.
    #[instrument(skip(self))]
    pub async fn run_instance(&self, workflow_id: Uuid) -> Result<RunOutcome, ExecutorError> {
        let instance = match self.store.mark_processing(workflow_id).await {
            Ok(instance) => instance,
            Err(e) if e.is_invalid_transition() => {
                debug!(%workflow_id, "workflow not pending, skipping: {}", e);
                return Ok(RunOutcome::Skipped);
            }
            Err(StoreError::NotFound(_)) => {
                warn!(%workflow_id, "workflow submitted but not found in store");
                return Ok(RunOutcome::Skipped);
            }
            Err(e) => {
                error!(%workflow_id, "Failed to claim workflow: {}", e);
                return Err(e.into());
            }
        };

        info!(%workflow_id, workflow = %instance.name, "workflow started");

        let result = match self.registry.resolve_workflow(&instance.name) {
            Ok(handler) => {
                let ctx = WorkflowContext::new(
                    workflow_id,
                    &instance.name,
                    self.store.clone(),
                    self.registry.clone(),
                );
                match AssertUnwindSafe(handler(ctx, instance.input)).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => Err(WorkflowError::new(format!(
                        "workflow panicked: {}",
                        panic_message(payload.as_ref())
                    ))),
                }
            }
            Err(e) => Err(WorkflowError::new(e.to_string())),
        };

        match result {
            Ok(output) => {
                if let Err(e) = self.store.complete_workflow(workflow_id, output).await {
                    error!(%workflow_id, "Failed to complete workflow: {}", e);
                    return Err(e.into());
                }
                info!(%workflow_id, "workflow completed");
                Ok(RunOutcome::Completed)
            }
            Err(e) => {
                let message = if e.message.trim().is_empty() {
                    UNSPECIFIED_FAILURE.to_string()
                } else {
                    e.message
                };
                if let Err(store_err) = self.store.fail_workflow(workflow_id, &message).await {
                    error!(%workflow_id, "Failed to fail workflow: {}", store_err);
                    return Err(store_err.into());
                }
                warn!(%workflow_id, error = %message, "workflow failed");
                Ok(RunOutcome::Failed(message))
            }
        }
    }
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
