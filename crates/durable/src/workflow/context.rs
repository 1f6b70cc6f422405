//! Workflow execution context
//!
//! The context is the only way a workflow body reaches activities. Each
//! call is recorded durably before the activity runs and finalized after it
//! returns, and the workflow's `current_activity` marker brackets the call.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::activity::{Activity, ActivityContext, ActivityError, PANIC_ERROR};
use crate::engine::{panic_message, Registry};
use crate::persistence::{ActivityOutcome, StoreError, WorkflowStore};
use crate::reliability::RetryPolicy;

/// Error type reported when the store rejects an activity bookkeeping write
pub const STORE_ERROR: &str = "StoreError";

impl From<StoreError> for ActivityError {
    fn from(err: StoreError) -> Self {
        Self::non_retryable(err.to_string()).with_type(STORE_ERROR)
    }
}

/// Handle given to a running workflow body
///
/// Cloning is cheap; clones share the activity sequence counter and the
/// activity slot, so calls from any clone run one at a time, in the order
/// they reach the slot, and are numbered in that order.
#[derive(Clone)]
pub struct WorkflowContext {
    workflow_id: Uuid,
    workflow_name: Arc<str>,
    store: Arc<dyn WorkflowStore>,
    registry: Arc<Registry>,
    sequence: Arc<AtomicU32>,
    /// Held from the start record to the cleared marker of each call
    activity_slot: Arc<Mutex<()>>,
}

impl WorkflowContext {
    pub(crate) fn new(
        workflow_id: Uuid,
        workflow_name: &str,
        store: Arc<dyn WorkflowStore>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            workflow_id,
            workflow_name: Arc::from(workflow_name),
            store,
            registry,
            sequence: Arc::new(AtomicU32::new(0)),
            activity_slot: Arc::new(Mutex::new(())),
        }
    }

    /// Id of the running workflow instance
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// Registered name of the running workflow
    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    /// Call a registered activity by name and wait for its result
    ///
    /// The activity runs inline on this worker. Concurrent calls on the same
    /// run (e.g. joined futures) wait for each other, so executions never
    /// overlap. An unregistered name fails the call with an `UnknownHandler`
    /// error and records nothing. Any error, including a panic inside the
    /// activity, is recorded on the execution row and returned to the caller
    /// unchanged.
    pub async fn call_activity(&self, name: &str, input: Value) -> Result<Value, ActivityError> {
        let handler = match self.registry.resolve_activity(name) {
            Ok(handler) => handler,
            Err(_) => {
                warn!(
                    workflow_id = %self.workflow_id,
                    activity = name,
                    "Workflow called unregistered activity"
                );
                return Err(ActivityError::unknown_handler(name));
            }
        };

        let _slot = self.activity_slot.lock().await;

        let execution_id = self
            .store
            .record_activity_start(self.workflow_id, name, input.clone())
            .await?;
        if let Err(e) = self
            .store
            .set_current_activity(self.workflow_id, Some(name))
            .await
        {
            let err = ActivityError::from(e);
            if let Err(end_err) = self
                .store
                .record_activity_end(execution_id, ActivityOutcome::Failed(err.message.clone()))
                .await
            {
                error!(%execution_id, "Failed to finalize activity execution: {}", end_err);
            }
            return Err(err);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = ActivityContext::new(execution_id, self.workflow_id, name, sequence);

        debug!(
            workflow_id = %self.workflow_id,
            %execution_id,
            activity = name,
            sequence,
            "Running activity"
        );

        let result = match AssertUnwindSafe(handler(ctx, input)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(ActivityError::non_retryable(format!(
                "activity panicked: {}",
                panic_message(payload.as_ref())
            ))
            .with_type(PANIC_ERROR)),
        };

        let outcome = match &result {
            Ok(output) => ActivityOutcome::Completed(output.clone()),
            Err(e) => ActivityOutcome::Failed(e.message.clone()),
        };
        // Clear the marker even when the end record fails
        let ended = self.store.record_activity_end(execution_id, outcome).await;
        let cleared = self.store.set_current_activity(self.workflow_id, None).await;
        if let Err(e) = &ended {
            error!(%execution_id, "Failed to record activity end: {}", e);
        }
        ended?;
        cleared?;

        if let Err(e) = &result {
            debug!(
                workflow_id = %self.workflow_id,
                %execution_id,
                activity = name,
                error = %e,
                "Activity failed"
            );
        }

        result
    }

    /// Call a typed activity registered under `A::TYPE`
    pub async fn execute<A>(&self, input: A::Input) -> Result<A::Output, ActivityError>
    where
        A: Activity,
        A::Input: Serialize,
        A::Output: DeserializeOwned,
    {
        let output = self
            .call_activity(A::TYPE, serde_json::to_value(input)?)
            .await?;
        Ok(serde_json::from_value(output)?)
    }

    /// Call an activity, retrying failed attempts according to `policy`
    ///
    /// Each attempt is recorded as its own activity execution. Returns the
    /// first success, or the error of the last attempt made.
    pub async fn call_activity_with_retry(
        &self,
        name: &str,
        input: Value,
        policy: &RetryPolicy,
    ) -> Result<Value, ActivityError> {
        let mut attempt = 1;
        loop {
            match self.call_activity(name, input.clone()).await {
                Ok(output) => return Ok(output),
                Err(e) if policy.should_retry(&e, attempt) => {
                    attempt += 1;
                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        workflow_id = %self.workflow_id,
                        activity = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying activity"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("workflow_id", &self.workflow_id)
            .field("workflow_name", &self.workflow_name)
            .field("sequence", &self.sequence.load(Ordering::SeqCst))
            .finish()
    }
}
