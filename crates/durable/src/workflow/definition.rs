//! Workflow trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::WorkflowContext;
use crate::activity::ActivityError;

/// Error type for workflow failures
///
/// `message` becomes the instance's `error_message` when the error escapes
/// the workflow body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// Activity errors propagate into the workflow body unchanged, so `?` on an
/// activity call fails the workflow with the activity's message.
impl From<ActivityError> for WorkflowError {
    fn from(err: ActivityError) -> Self {
        Self {
            message: err.message,
            code: err.error_type,
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string()).with_code(crate::activity::SERIALIZATION_ERROR)
    }
}

impl From<anyhow::Error> for WorkflowError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// A workflow orchestrates activities and returns a durable result
///
/// The body is ordinary async code. Every activity call goes through the
/// [`WorkflowContext`], which records it durably and runs it inline on the
/// same worker. Activity calls execute strictly in the order the body
/// issues them.
///
/// # Restarts
///
/// A workflow interrupted by a crash is restarted from the beginning by
/// recovery, re-running activities that had already completed. Activities
/// with external side effects must be idempotent (see
/// [`ActivityContext::idempotency_key`](crate::ActivityContext::idempotency_key)).
///
/// # Example
///
/// ```ignore
/// use tallyloom_durable::prelude::*;
///
/// struct OrderWorkflow;
///
/// #[async_trait]
/// impl Workflow for OrderWorkflow {
///     const TYPE: &'static str = "order_workflow";
///     type Input = OrderInput;
///     type Output = OrderResult;
///
///     async fn run(
///         &self,
///         ctx: &WorkflowContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, WorkflowError> {
///         let validated = ctx.call_activity("validate_order", json!({ "order_id": input.order_id })).await?;
///         // ...
///     }
/// }
/// ```
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Name under which the workflow is registered and persisted
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type when workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Run the workflow body
    async fn run(
        &self,
        ctx: &WorkflowContext,
        input: Self::Input,
    ) -> Result<Self::Output, WorkflowError>;
}
