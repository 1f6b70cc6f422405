//! Demo handlers registered by the worker binary
//!
//! `double` and `w` mirror the smallest useful workflow: one activity call
//! whose result becomes the workflow output. `fail` and `w2` show a failing
//! activity propagating into a failed workflow.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tallyloom_durable::prelude::*;

/// Workflow invoked at startup when `DEMO_INPUT` is set and no other name
/// is configured
pub const DEFAULT_DEMO_WORKFLOW: &str = "w";

#[derive(Debug, Serialize, Deserialize)]
pub struct DoubleInput {
    pub x: i64,
}

pub struct DoubleActivity {
    /// Artificial latency so `current_activity` is observable from outside
    pub delay: Duration,
}

#[async_trait]
impl Activity for DoubleActivity {
    const TYPE: &'static str = "double";
    type Input = DoubleInput;
    type Output = i64;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        tracing::debug!(key = %ctx.idempotency_key(), x = input.x, "doubling");
        tokio::time::sleep(self.delay).await;
        input
            .x
            .checked_mul(2)
            .ok_or_else(|| ActivityError::non_retryable(format!("{} overflows when doubled", input.x)))
    }
}

pub struct DoubleWorkflow;

#[async_trait]
impl Workflow for DoubleWorkflow {
    const TYPE: &'static str = DEFAULT_DEMO_WORKFLOW;
    type Input = DoubleInput;
    type Output = i64;

    async fn run(
        &self,
        ctx: &WorkflowContext,
        input: Self::Input,
    ) -> Result<Self::Output, WorkflowError> {
        Ok(ctx.execute::<DoubleActivity>(input).await?)
    }
}

/// Register every demo handler
pub fn register(orchestrator: &Orchestrator, delay: Duration) -> Result<(), OrchestratorError> {
    orchestrator.register_activity(DoubleActivity { delay })?;
    orchestrator.register_workflow(DoubleWorkflow)?;

    orchestrator.register_activity_fn("fail", |_ctx, _input| async move {
        Err(ActivityError::non_retryable("fail always fails"))
    })?;
    orchestrator.register_workflow_fn("w2", |ctx, input| async move {
        let output = ctx.call_activity("fail", input).await?;
        Ok(output)
    })?;

    Ok(())
}
