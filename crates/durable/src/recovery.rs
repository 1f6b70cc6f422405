//! Startup recovery of incomplete workflows
//!
//! A `pending` row is resubmitted as is. A `processing` row that this
//! process does not own was claimed by a process that died; it is released
//! back to `pending` and resubmitted, so the workflow restarts from the
//! beginning. Claiming still goes through `mark_processing`, which keeps a
//! rerun of recovery from producing a second concurrent execution.

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::persistence::{StoreError, WorkflowStatus, WorkflowStore};
use crate::worker::{WorkerPool, WorkerPoolError};

/// Errors from a recovery pass
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Pool refused a submission
    #[error("worker pool error: {0}")]
    Pool(#[from] WorkerPoolError),
}

/// Summary of one recovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// `pending` rows handed to the pool
    pub resubmitted_pending: usize,

    /// Orphaned `processing` rows reset and handed to the pool
    pub restarted_processing: usize,

    /// Rows already owned by this process, or that changed state mid-pass
    pub skipped: usize,
}

impl RecoveryReport {
    /// Rows submitted by this pass
    pub fn total_resubmitted(&self) -> usize {
        self.resubmitted_pending + self.restarted_processing
    }
}

/// Resubmit every incomplete workflow in `store` to `pool`
#[instrument(skip_all)]
pub async fn recover(
    store: &dyn WorkflowStore,
    pool: &WorkerPool,
) -> Result<RecoveryReport, RecoveryError> {
    let incomplete = store.list_incomplete().await?;
    let mut report = RecoveryReport::default();

    for workflow in incomplete {
        if pool.is_tracked(workflow.id) {
            report.skipped += 1;
            continue;
        }

        match workflow.status {
            WorkflowStatus::Pending => {
                if pool.submit(workflow.id)? {
                    report.resubmitted_pending += 1;
                } else {
                    report.skipped += 1;
                }
            }
            WorkflowStatus::Processing => {
                match store.reset_to_pending(workflow.id).await {
                    Ok(()) => {}
                    Err(e) if e.is_invalid_transition() => {
                        warn!(workflow_id = %workflow.id, "workflow changed state during recovery: {}", e);
                        report.skipped += 1;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }

                info!(
                    workflow_id = %workflow.id,
                    workflow = %workflow.name,
                    interrupted_activity = workflow.current_activity.as_deref().unwrap_or("-"),
                    "restarting interrupted workflow"
                );

                if pool.submit(workflow.id)? {
                    report.restarted_processing += 1;
                } else {
                    report.skipped += 1;
                }
            }
            WorkflowStatus::Done | WorkflowStatus::Failed => {}
        }
    }

    info!(
        resubmitted_pending = report.resubmitted_pending,
        restarted_processing = report.restarted_processing,
        skipped = report.skipped,
        "recovery complete"
    );

    Ok(report)
}
