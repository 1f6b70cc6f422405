//! Worker pool for workflow execution
//!
//! A fixed set of worker tasks pulls workflow ids from an in-process queue
//! and runs each one to completion through the [`WorkflowExecutor`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::duration_millis;
use crate::engine::WorkflowExecutor;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks, which is also the bound on workflows
    /// running at the same time
    pub max_workers: usize,

    /// How long `shutdown` waits for in-flight workflows
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Set the number of worker tasks (at least 1)
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.max(1);
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Created, workers not spawned yet
    Idle,
    /// Workers running and accepting submissions
    Running,
    /// Finishing in-flight workflows, not accepting new ones
    Draining,
    /// All workers exited (or the drain deadline passed)
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// `start` called more than once
    #[error("worker pool has already been started")]
    AlreadyStarted,

    /// Submission while not running
    #[error("worker pool is not running")]
    NotRunning,

    /// In-flight workflows outlived the drain deadline
    #[error("graceful shutdown timed out with {0} workflow(s) still running")]
    ShutdownTimeout(usize),
}

/// Pool of worker tasks executing workflow instances
///
/// Each worker runs one workflow at a time, activities included, so at most
/// `max_workers` workflows are `processing` on behalf of this pool. An id
/// is tracked from submission until its worker finishes with it; submitting
/// a tracked id again is a no-op.
///
/// # Example
///
/// ```ignore
/// use tallyloom_durable::worker::{WorkerPool, WorkerPoolConfig};
///
/// let pool = WorkerPool::new(executor, WorkerPoolConfig::default().with_max_workers(8));
/// pool.start()?;
///
/// pool.submit(workflow_id)?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    executor: WorkflowExecutor,
    config: WorkerPoolConfig,
    queue_tx: Mutex<Option<mpsc::UnboundedSender<Uuid>>>,
    tracked: Arc<DashSet<Uuid>>,
    active: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    tracker: TaskTracker,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(executor: WorkflowExecutor, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let max_workers = config.max_workers;
        let config = config.with_max_workers(max_workers);

        Self {
            executor,
            config,
            queue_tx: Mutex::new(None),
            tracked: Arc::new(DashSet::new()),
            active: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Idle),
            tracker: TaskTracker::new(),
        }
    }

    /// Spawn the worker tasks
    ///
    /// Must be called from within a Tokio runtime.
    #[instrument(skip(self), fields(max_workers = self.config.max_workers))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        let mut status = self.status.write();
        if *status != WorkerPoolStatus::Idle {
            return Err(WorkerPoolError::AlreadyStarted);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(tokio::sync::Mutex::new(rx));

        for worker_index in 0..self.config.max_workers {
            self.tracker.spawn(worker_loop(
                worker_index,
                self.executor.clone(),
                Arc::clone(&queue),
                Arc::clone(&self.tracked),
                Arc::clone(&self.active),
                self.shutdown_tx.subscribe(),
            ));
        }

        *self.queue_tx.lock() = Some(tx);
        *status = WorkerPoolStatus::Running;

        info!(max_workers = self.config.max_workers, "Worker pool started");
        Ok(())
    }

    /// Queue a workflow for execution
    ///
    /// Returns `false` without queueing if the id is already queued or
    /// running in this pool.
    pub fn submit(&self, workflow_id: Uuid) -> Result<bool, WorkerPoolError> {
        if *self.status.read() != WorkerPoolStatus::Running {
            return Err(WorkerPoolError::NotRunning);
        }

        if !self.tracked.insert(workflow_id) {
            debug!(%workflow_id, "Workflow already tracked, not resubmitting");
            return Ok(false);
        }

        let sent = match self.queue_tx.lock().as_ref() {
            Some(tx) => tx.send(workflow_id).is_ok(),
            None => false,
        };
        if !sent {
            self.tracked.remove(&workflow_id);
            return Err(WorkerPoolError::NotRunning);
        }

        debug!(%workflow_id, "Workflow queued");
        Ok(true)
    }

    /// Whether the id is queued or running in this pool
    pub fn is_tracked(&self, workflow_id: Uuid) -> bool {
        self.tracked.contains(&workflow_id)
    }

    /// Stop accepting work and wait for in-flight workflows
    ///
    /// Queued workflows that no worker has picked up stay `pending` in the
    /// store. If the drain deadline passes, the remaining workflows are
    /// abandoned in `processing` and will be restarted by recovery.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            match *status {
                WorkerPoolStatus::Idle | WorkerPoolStatus::Stopped => {
                    *status = WorkerPoolStatus::Stopped;
                    return Ok(());
                }
                WorkerPoolStatus::Draining => return Ok(()),
                WorkerPoolStatus::Running => *status = WorkerPoolStatus::Draining,
            }
        }

        info!(
            active = self.active_count(),
            "Initiating graceful shutdown"
        );

        self.queue_tx.lock().take();
        self.shutdown_tx.send_replace(true);
        self.tracker.close();

        let drained = tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait()).await;
        *self.status.write() = WorkerPoolStatus::Stopped;

        match drained {
            Ok(()) => {
                info!("Worker pool stopped");
                Ok(())
            }
            Err(_) => {
                let remaining = self.active_count();
                warn!(remaining, "Shutdown timeout reached");
                Err(WorkerPoolError::ShutdownTimeout(remaining))
            }
        }
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Workflows currently being executed by a worker
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Workflows submitted but not yet picked up
    pub fn queued_count(&self) -> usize {
        self.tracked.len().saturating_sub(self.active_count())
    }

    /// Get the configuration
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("status", &self.status())
            .field("active", &self.active_count())
            .field("tracked", &self.tracked.len())
            .finish()
    }
}

async fn worker_loop(
    worker_index: usize,
    executor: WorkflowExecutor,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Uuid>>>,
    tracked: Arc<DashSet<Uuid>>,
    active: Arc<AtomicUsize>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker_index, "Worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => None,
            id = async { queue.lock().await.recv().await } => id,
        };

        let Some(workflow_id) = next else {
            break;
        };

        active.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = executor.run_instance(workflow_id).await {
            error!(worker_index, %workflow_id, "Failed to run workflow: {}", e);
        }
        tracked.remove(&workflow_id);
        active.fetch_sub(1, Ordering::SeqCst);
    }

    debug!(worker_index, "Worker exited");
}
