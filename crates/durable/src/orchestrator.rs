//! Orchestrator: the host-facing surface of the engine
//!
//! Owns the store, the registry and the worker pool for its whole lifetime.
//! The lifecycle is linear: register handlers, `start` (which runs recovery
//! before accepting invocations), invoke and query, `stop`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::{Activity, ActivityContext, ActivityError};
use crate::config::OrchestratorConfig;
use crate::engine::{HandlerKind, Registry, RegistryError, WorkflowExecutor};
use crate::persistence::{
    ActivityExecution, SqliteWorkflowStore, StoreError, WorkflowFilter, WorkflowInstance,
    WorkflowStore,
};
use crate::recovery::{self, RecoveryError, RecoveryReport};
use crate::status::{StatusApi, StatusError};
use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
use crate::workflow::{Workflow, WorkflowContext, WorkflowError};

/// Interval between store reads in [`Orchestrator::wait_for_completion`]
const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Errors from orchestrator operations
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Registration or `start` after the orchestrator was started
    #[error("orchestrator has already been started")]
    AlreadyStarted,

    /// Invocation before `start` or after `stop`
    #[error("orchestrator is not running")]
    NotRunning,

    /// `wait_for_completion` deadline passed
    #[error("workflow {0} did not finish in time")]
    Timeout(Uuid),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Registry error
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Status query error
    #[error(transparent)]
    Status(#[from] StatusError),

    /// Worker pool error
    #[error("worker pool error: {0}")]
    Pool(#[from] WorkerPoolError),

    /// Recovery error
    #[error("recovery failed: {0}")]
    Recovery(#[from] RecoveryError),
}

impl OrchestratorError {
    /// Whether this is a status query for an id that does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Status(StatusError::NotFound(_)) | Self::Store(StoreError::NotFound(_))
        )
    }

    /// Whether this names an unregistered workflow or activity
    pub fn is_unknown_handler(&self) -> bool {
        matches!(self, Self::Registry(RegistryError::UnknownHandler { .. }))
    }
}

enum Lifecycle {
    Setup(Setup),
    Starting,
    Running(Engine),
    Stopped,
}

#[derive(Default)]
struct Setup {
    registry: Registry,
    /// First registration failure; refuses `start` once set
    failure: Option<RegistryError>,
}

#[derive(Clone)]
struct Engine {
    registry: Arc<Registry>,
    pool: Arc<WorkerPool>,
}

/// Durable workflow orchestrator
///
/// # Example
///
/// ```ignore
/// use tallyloom_durable::prelude::*;
///
/// let orchestrator = Orchestrator::connect(OrchestratorConfig::from_env()).await?;
///
/// orchestrator.register_activity_fn("double", |_ctx, input| async move {
///     Ok(json!(input["x"].as_i64().unwrap_or_default() * 2))
/// })?;
/// orchestrator.register_workflow_fn("w", |ctx, input| async move {
///     Ok(ctx.call_activity("double", input).await?)
/// })?;
///
/// orchestrator.start().await?;
///
/// let id = orchestrator.invoke_workflow("w", json!({"x": 5})).await?;
/// let finished = orchestrator.wait_for_completion(id, Duration::from_secs(5)).await?;
/// assert_eq!(finished.output, Some(json!(10)));
///
/// orchestrator.stop().await?;
/// ```
pub struct Orchestrator {
    store: Arc<dyn WorkflowStore>,
    status: StatusApi,
    pool_config: WorkerPoolConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl Orchestrator {
    /// Create an orchestrator over an existing store
    pub fn new(store: Arc<dyn WorkflowStore>, pool_config: WorkerPoolConfig) -> Self {
        Self {
            status: StatusApi::new(store.clone()),
            store,
            pool_config,
            lifecycle: Mutex::new(Lifecycle::Setup(Setup::default())),
        }
    }

    /// Open the SQLite store named by `config` and create an orchestrator
    pub async fn connect(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        if config.database_url.trim().is_empty() {
            return Err(OrchestratorError::Config(
                "database_url must not be empty".to_string(),
            ));
        }

        let store = SqliteWorkflowStore::connect(&config.database_url).await?;
        Ok(Self::new(Arc::new(store), config.pool))
    }

    // =========================================================================
    // Registration
    // =========================================================================

    fn with_registry<T>(
        &self,
        f: impl FnOnce(&mut Registry) -> Result<T, RegistryError>,
    ) -> Result<T, OrchestratorError> {
        match &mut *self.lifecycle.lock() {
            Lifecycle::Setup(setup) => f(&mut setup.registry).map_err(|e| {
                setup.failure.get_or_insert_with(|| e.clone());
                e.into()
            }),
            _ => Err(OrchestratorError::AlreadyStarted),
        }
    }

    /// Register a typed workflow under `W::TYPE`
    pub fn register_workflow<W: Workflow>(&self, workflow: W) -> Result<(), OrchestratorError> {
        self.with_registry(|registry| registry.register_workflow(workflow))
    }

    /// Register a workflow body written as a closure over JSON values
    pub fn register_workflow_fn<F, Fut>(&self, name: &str, handler: F) -> Result<(), OrchestratorError>
    where
        F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
    {
        self.with_registry(|registry| registry.register_workflow_fn(name, handler))
    }

    /// Register a typed activity under `A::TYPE`
    pub fn register_activity<A: Activity>(&self, activity: A) -> Result<(), OrchestratorError> {
        self.with_registry(|registry| registry.register_activity(activity))
    }

    /// Register an activity body written as a closure over JSON values
    pub fn register_activity_fn<F, Fut>(&self, name: &str, handler: F) -> Result<(), OrchestratorError>
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        self.with_registry(|registry| registry.register_activity_fn(name, handler))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the worker pool and run recovery
    ///
    /// Invocations are accepted only after recovery has resubmitted every
    /// incomplete instance. A failed registration is fatal: `start` returns
    /// the first registration error and leaves the orchestrator in setup.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<RecoveryReport, OrchestratorError> {
        let registry = {
            let mut lifecycle = self.lifecycle.lock();
            if let Lifecycle::Setup(Setup {
                failure: Some(failure),
                ..
            }) = &*lifecycle
            {
                error!("Refusing to start after failed registration: {}", failure);
                return Err(failure.clone().into());
            }
            match std::mem::replace(&mut *lifecycle, Lifecycle::Starting) {
                Lifecycle::Setup(setup) => setup.registry,
                other => {
                    *lifecycle = other;
                    return Err(OrchestratorError::AlreadyStarted);
                }
            }
        };

        let registry = Arc::new(registry);
        let executor = WorkflowExecutor::new(self.store.clone(), registry.clone());
        let pool = Arc::new(WorkerPool::new(executor, self.pool_config.clone()));

        info!(
            workflows = ?registry.names(HandlerKind::Workflow),
            activities = ?registry.names(HandlerKind::Activity),
            max_workers = pool.config().max_workers,
            "Starting orchestrator"
        );

        if let Err(e) = pool.start() {
            *self.lifecycle.lock() = Lifecycle::Stopped;
            return Err(e.into());
        }

        let report = match recovery::recover(self.store.as_ref(), &pool).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Recovery failed, stopping worker pool: {}", e);
                *self.lifecycle.lock() = Lifecycle::Stopped;
                if let Err(shutdown_err) = pool.shutdown().await {
                    warn!("Failed to drain worker pool: {}", shutdown_err);
                }
                return Err(e.into());
            }
        };

        *self.lifecycle.lock() = Lifecycle::Running(Engine { registry, pool });
        Ok(report)
    }

    /// Stop accepting invocations and drain running workflows
    ///
    /// Safe to call more than once. Returns `Pool(ShutdownTimeout)` if
    /// workflows were still running at the drain deadline; those are
    /// restarted by recovery the next time an orchestrator starts on the
    /// same store.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        match previous {
            Lifecycle::Running(engine) => {
                info!("Stopping orchestrator");
                engine.pool.shutdown().await?;
                info!("Orchestrator stopped");
                Ok(())
            }
            Lifecycle::Starting => {
                *self.lifecycle.lock() = Lifecycle::Starting;
                Err(OrchestratorError::NotRunning)
            }
            Lifecycle::Setup(_) | Lifecycle::Stopped => Ok(()),
        }
    }

    /// Whether invocations are currently accepted
    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }

    fn engine(&self) -> Result<Engine, OrchestratorError> {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(engine) => Ok(engine.clone()),
            _ => Err(OrchestratorError::NotRunning),
        }
    }

    /// Re-run recovery while running
    ///
    /// Instances queued or running in this process are skipped.
    pub async fn recover(&self) -> Result<RecoveryReport, OrchestratorError> {
        let engine = self.engine()?;
        Ok(recovery::recover(self.store.as_ref(), &engine.pool).await?)
    }

    // =========================================================================
    // Invocation
    // =========================================================================

    /// Persist a new `pending` instance and queue it for execution
    ///
    /// Fails with `UnknownHandler` without writing anything if `name` is not
    /// a registered workflow.
    #[instrument(skip(self, input))]
    pub async fn invoke_workflow(&self, name: &str, input: Value) -> Result<Uuid, OrchestratorError> {
        let engine = self.engine()?;

        if !engine.registry.contains(HandlerKind::Workflow, name) {
            return Err(RegistryError::UnknownHandler {
                kind: HandlerKind::Workflow,
                name: name.to_string(),
            }
            .into());
        }

        let workflow_id = self.store.create_workflow(name, input).await?;

        if let Err(e) = engine.pool.submit(workflow_id) {
            warn!(%workflow_id, "Workflow persisted but not queued: {}", e);
            return Err(e.into());
        }

        info!(%workflow_id, workflow = name, "workflow invoked");
        Ok(workflow_id)
    }

    /// Invoke a typed workflow registered under `W::TYPE`
    pub async fn invoke<W: Workflow>(&self, input: W::Input) -> Result<Uuid, OrchestratorError> {
        let input = serde_json::to_value(input)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.invoke_workflow(W::TYPE, input).await
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Full record of one instance
    pub async fn get_workflow_status(
        &self,
        workflow_id: Uuid,
    ) -> Result<WorkflowInstance, OrchestratorError> {
        Ok(self.status.get_status(workflow_id).await?)
    }

    /// Instances matching `filter`, oldest first
    pub async fn list_workflows(
        &self,
        filter: WorkflowFilter,
    ) -> Result<Vec<WorkflowInstance>, OrchestratorError> {
        Ok(self.status.list(filter).await?)
    }

    /// Activity executions of one instance, in call order
    pub async fn activity_history(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<ActivityExecution>, OrchestratorError> {
        Ok(self.status.activity_history(workflow_id).await?)
    }

    /// Poll until the instance is `done` or `failed`
    pub async fn wait_for_completion(
        &self,
        workflow_id: Uuid,
        timeout: Duration,
    ) -> Result<WorkflowInstance, OrchestratorError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let workflow = self.get_workflow_status(workflow_id).await?;
            if workflow.status.is_terminal() {
                return Ok(workflow);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OrchestratorError::Timeout(workflow_id));
            }
            tokio::time::sleep(COMPLETION_POLL_INTERVAL).await;
        }
    }

    /// Status queries without the rest of the orchestrator
    pub fn status_api(&self) -> &StatusApi {
        &self.status
    }

    /// Get the store
    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lifecycle = match &*self.lifecycle.lock() {
            Lifecycle::Setup(_) => "setup",
            Lifecycle::Starting => "starting",
            Lifecycle::Running(_) => "running",
            Lifecycle::Stopped => "stopped",
        };
        f.debug_struct("Orchestrator")
            .field("pool_config", &self.pool_config)
            .field("lifecycle", &lifecycle)
            .finish_non_exhaustive()
    }
}
