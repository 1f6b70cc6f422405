//! Shared fixtures for orchestrator integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tallyloom_durable::prelude::*;
use tempfile::TempDir;
use uuid::Uuid;

/// Which store backs an orchestrator under test
#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    Sqlite,
}

/// Store plus the temp directory keeping its database file alive
pub struct TestStore {
    pub store: Arc<dyn WorkflowStore>,
    pub dir: Option<TempDir>,
}

pub async fn open_store(backend: Backend) -> TestStore {
    match backend {
        Backend::Memory => TestStore {
            store: Arc::new(InMemoryWorkflowStore::new()),
            dir: None,
        },
        Backend::Sqlite => {
            let dir = tempfile::tempdir().unwrap();
            let store = SqliteWorkflowStore::connect(&database_url(&dir)).await.unwrap();
            TestStore {
                store: Arc::new(store),
                dir: Some(dir),
            }
        }
    }
}

pub fn database_url(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("workflows.db").display())
}

pub fn pool_config(max_workers: usize) -> WorkerPoolConfig {
    WorkerPoolConfig::default()
        .with_max_workers(max_workers)
        .with_shutdown_timeout(Duration::from_secs(5))
}

/// `double(x) -> x * 2` after `delay`, and `w(x)` returning `double(x)`
pub fn register_double(orchestrator: &Orchestrator, delay: Duration) {
    orchestrator
        .register_activity_fn("double", move |_ctx, input: Value| async move {
            tokio::time::sleep(delay).await;
            let x = input["x"]
                .as_i64()
                .ok_or_else(|| ActivityError::non_retryable("x must be an integer"))?;
            Ok(json!(x * 2))
        })
        .unwrap();
    orchestrator
        .register_workflow_fn("w", |ctx, input| async move {
            Ok(ctx.call_activity("double", input).await?)
        })
        .unwrap();
}

/// `fail()` always errors, and `w2()` calls it
pub fn register_fail(orchestrator: &Orchestrator) {
    orchestrator
        .register_activity_fn("fail", |_ctx, _input| async move {
            Err(ActivityError::non_retryable("fail() always raises"))
        })
        .unwrap();
    orchestrator
        .register_workflow_fn("w2", |ctx, input| async move {
            Ok(ctx.call_activity("fail", input).await?)
        })
        .unwrap();
}

pub const WAIT: Duration = Duration::from_secs(10);

/// Poll until `check` accepts the workflow, or panic after [`WAIT`]
pub async fn wait_until<F>(store: &dyn WorkflowStore, id: Uuid, mut check: F) -> WorkflowInstance
where
    F: FnMut(&WorkflowInstance) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let workflow = store.get_workflow(id).await.unwrap();
        if check(&workflow) {
            return workflow;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workflow {id} stuck in {}",
            workflow.status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Terminal rows carry exactly one of output and error
pub fn assert_terminal_invariant(workflow: &WorkflowInstance) {
    match workflow.status {
        WorkflowStatus::Done => {
            assert!(workflow.output.is_some(), "done without output");
            assert!(workflow.error_message.is_none(), "done with error");
        }
        WorkflowStatus::Failed => {
            assert!(workflow.output.is_none(), "failed with output");
            let message = workflow.error_message.as_deref().unwrap_or_default();
            assert!(!message.is_empty(), "failed without error message");
        }
        other => panic!("workflow {} not terminal: {other}", workflow.id),
    }
    assert_eq!(workflow.current_activity, None);
}
