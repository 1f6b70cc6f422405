//! Name-based registry of workflow and activity handlers
//!
//! Handlers are type-erased to JSON in and JSON out, so the engine can
//! resolve them by the name persisted on a workflow row without knowing the
//! concrete type. The registry is filled during setup and moved into an
//! `Arc` when the orchestrator starts; from then on it is only read.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::activity::{Activity, ActivityContext, ActivityError};
use crate::workflow::{Workflow, WorkflowContext, WorkflowError};

/// Type-erased workflow body
pub type WorkflowHandler =
    Arc<dyn Fn(WorkflowContext, Value) -> BoxFuture<'static, Result<Value, WorkflowError>> + Send + Sync>;

/// Type-erased activity body
pub type ActivityHandler =
    Arc<dyn Fn(ActivityContext, Value) -> BoxFuture<'static, Result<Value, ActivityError>> + Send + Sync>;

/// Which namespace a handler name lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Workflow,
    Activity,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workflow => write!(f, "workflow"),
            Self::Activity => write!(f, "activity"),
        }
    }
}

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Name already taken for this kind
    #[error("{kind} already registered: {name}")]
    DuplicateRegistration { kind: HandlerKind, name: String },

    /// Name not registered for this kind
    #[error("unknown {kind}: {name}")]
    UnknownHandler { kind: HandlerKind, name: String },
}

/// Registry of workflow and activity handlers
///
/// Workflows and activities have separate namespaces: an activity and a
/// workflow may share a name.
#[derive(Default)]
pub struct Registry {
    workflows: HashMap<String, WorkflowHandler>,
    activities: HashMap<String, ActivityHandler>,
}

impl Registry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed workflow under `W::TYPE`
    pub fn register_workflow<W: Workflow>(&mut self, workflow: W) -> Result<(), RegistryError> {
        let workflow = Arc::new(workflow);
        let handler: WorkflowHandler = Arc::new(move |ctx: WorkflowContext, input: Value| {
            let workflow = Arc::clone(&workflow);
            async move {
                let typed_input: W::Input = serde_json::from_value(input)?;
                let output = workflow.run(&ctx, typed_input).await?;
                Ok::<_, WorkflowError>(serde_json::to_value(output)?)
            }
            .boxed()
        });
        self.insert_workflow(W::TYPE, handler)
    }

    /// Register a workflow body written as a closure over JSON values
    ///
    /// # Example
    ///
    /// ```ignore
    /// registry.register_workflow_fn("w", |ctx, input| async move {
    ///     let doubled = ctx.call_activity("double", input).await?;
    ///     Ok(doubled)
    /// })?;
    /// ```
    pub fn register_workflow_fn<F, Fut>(&mut self, name: &str, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
    {
        let handler: WorkflowHandler = Arc::new(move |ctx, input| handler(ctx, input).boxed());
        self.insert_workflow(name, handler)
    }

    /// Register a typed activity under `A::TYPE`
    pub fn register_activity<A: Activity>(&mut self, activity: A) -> Result<(), RegistryError> {
        let activity = Arc::new(activity);
        let handler: ActivityHandler = Arc::new(move |ctx: ActivityContext, input: Value| {
            let activity = Arc::clone(&activity);
            async move {
                let typed_input: A::Input = serde_json::from_value(input)?;
                let output = activity.execute(&ctx, typed_input).await?;
                Ok::<_, ActivityError>(serde_json::to_value(output)?)
            }
            .boxed()
        });
        self.insert_activity(A::TYPE, handler)
    }

    /// Register an activity body written as a closure over JSON values
    pub fn register_activity_fn<F, Fut>(&mut self, name: &str, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        let handler: ActivityHandler = Arc::new(move |ctx, input| handler(ctx, input).boxed());
        self.insert_activity(name, handler)
    }

    fn insert_workflow(&mut self, name: &str, handler: WorkflowHandler) -> Result<(), RegistryError> {
        if self.workflows.contains_key(name) {
            return Err(RegistryError::DuplicateRegistration {
                kind: HandlerKind::Workflow,
                name: name.to_string(),
            });
        }
        self.workflows.insert(name.to_string(), handler);
        Ok(())
    }

    fn insert_activity(&mut self, name: &str, handler: ActivityHandler) -> Result<(), RegistryError> {
        if self.activities.contains_key(name) {
            return Err(RegistryError::DuplicateRegistration {
                kind: HandlerKind::Activity,
                name: name.to_string(),
            });
        }
        self.activities.insert(name.to_string(), handler);
        Ok(())
    }

    /// Resolve a workflow handler by name
    pub fn resolve_workflow(&self, name: &str) -> Result<WorkflowHandler, RegistryError> {
        self.workflows
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownHandler {
                kind: HandlerKind::Workflow,
                name: name.to_string(),
            })
    }

    /// Resolve an activity handler by name
    pub fn resolve_activity(&self, name: &str) -> Result<ActivityHandler, RegistryError> {
        self.activities
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownHandler {
                kind: HandlerKind::Activity,
                name: name.to_string(),
            })
    }

    /// Check if a handler is registered
    pub fn contains(&self, kind: HandlerKind, name: &str) -> bool {
        match kind {
            HandlerKind::Workflow => self.workflows.contains_key(name),
            HandlerKind::Activity => self.activities.contains_key(name),
        }
    }

    /// Registered names of one kind, sorted
    pub fn names(&self, kind: HandlerKind) -> Vec<&str> {
        let mut names: Vec<&str> = match kind {
            HandlerKind::Workflow => self.workflows.keys().map(|s| s.as_str()).collect(),
            HandlerKind::Activity => self.activities.keys().map(|s| s.as_str()).collect(),
        };
        names.sort_unstable();
        names
    }

    /// Total number of registered handlers
    pub fn len(&self) -> usize {
        self.workflows.len() + self.activities.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty() && self.activities.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("workflows", &self.names(HandlerKind::Workflow))
            .field("activities", &self.names(HandlerKind::Activity))
            .finish()
    }
}
