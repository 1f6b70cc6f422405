//! SQLite implementation of WorkflowStore
//!
//! Single-file durable persistence with:
//! - Claiming via a conditional `UPDATE ... WHERE status = 'pending'`
//! - Write-first transactions for multi-row operations, so WAL readers never
//!   need to upgrade a stale snapshot
//! - Store-assigned, per-workflow monotonic timestamps

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;

const SCHEMA: &str = include_str!("schema.sql");

const WORKFLOW_COLUMNS: &str = "id, name, input, status, current_activity, output, \
                                error_message, created_at, updated_at";

const ACTIVITY_COLUMNS: &str =
    "id, workflow_id, activity_name, input, output, error, started_at, finished_at";

/// Default number of pooled connections for file databases
pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// SQLite implementation of WorkflowStore
///
/// # Example
///
/// ```ignore
/// use tallyloom_durable::SqliteWorkflowStore;
///
/// let store = SqliteWorkflowStore::connect("sqlite://orchestrator.db").await?;
/// ```
#[derive(Clone)]
pub struct SqliteWorkflowStore {
    pool: SqlitePool,
}

impl SqliteWorkflowStore {
    /// Wrap an existing pool; call [`migrate`](Self::migrate) before use
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `database_url` and apply the schema
    ///
    /// In-memory URLs get a single connection, since every SQLite connection
    /// to `:memory:` is a separate database.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(database_url)
            .map_err(db_error)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let max_connections = if in_memory { 1 } else { DEFAULT_MAX_CONNECTIONS };
        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
        if in_memory {
            // Closing the only connection would drop the database
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| {
                error!("Failed to open SQLite database: {}", e);
                db_error(e)
            })?;

        let store = Self::new(pool);
        store.migrate().await?;
        debug!(%database_url, max_connections, "opened workflow store");
        Ok(store)
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to apply schema: {}", e);
                db_error(e)
            })?;
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all pooled connections
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Classify a conditional update that matched no row
    async fn transition_error(&self, workflow_id: Uuid, operation: &'static str) -> StoreError {
        let status = sqlx::query("SELECT status FROM workflows WHERE id = ?1")
            .bind(workflow_id.to_string())
            .fetch_optional(&self.pool)
            .await;

        match status {
            Ok(Some(row)) => match row.try_get::<String, _>("status") {
                Ok(status) => match status.parse() {
                    Ok(from) => StoreError::InvalidTransition {
                        workflow_id,
                        from,
                        operation,
                    },
                    Err(e) => e,
                },
                Err(e) => db_error(e),
            },
            Ok(None) => StoreError::NotFound(workflow_id),
            Err(e) => db_error(e),
        }
    }
}

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {micros}")))
}

fn to_json(value: &serde_json::Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json(text: &str) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_uuid(text: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(text).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn workflow_from_row(row: &SqliteRow) -> Result<WorkflowInstance, StoreError> {
    let id: String = row.try_get("id").map_err(db_error)?;
    let input: String = row.try_get("input").map_err(db_error)?;
    let status: String = row.try_get("status").map_err(db_error)?;
    let output: Option<String> = row.try_get("output").map_err(db_error)?;

    Ok(WorkflowInstance {
        id: parse_uuid(&id)?,
        name: row.try_get("name").map_err(db_error)?,
        input: from_json(&input)?,
        status: status.parse()?,
        current_activity: row.try_get("current_activity").map_err(db_error)?,
        output: output.as_deref().map(from_json).transpose()?,
        error_message: row.try_get("error_message").map_err(db_error)?,
        created_at: from_micros(row.try_get("created_at").map_err(db_error)?)?,
        updated_at: from_micros(row.try_get("updated_at").map_err(db_error)?)?,
    })
}

fn activity_from_row(row: &SqliteRow) -> Result<ActivityExecution, StoreError> {
    let id: String = row.try_get("id").map_err(db_error)?;
    let workflow_id: String = row.try_get("workflow_id").map_err(db_error)?;
    let input: String = row.try_get("input").map_err(db_error)?;
    let output: Option<String> = row.try_get("output").map_err(db_error)?;
    let finished_at: Option<i64> = row.try_get("finished_at").map_err(db_error)?;

    Ok(ActivityExecution {
        id: parse_uuid(&id)?,
        workflow_id: parse_uuid(&workflow_id)?,
        activity_name: row.try_get("activity_name").map_err(db_error)?,
        input: from_json(&input)?,
        output: output.as_deref().map(from_json).transpose()?,
        error: row.try_get("error").map_err(db_error)?,
        started_at: from_micros(row.try_get("started_at").map_err(db_error)?)?,
        finished_at: finished_at.map(from_micros).transpose()?,
    })
}

#[async_trait]
impl WorkflowStore for SqliteWorkflowStore {
    #[instrument(skip(self, input))]
    async fn create_workflow(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<Uuid, StoreError> {
        let workflow = WorkflowInstance::pending(name, input, Utc::now());
        let now = to_micros(workflow.created_at);

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, input, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'pending', ?4, ?4)
            "#,
        )
        .bind(workflow.id.to_string())
        .bind(name)
        .bind(to_json(&workflow.input)?)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create workflow: {}", e);
            db_error(e)
        })?;

        debug!(workflow_id = %workflow.id, %name, "created workflow");
        Ok(workflow.id)
    }

    #[instrument(skip(self))]
    async fn mark_processing(&self, workflow_id: Uuid) -> Result<WorkflowInstance, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE workflows
            SET status = 'processing',
                updated_at = MAX(?2, updated_at)
            WHERE id = ?1 AND status = 'pending'
            RETURNING {WORKFLOW_COLUMNS}
            "#
        ))
        .bind(workflow_id.to_string())
        .bind(to_micros(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim workflow: {}", e);
            db_error(e)
        })?;

        match row {
            Some(row) => workflow_from_row(&row),
            None => Err(self.transition_error(workflow_id, "mark processing").await),
        }
    }

    #[instrument(skip(self))]
    async fn set_current_activity(
        &self,
        workflow_id: Uuid,
        activity_name: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET current_activity = ?2,
                updated_at = MAX(?3, updated_at)
            WHERE id = ?1 AND status = 'processing'
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(activity_name)
        .bind(to_micros(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(workflow_id, "set current activity").await);
        }
        Ok(())
    }

    #[instrument(skip(self, output))]
    async fn complete_workflow(
        &self,
        workflow_id: Uuid,
        output: serde_json::Value,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET status = 'done',
                current_activity = NULL,
                output = ?2,
                error_message = NULL,
                updated_at = MAX(?3, updated_at)
            WHERE id = ?1 AND status = 'processing'
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(to_json(&output)?)
        .bind(to_micros(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to complete workflow: {}", e);
            db_error(e)
        })?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(workflow_id, "complete").await);
        }
        debug!(%workflow_id, "workflow done");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fail_workflow(&self, workflow_id: Uuid, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET status = 'failed',
                current_activity = NULL,
                output = NULL,
                error_message = ?2,
                updated_at = MAX(?3, updated_at)
            WHERE id = ?1 AND status = 'processing'
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(error)
        .bind(to_micros(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fail workflow: {}", e);
            db_error(e)
        })?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(workflow_id, "fail").await);
        }
        debug!(%workflow_id, "workflow failed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reset_to_pending(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row = sqlx::query(
            r#"
            UPDATE workflows
            SET status = 'pending',
                current_activity = NULL,
                updated_at = MAX(?2, updated_at)
            WHERE id = ?1 AND status = 'processing'
            RETURNING updated_at
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(to_micros(Utc::now()))
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(db_error)?;
            return Err(self.transition_error(workflow_id, "reset to pending").await);
        };
        let now: i64 = row.try_get("updated_at").map_err(db_error)?;

        let interrupted = sqlx::query(
            r#"
            UPDATE activity_executions
            SET error = ?2,
                finished_at = MAX(?3, started_at)
            WHERE workflow_id = ?1 AND finished_at IS NULL
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(INTERRUPTED_BY_RESTART)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        debug!(
            %workflow_id,
            interrupted_activities = interrupted.rows_affected(),
            "reset workflow to pending"
        );
        Ok(())
    }

    #[instrument(skip(self, input))]
    async fn record_activity_start(
        &self,
        workflow_id: Uuid,
        activity_name: &str,
        input: serde_json::Value,
    ) -> Result<Uuid, StoreError> {
        let execution_id = Uuid::now_v7();
        let input = to_json(&input)?;
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Write first: takes the write lock before anything is read.
        let row = sqlx::query(
            r#"
            UPDATE workflows
            SET updated_at = MAX(?2, updated_at)
            WHERE id = ?1 AND status = 'processing'
            RETURNING updated_at
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(to_micros(Utc::now()))
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(db_error)?;
            return Err(self
                .transition_error(workflow_id, "record activity start")
                .await);
        };
        let started_at: i64 = row.try_get("updated_at").map_err(db_error)?;

        sqlx::query(
            r#"
            INSERT INTO activity_executions (id, workflow_id, activity_name, input, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(execution_id.to_string())
        .bind(workflow_id.to_string())
        .bind(activity_name)
        .bind(&input)
        .bind(started_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to record activity start: {}", e);
            db_error(e)
        })?;

        tx.commit().await.map_err(db_error)?;
        Ok(execution_id)
    }

    #[instrument(skip(self, outcome))]
    async fn record_activity_end(
        &self,
        execution_id: Uuid,
        outcome: ActivityOutcome,
    ) -> Result<(), StoreError> {
        let (output, error) = match outcome {
            ActivityOutcome::Completed(output) => (Some(to_json(&output)?), None),
            ActivityOutcome::Failed(error) => (None, Some(error)),
        };

        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row = sqlx::query(
            r#"
            UPDATE activity_executions
            SET output = ?2,
                error = ?3,
                finished_at = MAX(
                    ?4,
                    started_at,
                    (SELECT w.updated_at FROM workflows w
                     WHERE w.id = activity_executions.workflow_id)
                )
            WHERE id = ?1 AND finished_at IS NULL
            RETURNING workflow_id, finished_at
            "#,
        )
        .bind(execution_id.to_string())
        .bind(output)
        .bind(error)
        .bind(to_micros(Utc::now()))
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(db_error)?;
            let exists = sqlx::query("SELECT 1 FROM activity_executions WHERE id = ?1")
                .bind(execution_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;
            return Err(match exists {
                Some(_) => StoreError::ActivityAlreadyFinished(execution_id),
                None => StoreError::ActivityExecutionNotFound(execution_id),
            });
        };

        let workflow_id: String = row.try_get("workflow_id").map_err(db_error)?;
        let finished_at: i64 = row.try_get("finished_at").map_err(db_error)?;

        sqlx::query("UPDATE workflows SET updated_at = MAX(?2, updated_at) WHERE id = ?1")
            .bind(&workflow_id)
            .bind(finished_at)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_activity_executions(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<ActivityExecution>, StoreError> {
        // Surface NotFound rather than an empty history for unknown ids.
        self.get_workflow(workflow_id).await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {ACTIVITY_COLUMNS}
            FROM activity_executions
            WHERE workflow_id = ?1
            ORDER BY started_at, id
            "#
        ))
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load activity executions: {}", e);
            db_error(e)
        })?;

        rows.iter().map(activity_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowInstance, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?1"
        ))
        .bind(workflow_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get workflow: {}", e);
            db_error(e)
        })?
        .ok_or(StoreError::NotFound(workflow_id))?;

        workflow_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_workflows(
        &self,
        filter: WorkflowFilter,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {WORKFLOW_COLUMNS}
            FROM workflows
            WHERE (?1 IS NULL OR name = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at, id
            "#
        ))
        .bind(filter.name)
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list workflows: {}", e);
            db_error(e)
        })?;

        rows.iter().map(workflow_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn list_incomplete(&self) -> Result<Vec<WorkflowInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {WORKFLOW_COLUMNS}
            FROM workflows
            WHERE status IN ('pending', 'processing')
            ORDER BY created_at, id
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list incomplete workflows: {}", e);
            db_error(e)
        })?;

        rows.iter().map(workflow_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory_store() -> SqliteWorkflowStore {
        SqliteWorkflowStore::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should open")
    }

    #[test]
    fn test_micros_round_trip() {
        let now = Utc::now();
        let restored = from_micros(to_micros(now)).unwrap();
        assert_eq!(restored.timestamp_micros(), now.timestamp_micros());

        let before_epoch = from_micros(-1).unwrap();
        assert_eq!(before_epoch.timestamp_micros(), -1);
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let store = memory_store().await;
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_workflow_lifecycle() {
        let store = memory_store().await;
        let workflow_id = store
            .create_workflow("w", json!({"x": 5}))
            .await
            .unwrap();

        let pending = store.get_workflow(workflow_id).await.unwrap();
        assert_eq!(pending.status, WorkflowStatus::Pending);
        assert_eq!(pending.input, json!({"x": 5}));

        let claimed = store.mark_processing(workflow_id).await.unwrap();
        assert_eq!(claimed.status, WorkflowStatus::Processing);
        assert!(claimed.updated_at >= pending.updated_at);

        assert!(store
            .mark_processing(workflow_id)
            .await
            .unwrap_err()
            .is_invalid_transition());

        store.complete_workflow(workflow_id, json!(10)).await.unwrap();
        let done = store.get_workflow(workflow_id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Done);
        assert_eq!(done.output, Some(json!(10)));
        assert!(done.error_message.is_none());
        assert!(done.current_activity.is_none());
    }

    #[tokio::test]
    async fn test_transition_errors_are_classified() {
        let store = memory_store().await;
        let missing = Uuid::now_v7();
        assert!(matches!(
            store.fail_workflow(missing, "x").await,
            Err(StoreError::NotFound(id)) if id == missing
        ));

        let workflow_id = store.create_workflow("w", json!({})).await.unwrap();
        assert!(matches!(
            store.set_current_activity(workflow_id, Some("a")).await,
            Err(StoreError::InvalidTransition {
                from: WorkflowStatus::Pending,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_activity_records() {
        let store = memory_store().await;
        let workflow_id = store.create_workflow("w", json!({})).await.unwrap();
        store.mark_processing(workflow_id).await.unwrap();

        let first = store
            .record_activity_start(workflow_id, "a", json!({"n": 1}))
            .await
            .unwrap();
        store
            .record_activity_end(first, ActivityOutcome::Completed(json!({"ok": true})))
            .await
            .unwrap();
        let second = store
            .record_activity_start(workflow_id, "b", json!(null))
            .await
            .unwrap();
        store
            .record_activity_end(second, ActivityOutcome::Failed("boom".to_string()))
            .await
            .unwrap();

        let executions = store.list_activity_executions(workflow_id).await.unwrap();
        assert_eq!(executions.len(), 2);
        assert_eq!(executions[0].activity_name, "a");
        assert_eq!(executions[0].output, Some(json!({"ok": true})));
        assert_eq!(executions[1].error.as_deref(), Some("boom"));
        assert!(executions[0].finished_at.unwrap() <= executions[1].started_at);

        assert!(matches!(
            store
                .record_activity_end(first, ActivityOutcome::Completed(json!(1)))
                .await,
            Err(StoreError::ActivityAlreadyFinished(_))
        ));
        assert!(matches!(
            store
                .record_activity_end(Uuid::now_v7(), ActivityOutcome::Completed(json!(1)))
                .await,
            Err(StoreError::ActivityExecutionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_to_pending() {
        let store = memory_store().await;
        let workflow_id = store.create_workflow("w", json!({})).await.unwrap();
        store.mark_processing(workflow_id).await.unwrap();
        store
            .record_activity_start(workflow_id, "slow", json!({}))
            .await
            .unwrap();
        store
            .set_current_activity(workflow_id, Some("slow"))
            .await
            .unwrap();

        store.reset_to_pending(workflow_id).await.unwrap();

        let workflow = store.get_workflow(workflow_id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Pending);
        assert!(workflow.current_activity.is_none());

        let executions = store.list_activity_executions(workflow_id).await.unwrap();
        assert_eq!(executions[0].error.as_deref(), Some(INTERRUPTED_BY_RESTART));
        assert!(executions[0].is_finished());
    }

    #[tokio::test]
    async fn test_list_workflows_filters() {
        let store = memory_store().await;
        let a = store.create_workflow("alpha", json!({})).await.unwrap();
        let b = store.create_workflow("beta", json!({})).await.unwrap();
        store.mark_processing(b).await.unwrap();

        let all = store.list_workflows(WorkflowFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|w| w.id).collect::<Vec<_>>(), vec![a, b]);

        let betas = store
            .list_workflows(WorkflowFilter::by_name("beta"))
            .await
            .unwrap();
        assert_eq!(betas.len(), 1);
        assert_eq!(betas[0].id, b);

        let pending = store
            .list_workflows(WorkflowFilter::default().with_status(WorkflowStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a);

        assert_eq!(store.list_incomplete().await.unwrap().len(), 2);
    }
}
