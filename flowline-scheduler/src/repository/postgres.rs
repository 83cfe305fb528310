//! Postgres repository
//!
//! Snapshots run in a `REPEATABLE READ` transaction. Compare-and-set locks the
//! single task row (`SELECT ... FOR UPDATE`), checks the expected state and
//! attempt, and writes within the same transaction. No executor call is ever
//! made while a transaction is open.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_core::dag::PipelineDag;
use flowline_core::domain::pipeline::ResourceRequest;
use flowline_core::domain::run::{ClusterSelection, Run, RunState};
use flowline_core::domain::task::{Task, TaskError, TaskKey, TaskState};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{
    CasOutcome, Expected, NewRun, RepositoryError, Result, RunRepository, RunSnapshot,
    TaskUpdate, apply_transition, initial_tasks, sanitize_progress,
};

#[derive(Clone)]
pub struct PgRunRepository {
    pool: PgPool,
}

impl PgRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn run_exists(&self, run_id: Uuid) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM runs WHERE id = $1)")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn not_found_unless_exists(&self, run_id: Uuid) -> Result<bool> {
        if self.run_exists(run_id).await? {
            Ok(false)
        } else {
            Err(RepositoryError::NotFound(format!("run {run_id}")))
        }
    }
}

#[async_trait]
impl RunRepository for PgRunRepository {
    async fn create_run(&self, new_run: NewRun) -> Result<Run> {
        let mut tx = self.pool.begin().await?;

        let active: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM runs
                WHERE project_id = $1 AND state NOT IN ('SUCCESS', 'FAILED', 'ABORTED')
            )
            "#,
        )
        .bind(new_run.project_id)
        .fetch_one(&mut *tx)
        .await?;
        if active {
            return Err(RepositoryError::AlreadyActive {
                project_id: new_run.project_id,
            });
        }

        let iteration: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(iteration), 0) + 1 FROM runs WHERE project_id = $1",
        )
        .bind(new_run.project_id)
        .fetch_one(&mut *tx)
        .await?;

        let now = Utc::now();
        let run = Run {
            id: Uuid::new_v4(),
            project_id: new_run.project_id,
            user_id: new_run.user_id,
            iteration,
            state: RunState::Published,
            cancel_requested: false,
            cluster_selection: new_run.cluster_selection,
            dag: new_run.dag,
            created_at: now,
            modified_at: now,
            ended_at: None,
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO runs (id, project_id, user_id, iteration, state, cancel_requested,
                              cluster_selection, dag, created_at, modified_at)
            VALUES ($1, $2, $3, $4, $5, FALSE, $6, $7, $8, $8)
            "#,
        )
        .bind(run.id)
        .bind(run.project_id)
        .bind(run.user_id)
        .bind(run.iteration)
        .bind(run.state.as_str())
        .bind(run.cluster_selection.as_str())
        .bind(Json(&run.dag))
        .bind(now)
        .execute(&mut *tx)
        .await;

        // Lost a race with another start of the same project
        if let Err(sqlx::Error::Database(db)) = &inserted {
            if db.is_unique_violation() {
                return Err(RepositoryError::AlreadyActive {
                    project_id: run.project_id,
                });
            }
        }
        inserted?;

        for task in initial_tasks(&run, now) {
            insert_task(&mut tx, &task).await?;
        }

        tx.commit().await?;
        tracing::debug!(run_id = %run.id, iteration = run.iteration, "Run created");
        Ok(run)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, project_id, user_id, iteration, state, cancel_requested,
                   cluster_selection, dag, created_at, modified_at, ended_at
            FROM runs
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Run::try_from).transpose()
    }

    async fn latest_run(&self, project_id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, project_id, user_id, iteration, state, cancel_requested,
                   cluster_selection, dag, created_at, modified_at, ended_at
            FROM runs
            WHERE project_id = $1
            ORDER BY iteration DESC
            LIMIT 1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Run::try_from).transpose()
    }

    async fn list_active_runs(&self) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, project_id, user_id, iteration, state, cancel_requested,
                   cluster_selection, dag, created_at, modified_at, ended_at
            FROM runs
            WHERE state NOT IN ('SUCCESS', 'FAILED', 'ABORTED')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Run::try_from).collect()
    }

    async fn list_tasks(&self, run_id: Uuid) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT run_id, node_id, state, attempt_count, run_hash, progress, resources,
                   job_id, outputs, error, started_at, ended_at, last_heartbeat_at,
                   cluster_wait_since, modified_at
            FROM tasks
            WHERE run_id = $1
            ORDER BY node_id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Task::try_from).collect()
    }

    async fn get_task(&self, key: &TaskKey) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT run_id, node_id, state, attempt_count, run_hash, progress, resources,
                   job_id, outputs, error, started_at, ended_at, last_heartbeat_at,
                   cluster_wait_since, modified_at
            FROM tasks
            WHERE run_id = $1 AND node_id = $2
            "#,
        )
        .bind(key.run_id)
        .bind(&key.node_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Task::try_from).transpose()
    }

    async fn snapshot(&self, run_id: Uuid) -> Result<Option<RunSnapshot>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let run_row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, project_id, user_id, iteration, state, cancel_requested,
                   cluster_selection, dag, created_at, modified_at, ended_at
            FROM runs
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(run_row) = run_row else {
            tx.commit().await?;
            return Ok(None);
        };

        let task_rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT run_id, node_id, state, attempt_count, run_hash, progress, resources,
                   job_id, outputs, error, started_at, ended_at, last_heartbeat_at,
                   cluster_wait_since, modified_at
            FROM tasks
            WHERE run_id = $1
            ORDER BY node_id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Some(RunSnapshot {
            run: Run::try_from(run_row)?,
            tasks: task_rows
                .into_iter()
                .map(Task::try_from)
                .collect::<Result<_>>()?,
        }))
    }

    async fn compare_and_set_task_state(
        &self,
        key: &TaskKey,
        expected: Expected,
        next: TaskState,
        update: TaskUpdate,
    ) -> Result<CasOutcome> {
        expected.state.check_transition(next)?;

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT run_id, node_id, state, attempt_count, run_hash, progress, resources,
                   job_id, outputs, error, started_at, ended_at, last_heartbeat_at,
                   cluster_wait_since, modified_at
            FROM tasks
            WHERE run_id = $1 AND node_id = $2
            FOR UPDATE
            "#,
        )
        .bind(key.run_id)
        .bind(&key.node_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RepositoryError::NotFound(format!("task {key}")))?;

        let mut task = Task::try_from(row)?;
        if task.state != expected.state || task.attempt_count != expected.attempt {
            tx.rollback().await?;
            return Ok(CasOutcome::Conflict);
        }

        apply_transition(&mut task, next, update, Utc::now());
        sqlx::query(
            r#"
            UPDATE tasks
            SET state = $3, attempt_count = $4, progress = $5, job_id = $6, outputs = $7,
                error = $8, started_at = $9, ended_at = $10, last_heartbeat_at = $11,
                cluster_wait_since = $12, modified_at = $13
            WHERE run_id = $1 AND node_id = $2
            "#,
        )
        .bind(task.run_id)
        .bind(&task.node_id)
        .bind(task.state.as_str())
        .bind(to_db_attempt(task.attempt_count))
        .bind(task.progress)
        .bind(&task.job_id)
        .bind(task.outputs.as_ref().map(Json))
        .bind(task.error.as_ref().map(Json))
        .bind(task.started_at)
        .bind(task.ended_at)
        .bind(task.last_heartbeat_at)
        .bind(task.cluster_wait_since)
        .bind(task.modified_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(CasOutcome::Applied(task))
    }

    async fn upsert_task_progress(
        &self,
        key: &TaskKey,
        attempt: u32,
        progress: Option<f64>,
        heartbeat_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET progress = CASE WHEN $4::float8 IS NULL THEN progress ELSE $4 END,
                last_heartbeat_at = $5,
                modified_at = NOW()
            WHERE run_id = $1 AND node_id = $2 AND attempt_count = $3
              AND state NOT IN ('SUCCESS', 'FAILED', 'ABORTED')
            "#,
        )
        .bind(key.run_id)
        .bind(&key.node_id)
        .bind(to_db_attempt(attempt))
        .bind(sanitize_progress(progress))
        .bind(heartbeat_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_job_id(
        &self,
        key: &TaskKey,
        attempt: u32,
        job_id: &str,
    ) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE tasks
            SET job_id = $4, modified_at = NOW()
            WHERE run_id = $1 AND node_id = $2 AND attempt_count = $3
            RETURNING run_id, node_id, state, attempt_count, run_hash, progress, resources,
                      job_id, outputs, error, started_at, ended_at, last_heartbeat_at,
                      cluster_wait_since, modified_at
            "#,
        )
        .bind(key.run_id)
        .bind(&key.node_id)
        .bind(to_db_attempt(attempt))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Task::try_from).transpose()
    }

    async fn find_reusable_outputs(
        &self,
        run_hash: &str,
        exclude_run: Uuid,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let outputs: Option<Json<BTreeMap<String, String>>> = sqlx::query_scalar(
            r#"
            SELECT outputs
            FROM tasks
            WHERE run_hash = $1 AND state = 'SUCCESS' AND run_id <> $2 AND outputs IS NOT NULL
            ORDER BY modified_at DESC
            LIMIT 1
            "#,
        )
        .bind(run_hash)
        .bind(exclude_run)
        .fetch_optional(&self.pool)
        .await?;

        Ok(outputs.map(|Json(outputs)| outputs))
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET cancel_requested = TRUE, modified_at = NOW()
            WHERE id = $1 AND NOT cancel_requested
              AND state NOT IN ('SUCCESS', 'FAILED', 'ABORTED')
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.not_found_unless_exists(run_id).await
    }

    async fn set_run_state(&self, run_id: Uuid, state: RunState) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET state = $2,
                modified_at = NOW(),
                ended_at = CASE WHEN $3 THEN NOW() ELSE ended_at END
            WHERE id = $1 AND state <> $2
              AND state NOT IN ('SUCCESS', 'FAILED', 'ABORTED')
            "#,
        )
        .bind(run_id)
        .bind(state.as_str())
        .bind(state.is_terminal())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        self.not_found_unless_exists(run_id).await
    }
}

async fn insert_task(tx: &mut Transaction<'_, Postgres>, task: &Task) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tasks (run_id, node_id, state, attempt_count, run_hash, progress,
                           resources, modified_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(task.run_id)
    .bind(&task.node_id)
    .bind(task.state.as_str())
    .bind(to_db_attempt(task.attempt_count))
    .bind(&task.run_hash)
    .bind(task.progress)
    .bind(Json(&task.resources))
    .bind(task.modified_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn to_db_attempt(attempt: u32) -> i32 {
    i32::try_from(attempt).unwrap_or(i32::MAX)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    project_id: Uuid,
    user_id: i64,
    iteration: i32,
    state: String,
    cancel_requested: bool,
    cluster_selection: String,
    dag: Json<PipelineDag>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for Run {
    type Error = RepositoryError;

    fn try_from(row: RunRow) -> Result<Self> {
        let state = RunState::parse(&row.state)
            .ok_or_else(|| RepositoryError::Corrupt(format!("run state '{}'", row.state)))?;
        let cluster_selection = ClusterSelection::parse(&row.cluster_selection).ok_or_else(|| {
            RepositoryError::Corrupt(format!("cluster selection '{}'", row.cluster_selection))
        })?;

        Ok(Run {
            id: row.id,
            project_id: row.project_id,
            user_id: row.user_id,
            iteration: row.iteration,
            state,
            cancel_requested: row.cancel_requested,
            cluster_selection,
            dag: row.dag.0,
            created_at: row.created_at,
            modified_at: row.modified_at,
            ended_at: row.ended_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    run_id: Uuid,
    node_id: String,
    state: String,
    attempt_count: i32,
    run_hash: String,
    progress: f64,
    resources: Json<ResourceRequest>,
    job_id: Option<String>,
    outputs: Option<Json<BTreeMap<String, String>>>,
    error: Option<Json<TaskError>>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    cluster_wait_since: Option<DateTime<Utc>>,
    modified_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = RepositoryError;

    fn try_from(row: TaskRow) -> Result<Self> {
        let state = row.state.parse::<TaskState>().map_err(RepositoryError::Corrupt)?;
        let attempt_count = u32::try_from(row.attempt_count)
            .map_err(|_| RepositoryError::Corrupt(format!("attempt {}", row.attempt_count)))?;

        Ok(Task {
            run_id: row.run_id,
            node_id: row.node_id,
            state,
            attempt_count,
            run_hash: row.run_hash,
            progress: row.progress,
            resources: row.resources.0,
            job_id: row.job_id,
            outputs: row.outputs.map(|o| o.0),
            error: row.error.map(|e| e.0),
            started_at: row.started_at,
            ended_at: row.ended_at,
            last_heartbeat_at: row.last_heartbeat_at,
            cluster_wait_since: row.cluster_wait_since,
            modified_at: row.modified_at,
        })
    }
}
