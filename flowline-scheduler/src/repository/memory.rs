//! In-process repository
//!
//! Keeps runs and tasks behind a single mutex. Every operation takes the lock
//! once, so snapshots and compare-and-set are atomic just like their Postgres
//! counterparts. Used by tests and local single-process deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_core::domain::run::{Run, RunState};
use flowline_core::domain::task::{Task, TaskKey, TaskState};
use uuid::Uuid;

use super::{
    CasOutcome, Expected, NewRun, RepositoryError, Result, RunRepository, RunSnapshot,
    TaskUpdate, apply_transition, initial_tasks, sanitize_progress,
};

#[derive(Default)]
struct Store {
    runs: HashMap<Uuid, Run>,
    tasks: BTreeMap<TaskKey, Task>,
}

impl Store {
    fn tasks_of(&self, run_id: Uuid) -> Vec<Task> {
        self.tasks
            .values()
            .filter(|t| t.run_id == run_id)
            .cloned()
            .collect()
    }
}

#[derive(Default)]
pub struct InMemoryRunRepository {
    store: Mutex<Store>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn create_run(&self, new_run: NewRun) -> Result<Run> {
        let mut store = self.store();
        let mut iteration = 1;
        for run in store.runs.values() {
            if run.project_id != new_run.project_id {
                continue;
            }
            if !run.state.is_terminal() {
                return Err(RepositoryError::AlreadyActive {
                    project_id: new_run.project_id,
                });
            }
            iteration = iteration.max(run.iteration + 1);
        }

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

        for task in initial_tasks(&run, now) {
            store.tasks.insert(task.key(), task);
        }
        store.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        Ok(self.store().runs.get(&run_id).cloned())
    }

    async fn latest_run(&self, project_id: Uuid) -> Result<Option<Run>> {
        Ok(self
            .store()
            .runs
            .values()
            .filter(|r| r.project_id == project_id)
            .max_by_key(|r| r.iteration)
            .cloned())
    }

    async fn list_active_runs(&self) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .store()
            .runs
            .values()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn list_tasks(&self, run_id: Uuid) -> Result<Vec<Task>> {
        Ok(self.store().tasks_of(run_id))
    }

    async fn get_task(&self, key: &TaskKey) -> Result<Option<Task>> {
        Ok(self.store().tasks.get(key).cloned())
    }

    async fn snapshot(&self, run_id: Uuid) -> Result<Option<RunSnapshot>> {
        let store = self.store();
        Ok(store.runs.get(&run_id).map(|run| RunSnapshot {
            run: run.clone(),
            tasks: store.tasks_of(run_id),
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

        let mut store = self.store();
        let task = store
            .tasks
            .get_mut(key)
            .ok_or_else(|| RepositoryError::NotFound(format!("task {key}")))?;

        if task.state != expected.state || task.attempt_count != expected.attempt {
            return Ok(CasOutcome::Conflict);
        }
        apply_transition(task, next, update, Utc::now());
        Ok(CasOutcome::Applied(task.clone()))
    }

    async fn upsert_task_progress(
        &self,
        key: &TaskKey,
        attempt: u32,
        progress: Option<f64>,
        heartbeat_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut store = self.store();
        let Some(task) = store.tasks.get_mut(key) else {
            return Ok(false);
        };
        if task.state.is_terminal() || task.attempt_count != attempt {
            return Ok(false);
        }
        if let Some(progress) = sanitize_progress(progress) {
            task.progress = progress;
        }
        task.last_heartbeat_at = Some(heartbeat_at);
        task.modified_at = Utc::now();
        Ok(true)
    }

    async fn record_job_id(
        &self,
        key: &TaskKey,
        attempt: u32,
        job_id: &str,
    ) -> Result<Option<Task>> {
        let mut store = self.store();
        let Some(task) = store.tasks.get_mut(key) else {
            return Ok(None);
        };
        if task.attempt_count != attempt {
            return Ok(None);
        }
        task.job_id = Some(job_id.to_string());
        task.modified_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn find_reusable_outputs(
        &self,
        run_hash: &str,
        exclude_run: Uuid,
    ) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self
            .store()
            .tasks
            .values()
            .filter(|t| {
                t.run_id != exclude_run && t.state == TaskState::Success && t.run_hash == run_hash
            })
            .max_by_key(|t| t.modified_at)
            .and_then(|t| t.outputs.clone()))
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<bool> {
        let mut store = self.store();
        let run = store
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("run {run_id}")))?;
        if run.cancel_requested || run.state.is_terminal() {
            return Ok(false);
        }
        run.cancel_requested = true;
        run.modified_at = Utc::now();
        Ok(true)
    }

    async fn set_run_state(&self, run_id: Uuid, state: RunState) -> Result<bool> {
        let mut store = self.store();
        let run = store
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("run {run_id}")))?;
        if run.state.is_terminal() || run.state == state {
            return Ok(false);
        }
        let now = Utc::now();
        run.state = state;
        run.modified_at = now;
        if state.is_terminal() {
            run.ended_at = Some(now);
        }
        Ok(true)
    }
}
