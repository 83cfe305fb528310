//! Postgres repository against a live database
//!
//! Runs only when `DATABASE_URL` points at a scratch database; otherwise
//! every test returns early.

mod common;

use std::collections::BTreeMap;

use chrono::Utc;
use common::{graph, node};
use flowline_core::dag::{PipelineDag, Selection};
use flowline_core::domain::pipeline::NodeSpec;
use flowline_core::domain::run::{ClusterSelection, RunState};
use flowline_core::domain::task::{TaskKey, TaskState};
use flowline_scheduler::db;
use flowline_scheduler::repository::{
    CasOutcome, Expected, NewRun, PgRunRepository, RepositoryError, RunRepository, TaskUpdate,
};
use tokio::sync::OnceCell;
use uuid::Uuid;

static MIGRATED: OnceCell<()> = OnceCell::const_new();

async fn repository() -> Option<PgRunRepository> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };
    let pool = db::create_pool(&url).await.unwrap();
    MIGRATED
        .get_or_init(|| async { db::run_migrations(&pool).await.unwrap() })
        .await;
    Some(PgRunRepository::new(pool))
}

/// Node with a unique hash so runs of other tests are never reusable
fn unique(id: &str, deps: &[&str]) -> NodeSpec {
    NodeSpec {
        params: serde_json::json!({ "step": id, "nonce": Uuid::new_v4() }),
        ..node(id, deps)
    }
}

fn new_run(project_id: Uuid) -> NewRun {
    let mut g = graph(vec![unique("a", &[]), unique("b", &["a"])]);
    g.project_id = project_id;
    NewRun {
        project_id,
        user_id: 3,
        cluster_selection: ClusterSelection::Static,
        dag: PipelineDag::build(&g, &Selection::all()).unwrap(),
    }
}

async fn step(repo: &PgRunRepository, key: &TaskKey, from: TaskState, to: TaskState) {
    let expected = Expected {
        state: from,
        attempt: 1,
    };
    let outcome = repo
        .compare_and_set_task_state(key, expected, to, TaskUpdate::none())
        .await
        .unwrap();
    assert!(outcome.is_applied(), "{from} -> {to}");
}

#[tokio::test]
async fn test_create_run_and_snapshot() {
    let Some(repo) = repository().await else {
        return;
    };
    let project = Uuid::new_v4();
    let run = repo.create_run(new_run(project)).await.unwrap();
    assert_eq!(run.iteration, 1);

    let snapshot = repo.snapshot(run.id).await.unwrap().unwrap();
    assert_eq!(snapshot.run.id, run.id);
    assert_eq!(snapshot.tasks.len(), 2);
    assert!(snapshot.tasks.iter().all(|t| t.state == TaskState::Published));

    let err = repo.create_run(new_run(project)).await.unwrap_err();
    assert!(matches!(err, RepositoryError::AlreadyActive { .. }));

    assert!(repo.set_run_state(run.id, RunState::Aborted).await.unwrap());
    let second = repo.create_run(new_run(project)).await.unwrap();
    assert_eq!(second.iteration, 2);
    assert_eq!(repo.latest_run(project).await.unwrap().unwrap().id, second.id);
}

#[tokio::test]
async fn test_compare_and_set_conflicts() {
    let Some(repo) = repository().await else {
        return;
    };
    let run = repo.create_run(new_run(Uuid::new_v4())).await.unwrap();
    let key = TaskKey::new(run.id, "a");

    step(&repo, &key, TaskState::Published, TaskState::Pending).await;
    let stale = Expected {
        state: TaskState::Published,
        attempt: 1,
    };
    let outcome = repo
        .compare_and_set_task_state(&key, stale, TaskState::Pending, TaskUpdate::none())
        .await
        .unwrap();
    assert_eq!(outcome, CasOutcome::Conflict);
}

#[tokio::test]
async fn test_heartbeat_keeps_progress() {
    let Some(repo) = repository().await else {
        return;
    };
    let run = repo.create_run(new_run(Uuid::new_v4())).await.unwrap();
    let key = TaskKey::new(run.id, "a");
    step(&repo, &key, TaskState::Published, TaskState::Pending).await;
    step(&repo, &key, TaskState::Pending, TaskState::Started).await;

    assert!(repo.upsert_task_progress(&key, 1, Some(0.5), Utc::now()).await.unwrap());
    assert!(repo.upsert_task_progress(&key, 1, None, Utc::now()).await.unwrap());
    assert!(repo.upsert_task_progress(&key, 1, Some(f64::NAN), Utc::now()).await.unwrap());
    assert_eq!(repo.get_task(&key).await.unwrap().unwrap().progress, 0.5);

    repo.upsert_task_progress(&key, 1, Some(3.0), Utc::now()).await.unwrap();
    assert_eq!(repo.get_task(&key).await.unwrap().unwrap().progress, 1.0);

    assert!(!repo.upsert_task_progress(&key, 2, Some(0.1), Utc::now()).await.unwrap());
}

#[tokio::test]
async fn test_successful_outputs_are_reusable_by_later_runs() {
    let Some(repo) = repository().await else {
        return;
    };
    let run = repo.create_run(new_run(Uuid::new_v4())).await.unwrap();
    let key = TaskKey::new(run.id, "a");
    step(&repo, &key, TaskState::Published, TaskState::Pending).await;
    let recorded = repo.record_job_id(&key, 1, "job-a-1").await.unwrap().unwrap();
    assert_eq!(recorded.job_id.as_deref(), Some("job-a-1"));

    let outputs = BTreeMap::from([("out".to_string(), "s3://bucket/a/out".to_string())]);
    let expected = Expected {
        state: TaskState::Pending,
        attempt: 1,
    };
    let update = TaskUpdate::outputs(outputs.clone());
    repo.compare_and_set_task_state(&key, expected, TaskState::Success, update)
        .await
        .unwrap();

    let hash = recorded.run_hash;
    assert_eq!(repo.find_reusable_outputs(&hash, run.id).await.unwrap(), None);
    assert_eq!(
        repo.find_reusable_outputs(&hash, Uuid::new_v4()).await.unwrap(),
        Some(outputs)
    );
}
