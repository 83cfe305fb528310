use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create runs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id UUID PRIMARY KEY,
            project_id UUID NOT NULL,
            user_id BIGINT NOT NULL,
            iteration INTEGER NOT NULL,
            state VARCHAR(50) NOT NULL,
            cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
            cluster_selection VARCHAR(20) NOT NULL,
            dag JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            modified_at TIMESTAMPTZ NOT NULL,
            ended_at TIMESTAMPTZ,
            UNIQUE (project_id, iteration)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one unfinished run per project
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_active_per_project
        ON runs(project_id)
        WHERE state NOT IN ('SUCCESS', 'FAILED', 'ABORTED')
        "#,
    )
    .execute(pool)
    .await?;

    // Create tasks table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            run_id UUID NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            node_id VARCHAR(255) NOT NULL,
            state VARCHAR(50) NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 1,
            run_hash VARCHAR(80) NOT NULL,
            progress DOUBLE PRECISION NOT NULL DEFAULT 0,
            resources JSONB NOT NULL,
            job_id VARCHAR(255),
            outputs JSONB,
            error JSONB,
            started_at TIMESTAMPTZ,
            ended_at TIMESTAMPTZ,
            last_heartbeat_at TIMESTAMPTZ,
            cluster_wait_since TIMESTAMPTZ,
            modified_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (run_id, node_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for better query performance
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_state ON runs(state)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_reusable ON tasks(run_hash) WHERE state = 'SUCCESS'",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_job_id ON tasks(job_id)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
