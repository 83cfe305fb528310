//! Flowline scheduler service
//!
//! Wires the Postgres repository, the executor client, the scheduler worker
//! and the reconciler worker, then runs until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowline_executor::ExecutorClient;
use flowline_scheduler::config::SchedulerConfig;
use flowline_scheduler::context::{SchedulerContext, Trigger};
use flowline_scheduler::db;
use flowline_scheduler::dispatch::{HttpDispatcher, TimeoutDispatcher};
use flowline_scheduler::reconciler::{PollingSource, Reconciler, ReconcilerWorker};
use flowline_scheduler::repository::PgRunRepository;
use flowline_scheduler::scheduler::SchedulerWorker;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowline_scheduler=info,flowline_executor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Flowline scheduler");

    let config = SchedulerConfig::from_env()?;
    config.validate()?;
    info!(
        "Loaded configuration: executor_url={}, sweep_interval={:?}",
        config.executor_url, config.sweep_interval
    );

    let pool = connect_with_retry(&config.database_url).await?;
    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let client = ExecutorClient::with_timeout(
        config.executor_url.clone(),
        config.policy.submit_timeout,
    )
    .context("Failed to build executor client")?;
    let dispatcher = TimeoutDispatcher::new(
        HttpDispatcher::new(client.clone()),
        config.policy.submit_timeout,
        config.policy.cancel_timeout,
    );

    let (trigger, triggers) = Trigger::channel();
    let ctx = SchedulerContext::new(
        Arc::new(PgRunRepository::new(pool)),
        Arc::new(dispatcher),
        config.policy.clone(),
        trigger,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = SchedulerWorker::new(
        ctx.clone(),
        triggers,
        config.sweep_interval,
        config.max_concurrent_passes,
    );
    let reconciler = ReconcilerWorker::new(
        Reconciler::new(ctx),
        Box::new(PollingSource::new(client, config.event_poll_interval)),
    );

    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx.clone()));
    let reconciler_handle = tokio::spawn(reconciler.run(shutdown_rx));

    info!("Scheduler initialized successfully");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    if shutdown_tx.send(true).is_err() {
        warn!("Workers already stopped");
    }
    let (scheduler_result, reconciler_result) = tokio::join!(scheduler_handle, reconciler_handle);
    for result in [scheduler_result, reconciler_result] {
        if let Err(e) = result {
            error!("Worker task panicked: {}", e);
        }
    }

    info!("Flowline scheduler stopped");
    Ok(())
}

/// Connect to Postgres with exponential backoff
///
/// The database may not be ready yet when the scheduler starts (common in
/// container environments).
async fn connect_with_retry(database_url: &str) -> Result<PgPool> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match db::create_pool(database_url).await {
            Ok(pool) => {
                info!("Database connection pool created after {} attempt(s)", attempt);
                return Ok(pool);
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    return Err(e).context(format!(
                        "Failed to connect to database after {} attempts",
                        MAX_RETRIES
                    ));
                }

                warn!(
                    "Failed to connect to database (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                // Exponential backoff with cap
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}
