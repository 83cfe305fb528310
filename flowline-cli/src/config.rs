//! Configuration module
//!
//! Connection settings shared by every command.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flowline_executor::ExecutorClient;
use flowline_scheduler::config::SchedulerPolicy;
use flowline_scheduler::context::{SchedulerContext, Trigger};
use flowline_scheduler::db;
use flowline_scheduler::dispatch::{HttpDispatcher, TimeoutDispatcher};
use flowline_scheduler::repository::PgRunRepository;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string
    pub database_url: String,
    /// URL of the executor service
    pub executor_url: String,
}

impl Config {
    /// Connect to the scheduler store and the executor.
    ///
    /// The context has no trigger: runs created here are picked up by the
    /// scheduler service on its next sweep.
    pub async fn connect(&self) -> Result<SchedulerContext> {
        let pool = db::create_pool(&self.database_url)
            .await
            .context("Failed to connect to the scheduler database")?;
        db::run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;

        let policy = SchedulerPolicy::default();
        let client = ExecutorClient::with_timeout(self.executor_url.clone(), Duration::from_secs(10))
            .context("Failed to build executor client")?;
        let dispatcher = TimeoutDispatcher::new(
            HttpDispatcher::new(client),
            policy.submit_timeout,
            policy.cancel_timeout,
        );

        Ok(SchedulerContext::new(
            Arc::new(PgRunRepository::new(pool)),
            Arc::new(dispatcher),
            policy,
            Trigger::disconnected(),
        ))
    }
}
