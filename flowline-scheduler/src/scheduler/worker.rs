//! Scheduler background worker
//!
//! Runs scheduler passes when a run is triggered and, on every sweep tick,
//! for all active runs. A run has at most one pass in flight here; triggers
//! arriving meanwhile are folded into one follow-up pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::pass::schedule_run;
use crate::context::SchedulerContext;
use crate::sweep::sweep;

pub struct SchedulerWorker {
    ctx: SchedulerContext,
    triggers: mpsc::UnboundedReceiver<Uuid>,
    sweep_interval: Duration,
    semaphore: Arc<Semaphore>,
}

/// Bookkeeping of passes owned by the worker loop
#[derive(Default)]
struct Passes {
    running: JoinSet<Uuid>,
    in_flight: HashSet<Uuid>,
    requested_again: HashSet<Uuid>,
}

impl SchedulerWorker {
    pub fn new(
        ctx: SchedulerContext,
        triggers: mpsc::UnboundedReceiver<Uuid>,
        sweep_interval: Duration,
        max_concurrent_passes: usize,
    ) -> Self {
        Self {
            ctx,
            triggers,
            sweep_interval,
            semaphore: Arc::new(Semaphore::new(max_concurrent_passes)),
        }
    }

    /// Run the worker until shutdown is signaled, then wait for passes in flight.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sweep_interval_secs = self.sweep_interval.as_secs(),
            max_concurrent_passes = self.semaphore.available_permits(),
            "Starting scheduler worker"
        );

        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut passes = Passes::default();

        loop {
            tokio::select! {
                Some(run_id) = self.triggers.recv() => {
                    self.request(&mut passes, run_id).await;
                }
                _ = interval.tick() => {
                    self.sweep_and_schedule(&mut passes).await;
                }
                Some(joined) = passes.running.join_next(), if !passes.running.is_empty() => {
                    match joined {
                        Ok(run_id) => {
                            passes.in_flight.remove(&run_id);
                            if passes.requested_again.remove(&run_id) {
                                self.request(&mut passes, run_id).await;
                            }
                        }
                        Err(e) => warn!("Scheduler pass panicked: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scheduler worker shutting down");
                        break;
                    }
                }
            }
        }

        while passes.running.join_next().await.is_some() {}
    }

    /// Start a pass for `run_id`, or fold the request into the one in flight.
    async fn request(&self, passes: &mut Passes, run_id: Uuid) {
        if passes.in_flight.contains(&run_id) {
            passes.requested_again.insert(run_id);
            return;
        }

        let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
            return;
        };
        passes.in_flight.insert(run_id);

        let ctx = self.ctx.clone();
        passes.running.spawn(async move {
            if let Err(e) = schedule_run(&ctx, run_id).await {
                error!(run_id = %run_id, error = %e, "Scheduler pass failed");
            }
            drop(permit);
            run_id
        });
    }

    async fn sweep_and_schedule(&self, passes: &mut Passes) {
        if let Err(e) = sweep(&self.ctx).await {
            error!(error = %e, "Sweep failed");
        }

        match self.ctx.repository.list_active_runs().await {
            Ok(runs) => {
                debug!(active_runs = runs.len(), "Scheduling active runs");
                for run in runs {
                    self.request(passes, run.id).await;
                }
            }
            Err(e) => error!(error = %e, "Failed to list active runs"),
        }
    }
}
