//! Shared scheduler dependencies
//!
//! Built once at startup and handed to the scheduler loop, the reconciler, the
//! sweep and the cancellation handler. Nothing here is process-global.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::SchedulerPolicy;
use crate::dispatch::Dispatcher;
use crate::repository::RunRepository;

#[derive(Clone)]
pub struct SchedulerContext {
    pub repository: Arc<dyn RunRepository>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub policy: SchedulerPolicy,
    pub trigger: Trigger,
}

impl SchedulerContext {
    pub fn new(
        repository: Arc<dyn RunRepository>,
        dispatcher: Arc<dyn Dispatcher>,
        policy: SchedulerPolicy,
        trigger: Trigger,
    ) -> Self {
        Self {
            repository,
            dispatcher,
            policy,
            trigger,
        }
    }
}

/// Requests a scheduler pass for a run
///
/// Firing never blocks. When nothing listens (tests driving passes by hand,
/// or during shutdown) the request is dropped.
#[derive(Clone, Default)]
pub struct Trigger {
    tx: Option<mpsc::UnboundedSender<Uuid>>,
}

impl Trigger {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn fire(&self, run_id: Uuid) {
        if let Some(tx) = &self.tx {
            if tx.send(run_id).is_err() {
                tracing::debug!(run_id = %run_id, "Scheduler trigger dropped, receiver closed");
            }
        }
    }

    /// Fire once `delay` has elapsed
    pub fn fire_after(&self, run_id: Uuid, delay: Duration) {
        if delay.is_zero() {
            self.fire(run_id);
            return;
        }
        let Some(tx) = self.tx.clone() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(run_id);
        });
    }
}
