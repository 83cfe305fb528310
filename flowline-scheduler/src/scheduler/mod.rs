//! Scheduler Loop
//!
//! [`schedule_run`] is one pass over one run. Passes are stateless and may run
//! concurrently, for different runs or for the same one: every decision is
//! taken against a single snapshot and written with compare-and-set.
//! [`SchedulerWorker`] decides when passes happen.

mod pass;
mod worker;

pub use pass::{PassReport, ready_tasks, schedule_run, settle_run_state};
pub use worker::SchedulerWorker;
