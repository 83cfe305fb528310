//! Flowline Scheduler
//!
//! Executes pipeline DAGs on an external executor:
//! - Repository: durable runs and tasks with compare-and-set transitions
//! - Dispatch: job submission with bounded timeouts
//! - Scheduler: per-run passes that claim ready tasks and dispatch them
//! - Reconciler: applies executor events back onto task state
//! - Sweep: recovers lost heartbeats and cluster wait timeouts
//! - Cancellation: stop requests and failure cascades
//! - Service: the start/stop/status entry points

pub mod cancellation;
pub mod config;
pub mod context;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod graph_source;
pub mod reconciler;
pub mod repository;
pub mod scheduler;
pub mod service;
pub mod sweep;
