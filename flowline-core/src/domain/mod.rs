//! Core domain types
//!
//! This module contains the core domain structures used across Flowline crates.
//! These types represent the fundamental entities and are shared between
//! the scheduler (for persistence and decisions) and the CLI (for display).

pub mod pipeline;
pub mod run;
pub mod task;
