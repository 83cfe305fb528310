//! Flowline Core
//!
//! Core types and abstractions for the Flowline pipeline scheduler.
//!
//! This crate contains:
//! - Domain types: Run, Task and their state machines, the project graph
//! - DAG: building an acyclic pipeline snapshot from a project graph
//! - DTOs: Data transfer objects exchanged with the executor and callers

pub mod dag;
pub mod domain;
pub mod dto;
pub mod hash;
