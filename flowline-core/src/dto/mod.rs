//! Data Transfer Objects
//!
//! This module contains DTOs exchanged between the scheduler and the external
//! executor, and between the scheduler and its callers. DTOs are lightweight
//! representations of domain entities optimized for network transfer.

pub mod computation;
pub mod executor;
