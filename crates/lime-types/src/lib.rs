//! Core types for the LIME agent mediator.
//!
//! This crate defines the data structures shared by the mediator core, the
//! mediator binary and agent implementations. It contains no networking logic.

pub mod agent;
pub mod config;
pub mod error;
pub mod session;
pub mod task;
