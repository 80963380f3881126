//! # Batch orchestrator common library
//!
//! Shared code for the orchestrator server and its clients:
//! - Error types
//! - Batch status and progress counters
//! - Wire protocol messages and the store mutation EventBus
//! - Bootstrap configuration loading

pub mod batch;
pub mod config;
pub mod error;
pub mod events;

pub use batch::{BatchStatus, ProgressCounts};
pub use error::{Error, Result};
