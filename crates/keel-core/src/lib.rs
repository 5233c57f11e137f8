//! # keel-core
//!
//! Core types, traits, and abstractions for keel.
//!
//! This crate provides the job, worker, dead-letter, vector and rate-limit
//! models, the repository traits `keel-db` implements, the retry policy and
//! index tuning logic, and the in-process notification dispatcher.

pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod retry;
pub mod traits;
pub mod tuning;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{
    handler_fn, Dispatcher, Event, EventHandler, EventKind, JobAvailable, JobCompleted,
    JobFailed, SubscriptionId, WorkerStateChanged,
};
pub use models::*;
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use traits::*;
pub use tuning::{RecallTarget, TuningConfig};
pub use uuid_utils::new_v7;
