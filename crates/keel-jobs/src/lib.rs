//! # keel-jobs
//!
//! Background runtime for keel.
//!
//! This crate provides:
//! - Job workers with one registered identity and heartbeat per slot
//! - Wake-up on `job_available` notifications with a polling fallback
//! - Per-job timeouts, with panics and timeouts routed through the retry policy
//! - The heartbeat monitor that reclaims jobs of silent workers
//! - The maintenance scheduler (promotion, purges, auto-reindex)
//!
//! ## Example
//!
//! ```ignore
//! use keel_jobs::{NoOpHandler, WorkerBuilder, WorkerConfig};
//! use keel_db::{Database, Dispatcher};
//!
//! let db = Database::connect("postgres://...").await?;
//! let dispatcher = Dispatcher::default();
//! let listener = db.listen(dispatcher.clone()).await?;
//!
//! // Create worker with handlers
//! let worker = WorkerBuilder::from_database(&db)
//!     .with_config(WorkerConfig::default().with_pool("ingest"))
//!     .with_dispatcher(dispatcher)
//!     .with_handler(NoOpHandler::new("embed_document"))
//!     .build()
//!     .await;
//!
//! // Start worker and get handle
//! let handle = worker.start();
//!
//! // Listen for events
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! listener.shutdown().await?;
//! ```

pub mod handler;
pub mod maintenance;
pub mod monitor;
pub mod service;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export core types
pub use keel_core::*;

pub use handler::{JobContext, JobHandler, JobResult, NoOpHandler};
pub use maintenance::{MaintenanceConfig, MaintenanceContext, MaintenanceScheduler, MaintenanceTask};
pub use monitor::{HeartbeatMonitor, MonitorConfig};
pub use service::ServiceHandle;
pub use worker::{JobWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
