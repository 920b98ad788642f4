//! GPU render worker.
//!
//! This crate provides:
//! - [`RenderCoordinator`], which admits, launches and settles one render job
//! - [`JobExecutor`], which feeds the coordinator from the Redis job queue
//! - The render error taxonomy with retry classification
//! - Structured job logging, retry helpers and Prometheus metrics

pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod retry;

pub use config::WorkerConfig;
pub use coordinator::{CoordinatorConfig, RenderCoordinator, RenderOutput};
pub use error::{RenderError, WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use logging::JobLogger;
pub use retry::{retry_async, retry_async_if, FailureTracker, RetryConfig};
