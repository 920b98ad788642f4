//! Redis Streams job queue for render jobs.
//!
//! This crate provides:
//! - Job enqueueing via Redis Streams with idempotency-key deduplication
//! - Worker consumption with retry counting, pending-job claiming and DLQ
//! - Progress events via Redis Pub/Sub

pub mod error;
pub mod job;
pub mod progress;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use job::QueueJob;
pub use progress::ProgressChannel;
pub use queue::{JobQueue, QueueConfig};
