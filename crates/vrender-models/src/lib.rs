//! Shared data models for the VRender backend.
//!
//! This crate provides Serde-serializable types for:
//! - Render jobs as delivered by the job queue
//! - GPU devices, allocations and admission limits
//! - Supervised process state, metrics and limits
//! - Progress messages published to callers

pub mod gpu;
pub mod job;
pub mod process;
pub mod progress;

// Re-export common types
pub use gpu::{Allocation, Device, LedgerSummary, LimitsUpdate, ResourceLimits};
pub use job::{AdmissionPolicy, JobId, RenderJob, RenderQuality, Resolution};
pub use process::{ProcessLimits, ProcessMetrics, ProcessResourceInfo, ProcessState};
pub use progress::{RenderProgress, RenderStatus};
