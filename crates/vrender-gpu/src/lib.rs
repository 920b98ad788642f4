//! GPU telemetry and resource ledger.
//!
//! This crate decides whether a render job may start on this host:
//! - `nvidia-smi` based hardware telemetry behind the [`TelemetrySource`] trait
//! - [`ResourceLedger`], the authoritative set of per-job GPU memory reservations
//! - Audit events broadcast on every ledger mutation

pub mod error;
pub mod events;
pub mod ledger;
pub mod telemetry;

pub use error::{GpuError, GpuResult};
pub use events::{LedgerEvent, LimitKind, ReleaseReason};
pub use ledger::{ResourceAllocator, ResourceLedger, DEFAULT_POLL_INTERVAL};
pub use telemetry::{NvidiaSmiTelemetry, StaticTelemetry, TelemetrySource};
