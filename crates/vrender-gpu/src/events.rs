//! Audit events emitted by the resource ledger.

use serde::Serialize;
use vrender_models::{Allocation, ResourceLimits};

/// Why an allocation left the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// The owning job released it
    Explicit,
    /// Swept by stale cleanup because the owning job is gone
    Stale,
}

/// Which device limit was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Utilization,
    Temperature,
}

/// One ledger mutation or limit observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    Allocated(Allocation),
    Released {
        allocation: Allocation,
        reason: ReleaseReason,
    },
    /// A device is at or over an admission limit and will be skipped.
    LimitWarning {
        device_index: u32,
        kind: LimitKind,
        value: f32,
        limit: f32,
    },
    LimitsUpdated(ResourceLimits),
}

impl LedgerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::Allocated(_) => "allocated",
            LedgerEvent::Released { .. } => "released",
            LedgerEvent::LimitWarning { .. } => "limit_warning",
            LedgerEvent::LimitsUpdated(_) => "limits_updated",
        }
    }
}
