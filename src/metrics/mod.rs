//! In-process metrics for the coordination core.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                   CoordinationMetrics                     │
//! │  ┌──────────────────┐ ┌──────────────────┐ ┌────────────┐ │
//! │  │ Session          │ │ Leases           │ │ Observers  │ │
//! │  │ - merged         │ │ - acquired       │ │ - faults   │ │
//! │  │ - rejected       │ │ - conflicts      │ │ - closes   │ │
//! │  │                  │ │ - renewed / lost │ │   by reason│ │
//! │  │                  │ │ - owned (gauge)  │ │            │ │
//! │  └──────────────────┘ └──────────────────┘ └────────────┘ │
//! └───────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;

pub use counters::{Counter, LabeledCounter};
pub use gauges::Gauge;

/// Counters shared by the session container and the lease machinery.
#[derive(Debug)]
pub struct CoordinationMetrics {
    /// Session tokens merged into the container.
    pub session_tokens_merged: Counter,
    /// Session token header entries ignored as malformed.
    pub session_tokens_rejected: Counter,

    /// Leases acquired by this host.
    pub leases_acquired: Counter,
    /// Acquisition attempts lost to another host.
    pub lease_acquire_conflicts: Counter,
    /// Successful renewals.
    pub leases_renewed: Counter,
    /// Leases lost while owned.
    pub leases_lost: Counter,
    /// Leases released by this host.
    pub leases_released: Counter,
    /// Leases currently processed by this host.
    pub owned_leases: Gauge,

    /// Observer callbacks that failed or panicked.
    pub observer_faults: Counter,
    /// Observer closes by reason.
    pub observer_closes: LabeledCounter,
}

impl CoordinationMetrics {
    /// Create a zeroed metrics instance.
    pub fn new() -> Self {
        Self {
            session_tokens_merged: Counter::new("session_tokens_merged_total"),
            session_tokens_rejected: Counter::new("session_tokens_rejected_total"),
            leases_acquired: Counter::new("leases_acquired_total"),
            lease_acquire_conflicts: Counter::new("lease_acquire_conflicts_total"),
            leases_renewed: Counter::new("leases_renewed_total"),
            leases_lost: Counter::new("leases_lost_total"),
            leases_released: Counter::new("leases_released_total"),
            owned_leases: Gauge::new("owned_leases"),
            observer_faults: Counter::new("observer_faults_total"),
            observer_closes: LabeledCounter::new("observer_closes_total", "reason"),
        }
    }

    /// Point-in-time copy of every value.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            session_tokens_merged: self.session_tokens_merged.get(),
            session_tokens_rejected: self.session_tokens_rejected.get(),
            leases_acquired: self.leases_acquired.get(),
            lease_acquire_conflicts: self.lease_acquire_conflicts.get(),
            leases_renewed: self.leases_renewed.get(),
            leases_lost: self.leases_lost.get(),
            leases_released: self.leases_released.get(),
            owned_leases: self.owned_leases.get(),
            observer_faults: self.observer_faults.get(),
            observer_closes: self.observer_closes.get_all(),
        }
    }
}

impl Default for CoordinationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain copy of [`CoordinationMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub session_tokens_merged: u64,
    pub session_tokens_rejected: u64,
    pub leases_acquired: u64,
    pub lease_acquire_conflicts: u64,
    pub leases_renewed: u64,
    pub leases_lost: u64,
    pub leases_released: u64,
    pub owned_leases: i64,
    pub observer_faults: u64,
    pub observer_closes: Vec<(String, u64)>,
}

impl MetricsSnapshot {
    /// Share of acquisition attempts that lost the race.
    pub fn acquire_conflict_rate(&self) -> f64 {
        let attempts = self.leases_acquired + self.lease_acquire_conflicts;
        if attempts == 0 {
            0.0
        } else {
            self.lease_acquire_conflicts as f64 / attempts as f64
        }
    }
}
