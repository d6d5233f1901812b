//! Periodic lease renewal for one owned partition.

use super::document::Lease;
use super::manager::{LeaseManager, LeaseOutcome};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Latest known copy of an owned lease, shared by the renewer and the
/// checkpointer so each writes against the other's most recent tag.
#[derive(Debug, Clone)]
pub struct SharedLease(Arc<Mutex<Lease>>);

impl SharedLease {
    /// Start sharing `lease`.
    pub fn new(lease: Lease) -> Self {
        Self(Arc::new(Mutex::new(lease)))
    }

    /// Snapshot of the current lease.
    pub fn get(&self) -> Lease {
        self.0.lock().clone()
    }

    /// Replace the current lease with a newer stored version.
    pub fn set(&self, lease: Lease) {
        *self.0.lock() = lease;
    }

    /// Partition the lease covers.
    pub fn partition_id(&self) -> String {
        self.0.lock().partition_id.clone()
    }
}

/// Why a renewal task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalEnd {
    /// Stopped by its owner; the lease was released best-effort.
    Cancelled,
    /// Another host took the lease.
    Lost,
    /// The lease document was deleted.
    Gone,
}

/// Keeps one lease alive until cancelled or lost.
#[derive(Debug)]
pub struct LeaseRenewer {
    manager: Arc<LeaseManager>,
    lease: SharedLease,
    interval: Duration,
}

impl LeaseRenewer {
    pub fn new(manager: Arc<LeaseManager>, lease: SharedLease, interval: Duration) -> Self {
        Self {
            manager,
            lease,
            interval,
        }
    }

    /// Renew every `interval` until cancelled or ownership is lost.
    ///
    /// The first renewal happens after half an interval. Transport errors are
    /// logged and retried on the next tick; the lease simply expires if they
    /// persist. Cancellation releases the lease before returning.
    pub async fn run(self, cancel: CancellationToken) -> RenewalEnd {
        let partition = self.lease.partition_id();
        let mut delay = self.interval / 2;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.release(&partition).await;
                    return RenewalEnd::Cancelled;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.interval;

            match self.manager.renew(&self.lease.get()).await {
                Ok(LeaseOutcome::Updated(renewed)) => self.lease.set(renewed),
                Ok(LeaseOutcome::Lost) => {
                    info!(partition = %partition, owner = %self.manager.host_name(), "Lease lost to another host");
                    return RenewalEnd::Lost;
                }
                Ok(LeaseOutcome::Gone) => {
                    info!(partition = %partition, "Lease document removed");
                    return RenewalEnd::Gone;
                }
                Err(e) => {
                    warn!(partition = %partition, error = %e, "Failed to renew lease");
                }
            }
        }
    }

    async fn release(&self, partition: &str) {
        match self.manager.release(&self.lease.get()).await {
            Ok(_) => debug!(partition = %partition, "Renewer stopped"),
            Err(e) => warn!(partition = %partition, error = %e, "Failed to release lease on shutdown"),
        }
    }
}
