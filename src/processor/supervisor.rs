//! Lifecycle of one owned partition.
//!
//! open -> (process || renew) -> close -> release. The two inner tasks race;
//! whichever ends first decides the close reason and the other is stopped.
//! `close` runs exactly once, and only if `open` succeeded.

use super::partition::{LeaseCheckpointer, PartitionProcessor, PartitionSettings, ProcessingEnd};
use super::source::ChangeFeedSource;
use crate::lease::{LeaseManager, LeaseRenewer, RenewalEnd, SharedLease};
use crate::metrics::CoordinationMetrics;
use crate::observer::{CloseReason, FaultIsolatingObserver, ObserverContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs one partition from open to close.
pub struct PartitionSupervisor {
    manager: Arc<LeaseManager>,
    lease: SharedLease,
    observer: Arc<FaultIsolatingObserver>,
    source: Arc<dyn ChangeFeedSource>,
    settings: PartitionSettings,
    renew_interval: Duration,
    metrics: Arc<CoordinationMetrics>,
}

impl PartitionSupervisor {
    pub fn new(
        manager: Arc<LeaseManager>,
        lease: SharedLease,
        observer: Arc<FaultIsolatingObserver>,
        source: Arc<dyn ChangeFeedSource>,
        settings: PartitionSettings,
        renew_interval: Duration,
    ) -> Self {
        let metrics = manager.metrics().clone();
        Self {
            manager,
            lease,
            observer,
            source,
            settings,
            renew_interval,
            metrics,
        }
    }

    /// Run until `shutdown` fires or processing ends on its own.
    ///
    /// Returns the reason passed to `close`.
    pub async fn run(self, shutdown: CancellationToken) -> CloseReason {
        let metrics = self.metrics.clone();
        metrics.owned_leases.inc();
        let reason = self.supervise(shutdown).await;
        metrics.owned_leases.dec();
        reason
    }

    async fn supervise(self, shutdown: CancellationToken) -> CloseReason {
        let partition = self.lease.partition_id();
        let checkpointer = Arc::new(LeaseCheckpointer::new(self.manager.clone(), self.lease.clone()));
        let ctx = ObserverContext::new(partition.clone(), self.manager.host_name())
            .with_checkpointer(checkpointer.clone());

        if let Err(fault) = self.observer.open(&ctx).await {
            error!(partition = %partition, error = %fault, "Observer failed to open, releasing lease");
            if let Err(e) = self.manager.release(&self.lease.get()).await {
                warn!(partition = %partition, error = %e, "Failed to release lease after open failure");
            }
            return CloseReason::ObserverError;
        }

        let processor = PartitionProcessor::new(
            self.source.clone(),
            self.observer.clone(),
            ctx.clone(),
            checkpointer,
            self.settings.clone(),
            self.lease.get().continuation_token,
        );
        let renewer = LeaseRenewer::new(self.manager.clone(), self.lease.clone(), self.renew_interval);

        // The renewer outlives shutdown so the lease stays ours until close returns.
        let renew_cancel = CancellationToken::new();
        let process_cancel = shutdown.child_token();
        let mut renew_task = tokio::spawn(renewer.run(renew_cancel.clone()));
        let mut process_task = tokio::spawn(processor.run(process_cancel.clone()));

        let (reason, renewer_done) = tokio::select! {
            end = &mut process_task => (processing_reason(&partition, end), false),
            end = &mut renew_task => {
                process_cancel.cancel();
                if let Err(e) = process_task.await {
                    error!(partition = %partition, error = %e, "Partition processor task failed");
                }
                (renewal_reason(&partition, end), true)
            }
        };

        info!(partition = %partition, reason = %reason, "Closing partition observer");
        if let Err(fault) = self.observer.close(&ctx, reason).await {
            warn!(partition = %partition, error = %fault, "Observer close failed");
        }

        if !renewer_done {
            match reason {
                CloseReason::LeaseLost | CloseReason::LeaseGone => renew_task.abort(),
                _ => {
                    // Cancelling the renewer releases the lease.
                    renew_cancel.cancel();
                    if let Err(e) = renew_task.await {
                        error!(partition = %partition, error = %e, "Lease renewer task failed");
                    }
                }
            }
        }

        reason
    }
}

fn processing_reason(partition: &str, end: Result<ProcessingEnd, JoinError>) -> CloseReason {
    match end {
        Ok(ProcessingEnd::Cancelled) => CloseReason::Shutdown,
        Ok(ProcessingEnd::LeaseLost) => CloseReason::LeaseLost,
        Ok(ProcessingEnd::LeaseGone) => CloseReason::LeaseGone,
        Ok(ProcessingEnd::Observer(fault)) => {
            error!(partition = %partition, error = %fault, "Observer fault, stopping partition");
            CloseReason::ObserverError
        }
        Ok(ProcessingEnd::Read(e)) => {
            error!(partition = %partition, error = %e, "Feed read error, stopping partition");
            CloseReason::ReadError
        }
        Err(e) => {
            error!(partition = %partition, error = %e, "Partition processor task failed");
            CloseReason::Unknown
        }
    }
}

fn renewal_reason(partition: &str, end: Result<RenewalEnd, JoinError>) -> CloseReason {
    match end {
        Ok(RenewalEnd::Lost) => CloseReason::LeaseLost,
        Ok(RenewalEnd::Gone) => CloseReason::LeaseGone,
        Ok(RenewalEnd::Cancelled) => CloseReason::Shutdown,
        Err(e) => {
            error!(partition = %partition, error = %e, "Lease renewer task failed");
            CloseReason::Unknown
        }
    }
}
