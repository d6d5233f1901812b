//! Change feed processor host.
//!
//! [`ChangeFeedProcessor`] ties the lease subsystem to user observers:
//!
//! ```text
//!  start()
//!    │
//!    ├─ Bootstrapper ── create a lease per partition (once per collection)
//!    │
//!    └─ PartitionController ── every acquire interval:
//!          list leases → fair share → acquire free/expired leases
//!               │
//!               └─ PartitionSupervisor (one per owned lease)
//!                     open → PartitionProcessor ║ LeaseRenewer → close → release
//! ```

mod controller;
mod partition;
mod source;
mod supervisor;

pub use controller::PartitionController;
pub use partition::{LeaseCheckpointer, PartitionProcessor, PartitionSettings, ProcessingEnd};
pub use source::{ChangeBatch, ChangeFeedSource, LeaseSynchronizer, PartitionRangeProvider};
pub use supervisor::PartitionSupervisor;

use crate::config::ProcessorConfig;
use crate::error::{Error, Result};
use crate::lease::{Bootstrapper, LeaseManager, LeaseStore};
use crate::metrics::CoordinationMetrics;
use crate::observer::ObserverFactory;
use crate::store::ItemStore;
use crate::types::PartitionRangeId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A host competing for the partitions of one change feed.
pub struct ChangeFeedProcessor {
    config: ProcessorConfig,
    bootstrapper: Bootstrapper,
    controller: Arc<PartitionController>,
    metrics: Arc<CoordinationMetrics>,
    cancel: CancellationToken,
    started: AtomicBool,
    acquire_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeFeedProcessor {
    /// Build a processor. Fails if `config` does not validate.
    pub fn new(
        config: ProcessorConfig,
        lease_store: Arc<dyn ItemStore>,
        ranges: Arc<dyn PartitionRangeProvider>,
        source: Arc<dyn ChangeFeedSource>,
        factory: Arc<dyn ObserverFactory>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(CoordinationMetrics::new());
        let manager = Arc::new(
            LeaseManager::new(
                lease_store.clone(),
                config.lease_prefix.clone(),
                config.host_name.clone(),
                config.lease_expiration_interval,
            )
            .with_max_retries(config.max_lease_update_retries)
            .with_metrics(metrics.clone()),
        );

        let gate = Arc::new(LeaseStore::new(lease_store, &config.lease_prefix, config.host_name.clone()));
        let synchronizer = Arc::new(LeaseSynchronizer::new(ranges, manager.clone()));
        let bootstrapper = Bootstrapper::new(gate, synchronizer, config.initialization.clone());
        let controller = Arc::new(PartitionController::new(manager, source, factory, config.clone()));

        Ok(Self {
            config,
            bootstrapper,
            controller,
            metrics,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            acquire_loop: Mutex::new(None),
        })
    }

    pub fn host_name(&self) -> &str {
        &self.config.host_name
    }

    pub fn metrics(&self) -> &Arc<CoordinationMetrics> {
        &self.metrics
    }

    /// Partitions this host is currently processing.
    pub fn owned_partitions(&self) -> Vec<PartitionRangeId> {
        self.controller.running_partitions()
    }

    /// Initialize the lease collection if needed, then start acquiring leases.
    ///
    /// Only one call succeeds; a failed initialization allows another try.
    pub async fn start(&self) -> Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Internal("processor already started".into()));
        }

        if let Err(e) = self.bootstrapper.initialize(&self.cancel).await {
            self.started.store(false, Ordering::Release);
            return Err(e);
        }

        let controller = self.controller.clone();
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move { controller.run(cancel).await });
        *self.acquire_loop.lock() = Some(handle);

        info!(host = %self.config.host_name, prefix = %self.config.lease_prefix, "Change feed processor started");
        Ok(())
    }

    /// Stop acquiring, close every observer and release every lease.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let handle = self.acquire_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Lease acquisition loop failed");
            }
        }

        self.controller.shutdown().await;
        info!(host = %self.config.host_name, "Change feed processor stopped");
    }
}

impl std::fmt::Debug for ChangeFeedProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeedProcessor")
            .field("host", &self.config.host_name)
            .field("state", &self.bootstrapper.state())
            .field("owned", &self.owned_partitions())
            .finish()
    }
}
