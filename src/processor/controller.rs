//! Lease acquisition across partitions.
//!
//! Each pass lists every lease, works out this host's fair share and tries
//! to acquire unowned or expired leases until it reaches it. Losing a race
//! for one lease just moves on to the next candidate.
//!
//! A partition whose lease ended with [`CloseReason::LeaseGone`] is not
//! picked up again by this host: its feed reported it split or merged away,
//! so reopening it would only fail the same way.

use super::partition::PartitionSettings;
use super::source::ChangeFeedSource;
use super::supervisor::PartitionSupervisor;
use crate::config::ProcessorConfig;
use crate::error::Result;
use crate::lease::{Lease, LeaseManager, LeaseOutcome, SharedLease};
use crate::observer::{CloseReason, FaultIsolatingObserver, ObserverFactory};
use crate::types::{now_ms, PartitionRangeId};
use dashmap::DashSet;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Acquires leases and runs a supervisor for each one held.
pub struct PartitionController {
    manager: Arc<LeaseManager>,
    source: Arc<dyn ChangeFeedSource>,
    factory: Arc<dyn ObserverFactory>,
    config: ProcessorConfig,
    running: Arc<DashSet<PartitionRangeId>>,
    gone: Arc<DashSet<PartitionRangeId>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl PartitionController {
    pub fn new(
        manager: Arc<LeaseManager>,
        source: Arc<dyn ChangeFeedSource>,
        factory: Arc<dyn ObserverFactory>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            manager,
            source,
            factory,
            config,
            running: Arc::new(DashSet::new()),
            gone: Arc::new(DashSet::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Partitions with a live supervisor on this host, sorted.
    pub fn running_partitions(&self) -> Vec<PartitionRangeId> {
        let mut partitions: Vec<_> = self.running.iter().map(|entry| entry.key().clone()).collect();
        partitions.sort();
        partitions
    }

    /// Partitions this host stopped with `LeaseGone` and will not reacquire, sorted.
    pub fn gone_partitions(&self) -> Vec<PartitionRangeId> {
        let mut partitions: Vec<_> = self.gone.iter().map(|entry| entry.key().clone()).collect();
        partitions.sort();
        partitions
    }

    /// Acquire leases every `lease_acquire_interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let interval = self.config.lease_acquire_interval;
        let max_jitter_ms = (interval.as_millis() as u64 / 10).max(1);

        loop {
            if let Err(e) = self.run_once().await {
                warn!(host = %self.manager.host_name(), error = %e, "Lease acquisition pass failed");
            }

            let jitter = Duration::from_millis(rand::rng().random_range(0..max_jitter_ms));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval + jitter) => {}
            }
        }
    }

    /// One acquisition pass. Returns the number of leases acquired.
    pub async fn run_once(&self) -> Result<usize> {
        if self.shutdown.is_cancelled() {
            return Ok(0);
        }

        let mut leases = self.manager.list_all_leases().await?;
        leases.retain(|lease| !self.gone.contains(&lease.partition_id));
        let host = self.manager.host_name();
        let now = now_ms();
        let expiration = self.manager.expiration();

        let active_hosts = {
            let mut hosts: HashSet<&str> = HashSet::new();
            hosts.insert(host);
            for lease in &leases {
                if let Some(owner) = lease.owner.as_deref() {
                    if !lease.is_expired(now, expiration) {
                        hosts.insert(owner);
                    }
                }
            }
            hosts.len()
        };

        let mut target = leases.len().div_ceil(active_hosts);
        if let Some(max) = self.config.max_partitions_per_host {
            target = target.min(max);
        }

        let mine = self.running.len();
        if mine >= target {
            return Ok(0);
        }

        let mut candidates: Vec<Lease> = leases
            .into_iter()
            .filter(|lease| !self.running.contains(&lease.partition_id))
            .filter(|lease| lease.is_available_to(host, now, expiration))
            .collect();
        candidates.shuffle(&mut rand::rng());

        debug!(
            host = %host,
            hosts = active_hosts,
            target,
            owned = mine,
            candidates = candidates.len(),
            "Lease acquisition pass"
        );

        let mut acquired = 0;
        for candidate in candidates {
            if mine + acquired >= target || self.shutdown.is_cancelled() {
                break;
            }

            match self.manager.acquire(&candidate).await {
                Ok(LeaseOutcome::Updated(lease)) => {
                    self.start_partition(lease);
                    acquired += 1;
                }
                Ok(LeaseOutcome::Lost) | Ok(LeaseOutcome::Gone) => continue,
                Err(e) => {
                    warn!(partition = %candidate.partition_id, error = %e, "Failed to acquire lease");
                }
            }
        }

        if acquired > 0 {
            info!(host = %host, acquired, owned = mine + acquired, target, "Acquired leases");
        }
        Ok(acquired)
    }

    fn start_partition(&self, lease: Lease) {
        let partition = lease.partition_id.clone();
        let token = self.shutdown.child_token();
        self.running.insert(partition.clone());

        let observer = Arc::new(FaultIsolatingObserver::new(
            self.factory.create(),
            self.manager.metrics().clone(),
        ));
        let supervisor = PartitionSupervisor::new(
            self.manager.clone(),
            SharedLease::new(lease),
            observer,
            self.source.clone(),
            PartitionSettings {
                poll_delay: self.config.feed_poll_delay,
                max_items_per_batch: self.config.max_items_per_batch,
                auto_checkpoint: self.config.auto_checkpoint,
            },
            self.config.lease_renew_interval,
        );

        let running = self.running.clone();
        let gone = self.gone.clone();
        self.tracker.spawn(async move {
            let reason = supervisor.run(token).await;
            if reason == CloseReason::LeaseGone {
                gone.insert(partition.clone());
            }
            running.remove(&partition);
            debug!(partition = %partition, reason = %reason, "Partition stopped");
        });
    }

    /// Stop every partition and wait for their observers to close.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(host = %self.manager.host_name(), "Partition controller stopped");
    }
}

impl std::fmt::Debug for PartitionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionController")
            .field("host", &self.manager.host_name())
            .field("running", &self.running_partitions())
            .finish()
    }
}
