//! Lease ownership protocol.
//!
//! Every mutation is a conditional replace against the lease's concurrency
//! tag. A tag mismatch means someone else wrote the lease since we read it;
//! the manager never papers over that with a local lock.

use super::document::{lease_id, Lease, LEASE_ID_SEPARATOR};
use crate::error::{LeaseError, Result, StoreError};
use crate::metrics::CoordinationMetrics;
use crate::store::ItemStore;
use crate::types::{now_ms, HostName};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of an ownership-changing lease operation.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome {
    /// The write went through; carries the lease as now stored.
    Updated(Lease),
    /// Another host owns the lease or won the race for it.
    Lost,
    /// The lease document no longer exists.
    Gone,
}

impl LeaseOutcome {
    /// The updated lease, if the write went through.
    pub fn into_lease(self) -> Option<Lease> {
        match self {
            LeaseOutcome::Updated(lease) => Some(lease),
            LeaseOutcome::Lost | LeaseOutcome::Gone => None,
        }
    }

    /// Turn a lost or gone outcome into the matching [`LeaseError`].
    pub fn into_result(self, partition_id: &str) -> std::result::Result<Lease, LeaseError> {
        match self {
            LeaseOutcome::Updated(lease) => Ok(lease),
            LeaseOutcome::Lost => Err(LeaseError::Lost {
                partition_id: partition_id.to_string(),
            }),
            LeaseOutcome::Gone => Err(LeaseError::Gone {
                partition_id: partition_id.to_string(),
            }),
        }
    }
}

/// Reads and writes the leases of one lease collection on behalf of one host.
#[derive(Debug)]
pub struct LeaseManager {
    store: Arc<dyn ItemStore>,
    prefix: String,
    host_name: HostName,
    expiration: Duration,
    max_retries: usize,
    metrics: Arc<CoordinationMetrics>,
}

impl LeaseManager {
    /// Manage the leases under `prefix` on behalf of `host_name`.
    ///
    /// A lease whose timestamp is older than `expiration` is free to take.
    pub fn new(
        store: Arc<dyn ItemStore>,
        prefix: impl Into<String>,
        host_name: impl Into<HostName>,
        expiration: Duration,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            host_name: host_name.into(),
            expiration,
            max_retries: 5,
            metrics: Arc::new(CoordinationMetrics::new()),
        }
    }

    /// Bound on conflict retries for renew, release and checkpoint.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Report lease transitions into shared metrics.
    pub fn with_metrics(mut self, metrics: Arc<CoordinationMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Identity written into owned leases.
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Age after which a lease counts as abandoned.
    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Metrics this manager reports into.
    pub fn metrics(&self) -> &Arc<CoordinationMetrics> {
        &self.metrics
    }

    /// Create an unowned lease for `partition_id`.
    ///
    /// Returns `None` when the lease already exists.
    pub async fn create_lease_if_not_exists(
        &self,
        partition_id: &str,
        continuation_token: Option<String>,
    ) -> Result<Option<Lease>> {
        let lease = Lease::new(&self.prefix, partition_id, continuation_token);
        match self.store.create_item(&lease.id, lease.to_body()?, None).await {
            Ok(item) => {
                debug!(partition = %partition_id, "Created lease");
                Ok(Some(Lease::from_item(item)?))
            }
            Err(StoreError::Conflict { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the lease for `partition_id`, `None` if it does not exist.
    pub async fn read_lease(&self, partition_id: &str) -> Result<Option<Lease>> {
        match self.store.read_item(&lease_id(&self.prefix, partition_id)).await {
            Ok(item) => Ok(Some(Lease::from_item(item)?)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every lease in the collection, ordered by id.
    pub async fn list_all_leases(&self) -> Result<Vec<Lease>> {
        let prefix = format!("{}{}", self.prefix, LEASE_ID_SEPARATOR);
        let items = self.store.list_items(&prefix).await?;

        let mut leases = Vec::with_capacity(items.len());
        for item in items {
            match Lease::from_item(item) {
                Ok(lease) => leases.push(lease),
                Err(e) => warn!(error = %e, "Skipping unreadable lease"),
            }
        }
        Ok(leases)
    }

    /// Leases currently owned by this host.
    pub async fn list_owned_leases(&self) -> Result<Vec<Lease>> {
        let mut leases = self.list_all_leases().await?;
        leases.retain(|lease| lease.is_owned_by(&self.host_name));
        Ok(leases)
    }

    /// Delete a lease; a lease that is already gone is not an error.
    pub async fn delete_lease(&self, lease: &Lease) -> Result<()> {
        match self.store.delete_item(&lease.id, None).await {
            Ok(()) | Err(StoreError::NotFound { .. }) => {
                debug!(partition = %lease.partition_id, "Deleted lease");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take ownership of an unowned or expired lease.
    ///
    /// Reads the lease fresh and writes conditionally on that read, so a
    /// host that wins in between makes this return [`LeaseOutcome::Lost`].
    pub async fn acquire(&self, lease: &Lease) -> Result<LeaseOutcome> {
        let Some(mut current) = self.read_lease(&lease.partition_id).await? else {
            return Ok(LeaseOutcome::Gone);
        };

        if !current.is_available_to(&self.host_name, now_ms(), self.expiration) {
            debug!(
                partition = %current.partition_id,
                owner = ?current.owner,
                "Lease is held by a live owner"
            );
            return Ok(LeaseOutcome::Lost);
        }

        let previous_owner = current.owner.take();
        current.owner = Some(self.host_name.clone());
        current.timestamp_ms = now_ms();

        match self.replace(&current).await? {
            LeaseOutcome::Updated(acquired) => {
                self.metrics.leases_acquired.inc();
                info!(
                    partition = %acquired.partition_id,
                    owner = %self.host_name,
                    previous_owner = ?previous_owner,
                    "Acquired lease"
                );
                Ok(LeaseOutcome::Updated(acquired))
            }
            LeaseOutcome::Lost => {
                self.metrics.lease_acquire_conflicts.inc();
                debug!(partition = %current.partition_id, "Lost acquisition race");
                Ok(LeaseOutcome::Lost)
            }
            LeaseOutcome::Gone => Ok(LeaseOutcome::Gone),
        }
    }

    /// Refresh the timestamp of a lease this host owns.
    pub async fn renew(&self, lease: &Lease) -> Result<LeaseOutcome> {
        let outcome = self
            .update_with_retry(lease, |lease| {
                lease.timestamp_ms = now_ms();
            })
            .await?;

        match &outcome {
            LeaseOutcome::Updated(renewed) => {
                self.metrics.leases_renewed.inc();
                debug!(partition = %renewed.partition_id, "Renewed lease");
            }
            LeaseOutcome::Lost | LeaseOutcome::Gone => {
                self.metrics.leases_lost.inc();
                info!(partition = %lease.partition_id, outcome = outcome_name(&outcome), "Lease ownership lost on renew");
            }
        }
        Ok(outcome)
    }

    /// Give up ownership of a lease.
    ///
    /// A lease that was already reassigned or deleted is left alone.
    pub async fn release(&self, lease: &Lease) -> Result<LeaseOutcome> {
        let outcome = self
            .update_with_retry(lease, |lease| {
                lease.owner = None;
                lease.timestamp_ms = now_ms();
            })
            .await?;

        match &outcome {
            LeaseOutcome::Updated(_) => {
                self.metrics.leases_released.inc();
                info!(partition = %lease.partition_id, owner = %self.host_name, "Released lease");
            }
            LeaseOutcome::Lost | LeaseOutcome::Gone => {
                debug!(partition = %lease.partition_id, outcome = outcome_name(&outcome), "Lease already reassigned, nothing to release");
            }
        }
        Ok(outcome)
    }

    /// Record the feed position reached for an owned lease.
    pub async fn checkpoint(&self, lease: &Lease, continuation_token: &str) -> Result<LeaseOutcome> {
        let outcome = self
            .update_with_retry(lease, |lease| {
                lease.continuation_token = Some(continuation_token.to_string());
                lease.timestamp_ms = now_ms();
            })
            .await?;

        if let LeaseOutcome::Updated(_) = &outcome {
            debug!(partition = %lease.partition_id, continuation = %continuation_token, "Checkpointed lease");
        }
        Ok(outcome)
    }

    /// Replace the free-form properties of an owned lease.
    pub async fn update_properties(
        &self,
        lease: &Lease,
        properties: BTreeMap<String, String>,
    ) -> Result<LeaseOutcome> {
        self.update_with_retry(lease, |lease| {
            lease.properties = properties.clone();
        })
        .await
    }

    /// Apply `update` to an owned lease with conditional writes.
    ///
    /// A tag conflict re-reads the lease and retries only while this host is
    /// still the owner, so a conflict caused by our own earlier write or a
    /// property change is absorbed, while a steal resolves to `Lost`.
    async fn update_with_retry<F>(&self, lease: &Lease, update: F) -> Result<LeaseOutcome>
    where
        F: Fn(&mut Lease),
    {
        let mut current = lease.clone();

        for attempt in 0..=self.max_retries {
            if !current.is_owned_by(&self.host_name) {
                return Ok(LeaseOutcome::Lost);
            }

            let mut updated = current.clone();
            update(&mut updated);

            match self.replace(&updated).await? {
                LeaseOutcome::Lost => {
                    debug!(partition = %lease.partition_id, attempt, "Lease changed underneath update, re-reading");
                    match self.read_lease(&lease.partition_id).await? {
                        Some(fresh) => current = fresh,
                        None => return Ok(LeaseOutcome::Gone),
                    }
                }
                outcome => return Ok(outcome),
            }
        }

        warn!(
            partition = %lease.partition_id,
            retries = self.max_retries,
            "Giving up on lease update after repeated conflicts"
        );
        Ok(LeaseOutcome::Lost)
    }

    /// Conditional replace mapping `Conflict`/`NotFound` to outcomes.
    async fn replace(&self, lease: &Lease) -> Result<LeaseOutcome> {
        match self
            .store
            .replace_item(&lease.id, lease.to_body()?, &lease.concurrency_tag)
            .await
        {
            Ok(item) => Ok(LeaseOutcome::Updated(Lease::from_item(item)?)),
            Err(StoreError::Conflict { .. }) => Ok(LeaseOutcome::Lost),
            Err(StoreError::NotFound { .. }) => Ok(LeaseOutcome::Gone),
            Err(e) => Err(e.into()),
        }
    }
}

fn outcome_name(outcome: &LeaseOutcome) -> &'static str {
    match outcome {
        LeaseOutcome::Updated(_) => "updated",
        LeaseOutcome::Lost => "lost",
        LeaseOutcome::Gone => "gone",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::{InMemoryItemStore, StoreOp};

    const EXPIRATION: Duration = Duration::from_secs(60);

    fn manager(store: &Arc<InMemoryItemStore>, host: &str) -> LeaseManager {
        LeaseManager::new(store.clone(), "feed", host, EXPIRATION)
    }

    async fn seeded(store: &Arc<InMemoryItemStore>, partition: &str) -> Lease {
        manager(store, "seeder")
            .create_lease_if_not_exists(partition, None)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_lease_if_not_exists() {
        let store = Arc::new(InMemoryItemStore::new());
        let mgr = manager(&store, "host-a");

        let created = mgr.create_lease_if_not_exists("0", Some("c0".into())).await.unwrap();
        assert!(created.is_some());
        assert!(mgr.create_lease_if_not_exists("0", None).await.unwrap().is_none());

        let read = mgr.read_lease("0").await.unwrap().unwrap();
        assert_eq!(read.continuation_token.as_deref(), Some("c0"));
        assert!(mgr.read_lease("1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acquire_unowned_lease() {
        let store = Arc::new(InMemoryItemStore::new());
        let lease = seeded(&store, "0").await;
        let mgr = manager(&store, "host-a");

        let acquired = mgr.acquire(&lease).await.unwrap().into_lease().unwrap();
        assert!(acquired.is_owned_by("host-a"));
        assert_ne!(acquired.concurrency_tag, lease.concurrency_tag);
        assert_eq!(mgr.metrics().leases_acquired.get(), 1);
    }

    #[tokio::test]
    async fn test_live_lease_cannot_be_acquired() {
        let store = Arc::new(InMemoryItemStore::new());
        let lease = seeded(&store, "0").await;
        let a = manager(&store, "host-a");
        let b = manager(&store, "host-b");

        a.acquire(&lease).await.unwrap().into_lease().unwrap();
        assert_eq!(b.acquire(&lease).await.unwrap(), LeaseOutcome::Lost);
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_stolen() {
        let store = Arc::new(InMemoryItemStore::new());
        let lease = seeded(&store, "0").await;
        let a = LeaseManager::new(store.clone(), "feed", "host-a", Duration::from_millis(1));
        let b = LeaseManager::new(store.clone(), "feed", "host-b", Duration::from_millis(1));

        let held = a.acquire(&lease).await.unwrap().into_lease().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stolen = b.acquire(&held).await.unwrap().into_lease().unwrap();
        assert!(stolen.is_owned_by("host-b"));

        // The old owner's next renew finds the steal.
        assert_eq!(a.renew(&held).await.unwrap(), LeaseOutcome::Lost);
        assert_eq!(a.metrics().leases_lost.get(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let store = Arc::new(InMemoryItemStore::new());
        let lease = seeded(&store, "0").await;
        store.set_latency(Some(Duration::from_millis(5)));
        let a = manager(&store, "host-a");
        let b = manager(&store, "host-b");

        let (ra, rb) = tokio::join!(a.acquire(&lease), b.acquire(&lease));
        let winners = [ra.unwrap(), rb.unwrap()]
            .into_iter()
            .filter(|outcome| matches!(outcome, LeaseOutcome::Updated(_)))
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_renew_absorbs_own_stale_tag() {
        let store = Arc::new(InMemoryItemStore::new());
        let lease = seeded(&store, "0").await;
        let mgr = manager(&store, "host-a");

        let held = mgr.acquire(&lease).await.unwrap().into_lease().unwrap();
        let checkpointed = mgr.checkpoint(&held, "42").await.unwrap().into_lease().unwrap();

        // Renewing with the pre-checkpoint copy conflicts, re-reads, and succeeds.
        let renewed = mgr.renew(&held).await.unwrap().into_lease().unwrap();
        assert_eq!(renewed.continuation_token.as_deref(), Some("42"));
        assert_ne!(renewed.concurrency_tag, checkpointed.concurrency_tag);
    }

    #[tokio::test]
    async fn test_release_clears_owner() {
        let store = Arc::new(InMemoryItemStore::new());
        let lease = seeded(&store, "0").await;
        let mgr = manager(&store, "host-a");

        let held = mgr.acquire(&lease).await.unwrap().into_lease().unwrap();
        let released = mgr.release(&held).await.unwrap().into_lease().unwrap();
        assert!(released.owner.is_none());
        assert!(mgr.list_owned_leases().await.unwrap().is_empty());

        // Releasing a lease we no longer own is a no-op.
        assert_eq!(mgr.release(&released).await.unwrap(), LeaseOutcome::Lost);
        assert_eq!(mgr.metrics().leases_released.get(), 1);
    }

    #[tokio::test]
    async fn test_deleted_lease_is_gone() {
        let store = Arc::new(InMemoryItemStore::new());
        let lease = seeded(&store, "0").await;
        let mgr = manager(&store, "host-a");

        let held = mgr.acquire(&lease).await.unwrap().into_lease().unwrap();
        mgr.delete_lease(&held).await.unwrap();
        mgr.delete_lease(&held).await.unwrap();

        assert_eq!(mgr.renew(&held).await.unwrap(), LeaseOutcome::Gone);
        assert_eq!(mgr.acquire(&held).await.unwrap(), LeaseOutcome::Gone);
        assert!(matches!(
            LeaseOutcome::Gone.into_result("0"),
            Err(LeaseError::Gone { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_gives_up_after_max_retries() {
        let store = Arc::new(InMemoryItemStore::new());
        let lease = seeded(&store, "0").await;
        let mgr = manager(&store, "host-a").with_max_retries(2);
        let held = mgr.acquire(&lease).await.unwrap().into_lease().unwrap();

        for _ in 0..3 {
            store.fail_next(StoreOp::Replace, StoreError::Conflict { id: held.id.clone() });
        }
        assert_eq!(mgr.checkpoint(&held, "1").await.unwrap(), LeaseOutcome::Lost);
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let store = Arc::new(InMemoryItemStore::new());
        let lease = seeded(&store, "0").await;
        let mgr = manager(&store, "host-a");

        store.fail_next(StoreOp::Read, StoreError::Unavailable("timeout".into()));
        assert!(matches!(
            mgr.acquire(&lease).await,
            Err(Error::Store(StoreError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_list_leases() {
        let store = Arc::new(InMemoryItemStore::new());
        for partition in ["0", "1", "2"] {
            seeded(&store, partition).await;
        }
        // Marker and lock documents are not leases.
        store.create_item("feed.info", serde_json::json!({}), None).await.unwrap();

        let mgr = manager(&store, "host-a");
        let all = mgr.list_all_leases().await.unwrap();
        assert_eq!(all.len(), 3);

        mgr.acquire(&all[1]).await.unwrap();
        let owned = mgr.list_owned_leases().await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].partition_id, "1");
    }

    #[tokio::test]
    async fn test_update_properties() {
        let store = Arc::new(InMemoryItemStore::new());
        let lease = seeded(&store, "0").await;
        let mgr = manager(&store, "host-a");
        let held = mgr.acquire(&lease).await.unwrap().into_lease().unwrap();

        let mut properties = BTreeMap::new();
        properties.insert("shard".to_string(), "blue".to_string());
        let updated = mgr.update_properties(&held, properties).await.unwrap().into_lease().unwrap();
        assert_eq!(updated.properties.get("shard").map(String::as_str), Some("blue"));
    }
}
