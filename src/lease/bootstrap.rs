//! Lease collection bootstrap.
//!
//! Drives the initialization gate through
//! `Uninitialized -> Locking -> Initializing -> Initialized`. Losing the lock
//! race falls back to `Uninitialized`, waits, and re-checks the marker, since
//! the winner usually finishes initialization in the meantime.

use super::store::LeaseStore;
use crate::config::LeaseStoreConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Initialization state of a lease collection as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStoreState {
    Uninitialized,
    Locking,
    Initializing,
    Initialized,
}

/// Creates the leases that must exist before processing starts.
#[async_trait]
pub trait PartitionSynchronizer: Send + Sync {
    /// Create a lease for every partition that lacks one.
    ///
    /// Returns the number of leases created.
    async fn create_missing_leases(&self) -> Result<usize>;
}

/// Runs one-time lease collection initialization among competing processes.
pub struct Bootstrapper {
    store: Arc<LeaseStore>,
    synchronizer: Arc<dyn PartitionSynchronizer>,
    config: LeaseStoreConfig,
    state: RwLock<LeaseStoreState>,
}

impl Bootstrapper {
    pub fn new(
        store: Arc<LeaseStore>,
        synchronizer: Arc<dyn PartitionSynchronizer>,
        config: LeaseStoreConfig,
    ) -> Self {
        Self {
            store,
            synchronizer,
            config,
            state: RwLock::new(LeaseStoreState::Uninitialized),
        }
    }

    /// Current state.
    pub fn state(&self) -> LeaseStoreState {
        *self.state.read()
    }

    fn transition(&self, to: LeaseStoreState) {
        let mut state = self.state.write();
        if *state != to {
            debug!(from = ?*state, to = ?to, "Lease store state transition");
            *state = to;
        }
    }

    /// Initialize the lease collection, or wait for another process to do so.
    ///
    /// Returns once the marker exists. Fails with [`Error::Cancelled`] if
    /// `cancel` fires while waiting for the lock.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if self.store.is_initialized().await? {
                self.transition(LeaseStoreState::Initialized);
                return Ok(());
            }

            self.transition(LeaseStoreState::Locking);
            let locked = match self.store.acquire_initialization_lock(self.config.lock_ttl).await {
                Ok(locked) => locked,
                Err(e) => {
                    self.transition(LeaseStoreState::Uninitialized);
                    return Err(e);
                }
            };
            if !locked {
                self.transition(LeaseStoreState::Uninitialized);
                debug!(
                    wait_ms = self.config.lock_wait_interval.as_millis() as u64,
                    "Another process is initializing the lease store"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(self.config.lock_wait_interval) => {}
                }
                continue;
            }

            self.transition(LeaseStoreState::Initializing);
            let outcome = self.initialize_locked().await;

            match self.store.release_initialization_lock().await {
                Ok(true) => {}
                Ok(false) => warn!("Initialization lock expired while initializing"),
                Err(e) => warn!(error = %e, "Failed to release initialization lock"),
            }

            match outcome {
                Ok(()) => {
                    self.transition(LeaseStoreState::Initialized);
                    return Ok(());
                }
                Err(e) => {
                    self.transition(LeaseStoreState::Uninitialized);
                    return Err(e);
                }
            }
        }
    }

    async fn initialize_locked(&self) -> Result<()> {
        // The previous holder may have finished between our check and our lock.
        if self.store.is_initialized().await? {
            return Ok(());
        }

        let created = self.synchronizer.create_missing_leases().await?;
        self.store.mark_initialized().await?;
        info!(leases_created = created, "Lease store initialized");
        Ok(())
    }
}

impl std::fmt::Debug for Bootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bootstrapper")
            .field("state", &self.state())
            .field("marker", &self.store.marker_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{InMemoryItemStore, ItemStore, StoreOp};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingSynchronizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PartitionSynchronizer for CountingSynchronizer {
        async fn create_missing_leases(&self) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(3)
        }
    }

    fn config() -> LeaseStoreConfig {
        LeaseStoreConfig::default()
            .with_lock_ttl(Duration::from_secs(30))
            .with_lock_wait_interval(Duration::from_millis(10))
    }

    fn bootstrapper(
        store: &Arc<InMemoryItemStore>,
        host: &str,
        sync: &Arc<CountingSynchronizer>,
    ) -> Bootstrapper {
        let gate = Arc::new(LeaseStore::new(store.clone(), "feed", host));
        Bootstrapper::new(gate, sync.clone(), config())
    }

    #[tokio::test]
    async fn test_initializes_fresh_store() {
        let store = Arc::new(InMemoryItemStore::new());
        let sync = Arc::new(CountingSynchronizer::default());
        let boot = bootstrapper(&store, "host-a", &sync);

        assert_eq!(boot.state(), LeaseStoreState::Uninitialized);
        boot.initialize(&CancellationToken::new()).await.unwrap();

        assert_eq!(boot.state(), LeaseStoreState::Initialized);
        assert_eq!(sync.calls.load(Ordering::SeqCst), 1);
        assert!(store.read_item("feed.info").await.is_ok());
        // Lock released.
        assert!(store.read_item("feed.lock").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_already_initialized_skips_synchronization() {
        let store = Arc::new(InMemoryItemStore::new());
        store.create_item("feed.info", json!({}), None).await.unwrap();
        let sync = Arc::new(CountingSynchronizer::default());
        let boot = bootstrapper(&store, "host-a", &sync);

        boot.initialize(&CancellationToken::new()).await.unwrap();
        assert_eq!(sync.calls.load(Ordering::SeqCst), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_racing_processes_initialize_once() {
        let store = Arc::new(InMemoryItemStore::new());
        let sync = Arc::new(CountingSynchronizer::default());
        let a = bootstrapper(&store, "host-a", &sync);
        let b = bootstrapper(&store, "host-b", &sync);
        let cancel = CancellationToken::new();

        let (ra, rb) = tokio::join!(a.initialize(&cancel), b.initialize(&cancel));
        ra.unwrap();
        rb.unwrap();

        assert_eq!(sync.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.state(), LeaseStoreState::Initialized);
        assert_eq!(b.state(), LeaseStoreState::Initialized);
    }

    #[tokio::test]
    async fn test_waiting_is_cancellable() {
        let store = Arc::new(InMemoryItemStore::new());
        // Someone else holds the lock and never finishes.
        store
            .create_item("feed.lock", json!({"owner": "host-z"}), None)
            .await
            .unwrap();
        let sync = Arc::new(CountingSynchronizer::default());
        let boot = bootstrapper(&store, "host-a", &sync);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        assert!(matches!(boot.initialize(&cancel).await, Err(Error::Cancelled)));
        assert_eq!(sync.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lock_store_error_resets_state() {
        let store = Arc::new(InMemoryItemStore::new());
        let sync = Arc::new(CountingSynchronizer::default());
        let boot = bootstrapper(&store, "host-a", &sync);

        store.fail_next(StoreOp::Create, StoreError::Unavailable("503".into()));
        assert!(boot.initialize(&CancellationToken::new()).await.is_err());
        assert_eq!(boot.state(), LeaseStoreState::Uninitialized);

        boot.initialize(&CancellationToken::new()).await.unwrap();
        assert_eq!(boot.state(), LeaseStoreState::Initialized);
    }

    #[tokio::test]
    async fn test_synchronization_failure_releases_lock() {
        struct FailingSynchronizer;

        #[async_trait]
        impl PartitionSynchronizer for FailingSynchronizer {
            async fn create_missing_leases(&self) -> Result<usize> {
                Err(Error::Internal("partition listing failed".into()))
            }
        }

        let store = Arc::new(InMemoryItemStore::new());
        let gate = Arc::new(LeaseStore::new(store.clone(), "feed", "host-a"));
        let boot = Bootstrapper::new(gate, Arc::new(FailingSynchronizer), config());

        assert!(matches!(
            boot.initialize(&CancellationToken::new()).await,
            Err(Error::Internal(_))
        ));
        assert_eq!(boot.state(), LeaseStoreState::Uninitialized);
        assert!(store.read_item("feed.lock").await.unwrap_err().is_not_found());
        assert!(store.read_item("feed.info").await.unwrap_err().is_not_found());
    }
}
