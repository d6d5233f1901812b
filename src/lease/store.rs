//! One-time initialization gate for a lease collection.
//!
//! Two documents live next to the leases: a permanent marker written once the
//! collection is initialized, and a TTL-bounded lock held by whichever process
//! is initializing it. The lock is best effort: if it expires mid-initialization
//! a second process may start initializing too, which is why marker creation
//! treats `Conflict` as success.

use crate::error::{LeaseError, Result, StoreError};
use crate::store::ItemStore;
use crate::types::{now_ms, ConcurrencyTag, HostName};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const MARKER_SUFFIX: &str = ".info";
const LOCK_SUFFIX: &str = ".lock";

/// Marker and lock documents gating lease collection initialization.
#[derive(Debug)]
pub struct LeaseStore {
    store: Arc<dyn ItemStore>,
    marker_id: String,
    lock_id: String,
    host_name: HostName,
    /// Tag of the lock document while this process holds it.
    lock_tag: Mutex<Option<ConcurrencyTag>>,
}

impl LeaseStore {
    /// Create a gate for the leases under `prefix`.
    pub fn new(store: Arc<dyn ItemStore>, prefix: &str, host_name: impl Into<HostName>) -> Self {
        Self {
            store,
            marker_id: format!("{}{}", prefix, MARKER_SUFFIX),
            lock_id: format!("{}{}", prefix, LOCK_SUFFIX),
            host_name: host_name.into(),
            lock_tag: Mutex::new(None),
        }
    }

    /// Id of the marker document.
    pub fn marker_id(&self) -> &str {
        &self.marker_id
    }

    /// Id of the lock document.
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Whether initialization has completed.
    pub async fn is_initialized(&self) -> Result<bool> {
        match self.store.read_item(&self.marker_id).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Record that initialization has completed.
    ///
    /// Idempotent: a marker created concurrently by another process counts
    /// as success.
    pub async fn mark_initialized(&self) -> Result<bool> {
        let body = json!({
            "id": self.marker_id,
            "initializedBy": self.host_name,
            "timestampMs": now_ms(),
        });

        match self.store.create_item(&self.marker_id, body, None).await {
            Ok(_) => {
                info!(marker = %self.marker_id, host = %self.host_name, "Lease store marked initialized");
                Ok(true)
            }
            Err(StoreError::Conflict { .. }) => {
                debug!(marker = %self.marker_id, "Lease store already marked initialized");
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Try to become the initializing process.
    ///
    /// Returns `false` when another process holds the lock. The store expires
    /// the lock after `ttl`, which is the only recovery from a crashed holder.
    pub async fn acquire_initialization_lock(&self, ttl: Duration) -> Result<bool> {
        let body = json!({
            "id": self.lock_id,
            "owner": self.host_name,
            "timestampMs": now_ms(),
        });

        match self.store.create_item(&self.lock_id, body, Some(ttl)).await {
            Ok(item) => {
                *self.lock_tag.lock() = Some(item.concurrency_tag);
                debug!(lock = %self.lock_id, host = %self.host_name, ttl_ms = ttl.as_millis() as u64, "Acquired initialization lock");
                Ok(true)
            }
            Err(StoreError::Conflict { .. }) => {
                debug!(lock = %self.lock_id, host = %self.host_name, "Initialization lock is held elsewhere");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Release the initialization lock held by this process.
    ///
    /// Returns `false` when the lock expired and may now belong to someone
    /// else; the caller must not assume it still owns anything.
    pub async fn release_initialization_lock(&self) -> Result<bool> {
        let Some(tag) = self.lock_tag.lock().take() else {
            return Err(LeaseError::LockNotHeld.into());
        };

        match self.store.delete_item(&self.lock_id, Some(&tag)).await {
            Ok(()) => {
                debug!(lock = %self.lock_id, "Released initialization lock");
                Ok(true)
            }
            Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound { .. }) => {
                warn!(lock = %self.lock_id, host = %self.host_name, "Initialization lock expired before release");
                Ok(false)
            }
            Err(e) => {
                // Still ours as far as we know; keep the tag for a retry.
                *self.lock_tag.lock() = Some(tag);
                Err(e.into())
            }
        }
    }

    /// Whether this process believes it holds the lock.
    pub fn holds_lock(&self) -> bool {
        self.lock_tag.lock().is_some()
    }
}
