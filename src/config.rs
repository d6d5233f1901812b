//! Configuration types for the change feed processor.

use crate::error::{Error, Result};
use crate::types::HostName;
use std::time::Duration;

/// Main configuration for a change feed processor host.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Identity written into the leases this host owns.
    pub host_name: HostName,

    /// Prefix shared by every document in the lease collection.
    pub lease_prefix: String,

    /// A lease not renewed for this long may be taken by another host.
    pub lease_expiration_interval: Duration,

    /// How often owned leases are renewed.
    pub lease_renew_interval: Duration,

    /// How often the host looks for leases to acquire.
    pub lease_acquire_interval: Duration,

    /// Delay before polling a partition again after an empty read.
    pub feed_poll_delay: Duration,

    /// Maximum number of changes per observer batch.
    pub max_items_per_batch: usize,

    /// Upper bound on partitions owned by this host. `None` = fair share only.
    pub max_partitions_per_host: Option<usize>,

    /// Checkpoint after every delivered batch.
    pub auto_checkpoint: bool,

    /// Conflict retries for renew, release and checkpoint writes.
    pub max_lease_update_retries: usize,

    /// Lease collection initialization settings.
    pub initialization: LeaseStoreConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            host_name: format!("host-{}", uuid::Uuid::new_v4()),
            lease_prefix: "changefeed".to_string(),
            lease_expiration_interval: Duration::from_secs(60),
            lease_renew_interval: Duration::from_secs(17),
            lease_acquire_interval: Duration::from_secs(13),
            feed_poll_delay: Duration::from_secs(5),
            max_items_per_batch: 100,
            max_partitions_per_host: None,
            auto_checkpoint: true,
            max_lease_update_retries: 5,
            initialization: LeaseStoreConfig::default(),
        }
    }
}

impl ProcessorConfig {
    /// Create a configuration for `host_name` with default timings.
    pub fn new(host_name: impl Into<HostName>) -> Self {
        Self {
            host_name: host_name.into(),
            ..Default::default()
        }
    }

    pub fn with_lease_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.lease_prefix = prefix.into();
        self
    }

    pub fn with_lease_expiration_interval(mut self, interval: Duration) -> Self {
        self.lease_expiration_interval = interval;
        self
    }

    pub fn with_lease_renew_interval(mut self, interval: Duration) -> Self {
        self.lease_renew_interval = interval;
        self
    }

    pub fn with_lease_acquire_interval(mut self, interval: Duration) -> Self {
        self.lease_acquire_interval = interval;
        self
    }

    pub fn with_feed_poll_delay(mut self, delay: Duration) -> Self {
        self.feed_poll_delay = delay;
        self
    }

    pub fn with_max_items_per_batch(mut self, max_items: usize) -> Self {
        self.max_items_per_batch = max_items;
        self
    }

    pub fn with_max_partitions_per_host(mut self, max: usize) -> Self {
        self.max_partitions_per_host = Some(max);
        self
    }

    /// Enable or disable checkpointing after every batch.
    pub fn with_auto_checkpoint(mut self, enabled: bool) -> Self {
        self.auto_checkpoint = enabled;
        self
    }

    pub fn with_max_lease_update_retries(mut self, retries: usize) -> Self {
        self.max_lease_update_retries = retries;
        self
    }

    pub fn with_initialization(mut self, initialization: LeaseStoreConfig) -> Self {
        self.initialization = initialization;
        self
    }

    /// Check the configuration for values the processor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.host_name.trim().is_empty() {
            return Err(Error::Config("host_name must not be empty".into()));
        }
        if self.lease_prefix.is_empty() {
            return Err(Error::Config("lease_prefix must not be empty".into()));
        }

        for (name, value) in [
            ("lease_expiration_interval", self.lease_expiration_interval),
            ("lease_renew_interval", self.lease_renew_interval),
            ("lease_acquire_interval", self.lease_acquire_interval),
            ("feed_poll_delay", self.feed_poll_delay),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be non-zero", name)));
            }
        }

        if self.lease_renew_interval >= self.lease_expiration_interval {
            return Err(Error::Config(format!(
                "lease_renew_interval ({:?}) must be shorter than lease_expiration_interval ({:?})",
                self.lease_renew_interval, self.lease_expiration_interval
            )));
        }
        if self.max_items_per_batch == 0 {
            return Err(Error::Config("max_items_per_batch must be at least 1".into()));
        }
        if self.max_partitions_per_host == Some(0) {
            return Err(Error::Config("max_partitions_per_host must be at least 1".into()));
        }

        self.initialization.validate()
    }
}

/// Lease collection initialization settings.
#[derive(Debug, Clone)]
pub struct LeaseStoreConfig {
    /// Store-side lifetime of the initialization lock.
    pub lock_ttl: Duration,

    /// Wait between checks while another process initializes.
    pub lock_wait_interval: Duration,
}

impl Default for LeaseStoreConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            lock_wait_interval: Duration::from_secs(1),
        }
    }
}

impl LeaseStoreConfig {
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_lock_wait_interval(mut self, interval: Duration) -> Self {
        self.lock_wait_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_ttl.is_zero() {
            return Err(Error::Config("lock_ttl must be non-zero".into()));
        }
        if self.lock_wait_interval.is_zero() {
            return Err(Error::Config("lock_wait_interval must be non-zero".into()));
        }
        Ok(())
    }
}
