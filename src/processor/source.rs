//! Collaborators the processor reads from.

use crate::error::{FeedError, Result};
use crate::lease::{LeaseManager, PartitionSynchronizer};
use crate::types::PartitionRangeId;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// One page of changes from a partition's feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    /// Changes in feed order.
    pub items: Vec<Value>,
    /// Position after the last item; resume from here next time.
    pub continuation: Option<String>,
}

impl ChangeBatch {
    /// A batch that ends at `continuation`.
    pub fn new(items: Vec<Value>, continuation: impl Into<String>) -> Self {
        Self {
            items,
            continuation: Some(continuation.into()),
        }
    }

    /// Whether the batch carries no changes.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Reads a partition's change feed.
#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    /// Read up to `max_items` changes after `continuation`, or from the
    /// beginning when it is `None`.
    async fn read_changes(
        &self,
        partition_id: &str,
        continuation: Option<&str>,
        max_items: usize,
    ) -> std::result::Result<ChangeBatch, FeedError>;
}

/// Lists the partitions of the monitored collection.
#[async_trait]
pub trait PartitionRangeProvider: Send + Sync {
    async fn partition_ranges(&self) -> Result<Vec<PartitionRangeId>>;
}

/// Creates a lease for every partition the provider reports.
pub struct LeaseSynchronizer {
    ranges: Arc<dyn PartitionRangeProvider>,
    leases: Arc<LeaseManager>,
}

impl LeaseSynchronizer {
    pub fn new(ranges: Arc<dyn PartitionRangeProvider>, leases: Arc<LeaseManager>) -> Self {
        Self { ranges, leases }
    }
}

#[async_trait]
impl PartitionSynchronizer for LeaseSynchronizer {
    async fn create_missing_leases(&self) -> Result<usize> {
        let mut created = 0;
        for partition_id in self.ranges.partition_ranges().await? {
            if self.leases.create_lease_if_not_exists(&partition_id, None).await?.is_some() {
                created += 1;
            }
        }
        debug!(created, "Synchronized partition leases");
        Ok(created)
    }
}
