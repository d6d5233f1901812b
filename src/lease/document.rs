//! Lease document persisted per partition.

use crate::error::{LeaseError, StoreError};
use crate::store::StoredItem;
use crate::types::{ConcurrencyTag, HostName, PartitionRangeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Separator between the lease prefix and the partition id in lease ids.
pub const LEASE_ID_SEPARATOR: &str = "..";

/// Ownership record for one partition's change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Item id, `<prefix>..<partitionId>`.
    pub id: String,

    /// Partition this lease covers.
    pub partition_id: PartitionRangeId,

    /// Current owner; `None` when released.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<HostName>,

    /// Position to resume the change feed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,

    /// Last acquire/renew/checkpoint, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,

    /// Free-form properties kept with the lease.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,

    /// Tag of the stored version this value was read from.
    #[serde(skip)]
    pub concurrency_tag: ConcurrencyTag,
}

impl Lease {
    /// A fresh, unowned lease for `partition_id`.
    pub fn new(prefix: &str, partition_id: impl Into<PartitionRangeId>, continuation_token: Option<String>) -> Self {
        let partition_id = partition_id.into();
        Self {
            id: lease_id(prefix, &partition_id),
            partition_id,
            owner: None,
            continuation_token,
            timestamp_ms: 0,
            properties: BTreeMap::new(),
            concurrency_tag: ConcurrencyTag::default(),
        }
    }

    /// Decode a stored item.
    pub fn from_item(item: StoredItem) -> Result<Self, LeaseError> {
        let mut lease: Lease = serde_json::from_value(item.body).map_err(|e| LeaseError::Corrupted {
            id: item.id.clone(),
            reason: e.to_string(),
        })?;

        if lease.id != item.id {
            return Err(LeaseError::Corrupted {
                id: item.id,
                reason: format!("body carries id '{}'", lease.id),
            });
        }

        lease.concurrency_tag = item.concurrency_tag;
        Ok(lease)
    }

    /// Encode as a store item body.
    pub fn to_body(&self) -> Result<Value, StoreError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Whether `host` currently owns this lease.
    pub fn is_owned_by(&self, host: &str) -> bool {
        self.owner.as_deref() == Some(host)
    }

    /// Whether the lease has no owner or its owner stopped renewing it.
    pub fn is_expired(&self, now_ms: u64, expiration: Duration) -> bool {
        match self.owner.as_deref() {
            None | Some("") => true,
            Some(_) => now_ms.saturating_sub(self.timestamp_ms) > expiration.as_millis() as u64,
        }
    }

    /// Whether `host` may take this lease without stealing it.
    pub fn is_available_to(&self, host: &str, now_ms: u64, expiration: Duration) -> bool {
        self.is_owned_by(host) || self.is_expired(now_ms, expiration)
    }
}

/// Lease id for a partition.
pub fn lease_id(prefix: &str, partition_id: &str) -> String {
    format!("{}{}{}", prefix, LEASE_ID_SEPARATOR, partition_id)
}
