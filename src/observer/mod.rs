//! Change feed observer capability.
//!
//! Users implement [`ChangeFeedObserver`] to receive the changes of each
//! partition this host owns. The processor never calls a user observer
//! directly: every call goes through [`FaultIsolatingObserver`], which turns
//! errors and panics into [`ObserverFault`](crate::error::ObserverFault).

mod decorator;

pub use decorator::FaultIsolatingObserver;

use crate::error::{BoxError, Result};
use crate::types::{HostName, PartitionRangeId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Why an observer is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    Unknown,
    /// The processor is stopping.
    Shutdown,
    /// Another host took the lease.
    LeaseLost,
    /// The lease or its partition no longer exists.
    LeaseGone,
    /// The observer itself failed.
    ObserverError,
    /// Reading the change feed failed.
    ReadError,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Unknown => "unknown",
            CloseReason::Shutdown => "shutdown",
            CloseReason::LeaseLost => "lease_lost",
            CloseReason::LeaseGone => "lease_gone",
            CloseReason::ObserverError => "observer_error",
            CloseReason::ReadError => "read_error",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records feed progress on behalf of an observer.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Persist `continuation_token` as the partition's resume position.
    async fn checkpoint(&self, continuation_token: &str) -> Result<()>;
}

/// Per-partition context handed to every observer call.
#[derive(Clone)]
pub struct ObserverContext {
    partition_id: PartitionRangeId,
    host_name: HostName,
    continuation: Arc<Mutex<Option<String>>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
}

impl ObserverContext {
    pub fn new(partition_id: impl Into<PartitionRangeId>, host_name: impl Into<HostName>) -> Self {
        Self {
            partition_id: partition_id.into(),
            host_name: host_name.into(),
            continuation: Arc::new(Mutex::new(None)),
            checkpointer: None,
        }
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Continuation token of the batch currently being processed.
    pub fn continuation(&self) -> Option<String> {
        self.continuation.lock().clone()
    }

    pub(crate) fn set_continuation(&self, continuation: Option<String>) {
        *self.continuation.lock() = continuation;
    }

    /// Checkpoint the current batch's continuation.
    ///
    /// Only needed when automatic checkpointing is disabled.
    pub async fn checkpoint(&self) -> Result<()> {
        let (Some(checkpointer), Some(continuation)) = (&self.checkpointer, self.continuation()) else {
            return Ok(());
        };
        checkpointer.checkpoint(&continuation).await
    }
}

impl fmt::Debug for ObserverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverContext")
            .field("partition_id", &self.partition_id)
            .field("host_name", &self.host_name)
            .field("continuation", &self.continuation())
            .finish()
    }
}

/// User callbacks for one partition's change feed.
#[async_trait]
pub trait ChangeFeedObserver: Send + Sync {
    /// Called once before the first batch.
    async fn open(&self, _ctx: &ObserverContext) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Called exactly once after processing stops, if `open` succeeded.
    async fn close(&self, _ctx: &ObserverContext, _reason: CloseReason) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Handle one non-empty batch of changes.
    async fn process_changes(&self, ctx: &ObserverContext, changes: &[Value]) -> std::result::Result<(), BoxError>;
}

/// Creates one observer per owned partition.
pub trait ObserverFactory: Send + Sync {
    fn create(&self) -> Arc<dyn ChangeFeedObserver>;
}

impl<F> ObserverFactory for F
where
    F: Fn() -> Arc<dyn ChangeFeedObserver> + Send + Sync,
{
    fn create(&self) -> Arc<dyn ChangeFeedObserver> {
        self()
    }
}
