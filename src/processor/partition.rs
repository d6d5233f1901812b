//! Read loop for one owned partition.

use super::source::ChangeFeedSource;
use crate::error::{Error, FeedError, LeaseError, ObserverFault, Result};
use crate::lease::{LeaseManager, SharedLease};
use crate::observer::{Checkpointer, FaultIsolatingObserver, ObserverContext};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Writes checkpoints into the owned lease.
#[derive(Debug)]
pub struct LeaseCheckpointer {
    manager: Arc<LeaseManager>,
    lease: SharedLease,
}

impl LeaseCheckpointer {
    pub fn new(manager: Arc<LeaseManager>, lease: SharedLease) -> Self {
        Self { manager, lease }
    }
}

#[async_trait]
impl Checkpointer for LeaseCheckpointer {
    async fn checkpoint(&self, continuation_token: &str) -> Result<()> {
        let current = self.lease.get();
        let updated = self
            .manager
            .checkpoint(&current, continuation_token)
            .await?
            .into_result(&current.partition_id)?;
        self.lease.set(updated);
        Ok(())
    }
}

/// Why a partition's read loop stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingEnd {
    Cancelled,
    LeaseLost,
    /// The partition or its lease no longer exists.
    LeaseGone,
    Observer(ObserverFault),
    Read(FeedError),
}

/// Settings for one partition's read loop.
#[derive(Debug, Clone)]
pub struct PartitionSettings {
    pub poll_delay: Duration,
    pub max_items_per_batch: usize,
    pub auto_checkpoint: bool,
}

/// Feeds one partition's changes to its observer until told to stop.
pub struct PartitionProcessor {
    source: Arc<dyn ChangeFeedSource>,
    observer: Arc<FaultIsolatingObserver>,
    ctx: ObserverContext,
    checkpointer: Arc<dyn Checkpointer>,
    settings: PartitionSettings,
    continuation: Option<String>,
}

impl PartitionProcessor {
    pub fn new(
        source: Arc<dyn ChangeFeedSource>,
        observer: Arc<FaultIsolatingObserver>,
        ctx: ObserverContext,
        checkpointer: Arc<dyn Checkpointer>,
        settings: PartitionSettings,
        start_from: Option<String>,
    ) -> Self {
        Self {
            source,
            observer,
            ctx,
            checkpointer,
            settings,
            continuation: start_from,
        }
    }

    /// Read and deliver batches until cancelled or a terminal condition.
    ///
    /// A batch handed to the observer is always finished and checkpointed,
    /// even if cancellation arrives meanwhile.
    pub async fn run(mut self, cancel: CancellationToken) -> ProcessingEnd {
        let partition = self.ctx.partition_id().to_string();

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return ProcessingEnd::Cancelled,
                read = self.source.read_changes(
                    &partition,
                    self.continuation.as_deref(),
                    self.settings.max_items_per_batch,
                ) => read,
            };

            let delay = match read {
                Ok(batch) if batch.is_empty() => {
                    if batch.continuation.is_some() {
                        self.continuation = batch.continuation;
                    }
                    Some(self.settings.poll_delay)
                }
                Ok(batch) => {
                    self.ctx.set_continuation(batch.continuation.clone());
                    debug!(partition = %partition, items = batch.items.len(), "Delivering changes");

                    if let Err(fault) = self.observer.process_changes(&self.ctx, &batch.items).await {
                        return ProcessingEnd::Observer(fault);
                    }

                    if let Some(continuation) = batch.continuation {
                        if self.settings.auto_checkpoint {
                            if let Some(end) = self.checkpoint(&partition, &continuation).await {
                                return end;
                            }
                        }
                        self.continuation = Some(continuation);
                    }
                    None
                }
                Err(FeedError::PartitionGone(reason)) => {
                    debug!(partition = %partition, reason = %reason, "Partition is gone");
                    return ProcessingEnd::LeaseGone;
                }
                Err(FeedError::Throttled { retry_after }) => {
                    debug!(partition = %partition, retry_after_ms = retry_after.as_millis() as u64, "Feed read throttled");
                    Some(retry_after)
                }
                Err(e) => {
                    warn!(partition = %partition, error = %e, "Feed read failed");
                    return ProcessingEnd::Read(e);
                }
            };

            if let Some(delay) = delay {
                tokio::select! {
                    _ = cancel.cancelled() => return ProcessingEnd::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    async fn checkpoint(&self, partition: &str, continuation: &str) -> Option<ProcessingEnd> {
        match self.checkpointer.checkpoint(continuation).await {
            Ok(()) => None,
            Err(Error::Lease(LeaseError::Lost { .. })) => Some(ProcessingEnd::LeaseLost),
            Err(Error::Lease(LeaseError::Gone { .. })) => Some(ProcessingEnd::LeaseGone),
            Err(e) => {
                // The next batch checkpoints past this one anyway.
                warn!(partition = %partition, error = %e, "Checkpoint failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::lease::Lease;
    use crate::metrics::CoordinationMetrics;
    use crate::store::{InMemoryItemStore, StoreOp};
    use crate::testing::{RecordingObserver, ScriptedFeedSource};
    use serde_json::json;

    struct Harness {
        store: Arc<InMemoryItemStore>,
        manager: Arc<LeaseManager>,
        lease: SharedLease,
        source: Arc<ScriptedFeedSource>,
        observer: Arc<RecordingObserver>,
    }

    impl Harness {
        async fn new() -> Self {
            let store = Arc::new(InMemoryItemStore::new());
            let manager = Arc::new(LeaseManager::new(store.clone(), "feed", "host-a", Duration::from_secs(60)));
            let lease = manager.create_lease_if_not_exists("0", None).await.unwrap().unwrap();
            let lease: Lease = manager.acquire(&lease).await.unwrap().into_lease().unwrap();
            Self {
                store,
                manager,
                lease: SharedLease::new(lease),
                source: Arc::new(ScriptedFeedSource::new()),
                observer: Arc::new(RecordingObserver::new()),
            }
        }

        fn processor(&self, auto_checkpoint: bool) -> PartitionProcessor {
            let checkpointer = Arc::new(LeaseCheckpointer::new(self.manager.clone(), self.lease.clone()));
            let observer = Arc::new(FaultIsolatingObserver::new(
                self.observer.clone(),
                Arc::new(CoordinationMetrics::new()),
            ));
            PartitionProcessor::new(
                self.source.clone(),
                observer,
                ObserverContext::new("0", "host-a").with_checkpointer(checkpointer.clone()),
                checkpointer,
                PartitionSettings {
                    poll_delay: Duration::from_secs(5),
                    max_items_per_batch: 10,
                    auto_checkpoint,
                },
                self.lease.get().continuation_token,
            )
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_batches_and_checkpoints() {
        let h = Harness::new().await;
        h.source.push_batch("0", vec![json!(1), json!(2)], "c1");
        h.source.push_batch("0", vec![], "c1");
        h.source.push_batch("0", vec![json!(3)], "c2");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.processor(true).run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(6)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), ProcessingEnd::Cancelled);
        assert_eq!(h.observer.processed_items(), 3);
        assert_eq!(h.lease.get().continuation_token.as_deref(), Some("c2"));
        assert_eq!(
            h.source.continuations_seen("0"),
            vec![None, Some("c1".into()), Some("c1".into()), Some("c2".into())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_auto_checkpoint_lease_is_untouched() {
        let h = Harness::new().await;
        h.source.push_batch("0", vec![json!(1)], "c1");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.processor(false).run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), ProcessingEnd::Cancelled);
        assert_eq!(h.observer.processed_items(), 1);
        assert!(h.lease.get().continuation_token.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_waits_retry_after() {
        let h = Harness::new().await;
        h.source.push_error("0", FeedError::Throttled { retry_after: Duration::from_secs(30) });
        h.source.push_batch("0", vec![json!(1)], "c1");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.processor(true).run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(h.observer.processed_items(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.observer.processed_items(), 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_terminal_conditions() {
        let h = Harness::new().await;
        h.source.push_error("0", FeedError::PartitionGone("split".into()));
        assert_eq!(h.processor(true).run(CancellationToken::new()).await, ProcessingEnd::LeaseGone);

        h.source.push_error("0", FeedError::Other("bad gateway".into()));
        assert!(matches!(
            h.processor(true).run(CancellationToken::new()).await,
            ProcessingEnd::Read(FeedError::Other(_))
        ));

        h.observer.fail_process_with("downstream rejected batch");
        h.source.push_batch("0", vec![json!(1)], "c1");
        assert!(matches!(
            h.processor(true).run(CancellationToken::new()).await,
            ProcessingEnd::Observer(ObserverFault::ProcessChanges { .. })
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_on_stolen_lease_ends_processing() {
        let h = Harness::new().await;
        let thief = LeaseManager::new(h.store.clone(), "feed", "host-b", Duration::from_millis(0));
        tokio::time::sleep(Duration::from_millis(5)).await;
        thief.acquire(&h.lease.get()).await.unwrap().into_lease().unwrap();

        h.source.push_batch("0", vec![json!(1)], "c1");
        assert_eq!(h.processor(true).run(CancellationToken::new()).await, ProcessingEnd::LeaseLost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_store_error_is_tolerated() {
        let h = Harness::new().await;
        h.store.fail_next(StoreOp::Replace, StoreError::Unavailable("503".into()));
        h.source.push_batch("0", vec![json!(1)], "c1");
        h.source.push_batch("0", vec![json!(2)], "c2");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.processor(true).run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), ProcessingEnd::Cancelled);
        assert_eq!(h.observer.processed_items(), 2);
        assert_eq!(h.lease.get().continuation_token.as_deref(), Some("c2"));
    }
}
