//! Test doubles for the processor's collaborators.

use crate::error::{BoxError, FeedError, Result};
use crate::observer::{ChangeFeedObserver, CloseReason, ObserverContext, ObserverFactory};
use crate::processor::{ChangeBatch, ChangeFeedSource, PartitionRangeProvider};
use crate::types::PartitionRangeId;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Observer that records every call and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    opens: AtomicUsize,
    closes: Mutex<Vec<CloseReason>>,
    batches: Mutex<Vec<Vec<Value>>>,
    partitions: Mutex<Vec<PartitionRangeId>>,
    open_error: Mutex<Option<String>>,
    process_error: Mutex<Option<String>>,
    panic_on_process: AtomicBool,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `open` fail with `message`.
    pub fn fail_open_with(&self, message: &str) {
        *self.open_error.lock() = Some(message.to_string());
    }

    /// Make every `process_changes` fail with `message`.
    pub fn fail_process_with(&self, message: &str) {
        *self.process_error.lock() = Some(message.to_string());
    }

    /// Make every `process_changes` panic.
    pub fn panic_on_process(&self) {
        self.panic_on_process.store(true, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Close reasons in call order.
    pub fn closes(&self) -> Vec<CloseReason> {
        self.closes.lock().clone()
    }

    /// Partitions this observer was opened for.
    pub fn partitions(&self) -> Vec<PartitionRangeId> {
        self.partitions.lock().clone()
    }

    pub fn batches(&self) -> Vec<Vec<Value>> {
        self.batches.lock().clone()
    }

    /// Total number of changes delivered.
    pub fn processed_items(&self) -> usize {
        self.batches.lock().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl ChangeFeedObserver for RecordingObserver {
    async fn open(&self, ctx: &ObserverContext) -> std::result::Result<(), BoxError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.partitions.lock().push(ctx.partition_id().to_string());
        let error = self.open_error.lock().clone();
        match error {
            Some(message) => Err(message.into()),
            None => Ok(()),
        }
    }

    async fn close(&self, _ctx: &ObserverContext, reason: CloseReason) -> std::result::Result<(), BoxError> {
        self.closes.lock().push(reason);
        Ok(())
    }

    async fn process_changes(&self, _ctx: &ObserverContext, changes: &[Value]) -> std::result::Result<(), BoxError> {
        if self.panic_on_process.load(Ordering::SeqCst) {
            panic!("observer asked to panic on {} changes", changes.len());
        }
        let error = self.process_error.lock().clone();
        if let Some(message) = error {
            return Err(message.into());
        }
        self.batches.lock().push(changes.to_vec());
        Ok(())
    }
}

/// Factory handing out a fresh [`RecordingObserver`] per partition and
/// keeping every one it created.
#[derive(Debug, Default)]
pub struct RecordingObserverFactory {
    created: Mutex<Vec<Arc<RecordingObserver>>>,
}

impl RecordingObserverFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observers(&self) -> Vec<Arc<RecordingObserver>> {
        self.created.lock().clone()
    }

    /// Close reasons across every observer created so far.
    pub fn all_closes(&self) -> Vec<(PartitionRangeId, CloseReason)> {
        self.observers()
            .iter()
            .flat_map(|observer| {
                let partition = observer.partitions().first().cloned().unwrap_or_default();
                observer
                    .closes()
                    .into_iter()
                    .map(move |reason| (partition.clone(), reason))
            })
            .collect()
    }
}

impl ObserverFactory for RecordingObserverFactory {
    fn create(&self) -> Arc<dyn ChangeFeedObserver> {
        let observer = Arc::new(RecordingObserver::new());
        self.created.lock().push(observer.clone());
        observer
    }
}

/// Change feed source replaying scripted reads per partition.
///
/// Once a partition's script runs out, every read returns an empty batch at
/// the requested continuation. `max_items` is not enforced.
#[derive(Debug, Default)]
pub struct ScriptedFeedSource {
    scripts: Mutex<HashMap<PartitionRangeId, VecDeque<std::result::Result<ChangeBatch, FeedError>>>>,
    seen: Mutex<HashMap<PartitionRangeId, Vec<Option<String>>>>,
}

impl ScriptedFeedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&self, partition_id: &str, items: Vec<Value>, continuation: &str) {
        self.push(partition_id, Ok(ChangeBatch::new(items, continuation)));
    }

    pub fn push_error(&self, partition_id: &str, error: FeedError) {
        self.push(partition_id, Err(error));
    }

    fn push(&self, partition_id: &str, read: std::result::Result<ChangeBatch, FeedError>) {
        self.scripts
            .lock()
            .entry(partition_id.to_string())
            .or_default()
            .push_back(read);
    }

    /// Continuations passed to every read of `partition_id`, in order.
    pub fn continuations_seen(&self, partition_id: &str) -> Vec<Option<String>> {
        self.seen.lock().get(partition_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ChangeFeedSource for ScriptedFeedSource {
    async fn read_changes(
        &self,
        partition_id: &str,
        continuation: Option<&str>,
        _max_items: usize,
    ) -> std::result::Result<ChangeBatch, FeedError> {
        self.seen
            .lock()
            .entry(partition_id.to_string())
            .or_default()
            .push(continuation.map(str::to_string));

        let next = self
            .scripts
            .lock()
            .get_mut(partition_id)
            .and_then(VecDeque::pop_front);

        next.unwrap_or_else(|| {
            Ok(ChangeBatch {
                items: Vec::new(),
                continuation: continuation.map(str::to_string),
            })
        })
    }
}

/// Partition listing with a fixed set of ranges.
#[derive(Debug, Default)]
pub struct StaticRangeProvider {
    ranges: Mutex<Vec<PartitionRangeId>>,
}

impl StaticRangeProvider {
    pub fn new<I, S>(ranges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PartitionRangeId>,
    {
        Self {
            ranges: Mutex::new(ranges.into_iter().map(Into::into).collect()),
        }
    }

    /// Replace the reported ranges, e.g. after a split.
    pub fn set_ranges<I, S>(&self, ranges: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<PartitionRangeId>,
    {
        *self.ranges.lock() = ranges.into_iter().map(Into::into).collect();
    }
}

#[async_trait]
impl PartitionRangeProvider for StaticRangeProvider {
    async fn partition_ranges(&self) -> Result<Vec<PartitionRangeId>> {
        Ok(self.ranges.lock().clone())
    }
}
