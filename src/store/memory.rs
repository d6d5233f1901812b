//! In-process item store.
//!
//! Behaves like the remote store for the protocol's purposes: conflicting
//! creates, tag-checked writes, store-side TTL expiry. Faults and latency can
//! be injected per operation to exercise race and failure paths.

use super::{ItemStore, StoreResult, StoredItem};
use crate::error::StoreError;
use crate::types::ConcurrencyTag;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Store operation kinds, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Create,
    Read,
    Replace,
    Delete,
    List,
}

#[derive(Debug, Clone)]
struct MemoryItem {
    body: Value,
    tag: ConcurrencyTag,
    expires_at: Option<Instant>,
}

impl MemoryItem {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn to_stored(&self, id: &str) -> StoredItem {
        StoredItem {
            id: id.to_string(),
            body: self.body.clone(),
            concurrency_tag: self.tag.clone(),
        }
    }
}

/// Item store kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryItemStore {
    items: Mutex<HashMap<String, MemoryItem>>,
    faults: Mutex<HashMap<StoreOp, VecDeque<StoreError>>>,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryItemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `op` with `error` instead of executing it.
    pub fn fail_next(&self, op: StoreOp, error: StoreError) {
        self.faults.lock().entry(op).or_default().push_back(error);
    }

    /// Delay every operation by `latency` before it executes.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.items.lock().values().filter(|item| !item.is_expired(now)).count()
    }

    /// Whether the store holds no live items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn before(&self, op: StoreOp) -> StoreResult<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.faults.lock().get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        Ok(())
    }

    /// Drop `id` if its TTL elapsed, then return the live entry.
    fn live<'a>(items: &'a mut HashMap<String, MemoryItem>, id: &str) -> Option<&'a mut MemoryItem> {
        let now = Instant::now();
        if items.get(id).is_some_and(|item| item.is_expired(now)) {
            items.remove(id);
        }
        items.get_mut(id)
    }
}

#[async_trait]
impl ItemStore for InMemoryItemStore {
    async fn create_item(&self, id: &str, body: Value, ttl: Option<Duration>) -> StoreResult<StoredItem> {
        self.before(StoreOp::Create).await?;

        let mut items = self.items.lock();
        if Self::live(&mut items, id).is_some() {
            return Err(StoreError::Conflict { id: id.to_string() });
        }

        let item = MemoryItem {
            body,
            tag: ConcurrencyTag::generate(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        let stored = item.to_stored(id);
        items.insert(id.to_string(), item);
        Ok(stored)
    }

    async fn read_item(&self, id: &str) -> StoreResult<StoredItem> {
        self.before(StoreOp::Read).await?;

        let mut items = self.items.lock();
        Self::live(&mut items, id)
            .map(|item| item.to_stored(id))
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn replace_item(&self, id: &str, body: Value, if_match: &ConcurrencyTag) -> StoreResult<StoredItem> {
        self.before(StoreOp::Replace).await?;

        let mut items = self.items.lock();
        let item = Self::live(&mut items, id).ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        if &item.tag != if_match {
            return Err(StoreError::Conflict { id: id.to_string() });
        }

        item.body = body;
        item.tag = ConcurrencyTag::generate();
        Ok(item.to_stored(id))
    }

    async fn delete_item(&self, id: &str, if_match: Option<&ConcurrencyTag>) -> StoreResult<()> {
        self.before(StoreOp::Delete).await?;

        let mut items = self.items.lock();
        let item = Self::live(&mut items, id).ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        if if_match.is_some_and(|tag| tag != &item.tag) {
            return Err(StoreError::Conflict { id: id.to_string() });
        }

        items.remove(id);
        Ok(())
    }

    async fn list_items(&self, id_prefix: &str) -> StoreResult<Vec<StoredItem>> {
        self.before(StoreOp::List).await?;

        let now = Instant::now();
        let mut items = self.items.lock();
        items.retain(|_, item| !item.is_expired(now));

        let mut listed: Vec<StoredItem> = items
            .iter()
            .filter(|(id, _)| id.starts_with(id_prefix))
            .map(|(id, item)| item.to_stored(id))
            .collect();
        listed.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(listed)
    }
}
