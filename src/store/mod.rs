//! Durable item store abstraction.
//!
//! The lease machinery only needs create / read / conditional replace /
//! conditional delete / prefix listing over JSON items. Every operation
//! returns either the item or a tagged [`StoreError`]; `NotFound` and
//! `Conflict` are ordinary protocol outcomes, not failures.

mod memory;

pub use memory::{InMemoryItemStore, StoreOp};

use crate::error::StoreError;
use crate::types::ConcurrencyTag;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Result of a store operation.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// An item as persisted, with its current concurrency tag.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredItem {
    /// Item id, unique within the store.
    pub id: String,
    /// JSON body.
    pub body: Value,
    /// Tag that changes on every write.
    pub concurrency_tag: ConcurrencyTag,
}

/// Asynchronous item store with optimistic concurrency.
#[async_trait]
pub trait ItemStore: Send + Sync + std::fmt::Debug {
    /// Create an item. Fails with `Conflict` if the id already exists.
    ///
    /// With a `ttl` the store expires the item on its own.
    async fn create_item(&self, id: &str, body: Value, ttl: Option<Duration>) -> StoreResult<StoredItem>;

    /// Read an item. Fails with `NotFound` if it does not exist.
    async fn read_item(&self, id: &str) -> StoreResult<StoredItem>;

    /// Replace an item if its tag still equals `if_match`.
    ///
    /// Fails with `Conflict` on tag mismatch and `NotFound` if the item is gone.
    async fn replace_item(&self, id: &str, body: Value, if_match: &ConcurrencyTag) -> StoreResult<StoredItem>;

    /// Delete an item, conditioned on `if_match` when given.
    ///
    /// Fails with `Conflict` on tag mismatch and `NotFound` if the item is gone.
    async fn delete_item(&self, id: &str, if_match: Option<&ConcurrencyTag>) -> StoreResult<()>;

    /// List every item whose id starts with `id_prefix`.
    async fn list_items(&self, id_prefix: &str) -> StoreResult<Vec<StoredItem>>;
}
