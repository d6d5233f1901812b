//! Session consistency tracking and lease-based partition ownership for
//! change feed processing.
//!
//! This crate provides the coordination core that lets a fleet of readers
//! share a partitioned, replicated collection without a central coordinator:
//! - **Session tokens** merged per partition for read-your-writes consistency
//! - **Leases** with optimistic concurrency for exclusive partition ownership
//! - **Fault-isolated observers** for user code processing each partition
//!
//! # Features
//!
//! - Merge-on-write session token cache, safe under concurrent responses
//! - Split-aware token lookup along caller-supplied partition lineage
//! - One-time lease collection initialization behind a TTL lock
//! - Lease acquire / renew / release / checkpoint as conditional writes
//! - Fair-share lease balancing across live hosts
//! - Observer errors and panics surfaced as a single fault type
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use changefeed_core::testing::{ScriptedFeedSource, StaticRangeProvider};
//! use changefeed_core::{
//!     BoxError, ChangeFeedObserver, ChangeFeedProcessor, InMemoryItemStore, ObserverContext,
//!     ProcessorConfig,
//! };
//! use serde_json::Value;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl ChangeFeedObserver for Printer {
//!     async fn process_changes(&self, ctx: &ObserverContext, changes: &[Value]) -> Result<(), BoxError> {
//!         println!("partition {}: {} changes", ctx.partition_id(), changes.len());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProcessorConfig::new("host-a")
//!         .with_lease_prefix("orders")
//!         .with_lease_expiration_interval(Duration::from_secs(30));
//!
//!     let factory = || -> Arc<dyn ChangeFeedObserver> { Arc::new(Printer) };
//!     let processor = ChangeFeedProcessor::new(
//!         config,
//!         Arc::new(InMemoryItemStore::new()),
//!         Arc::new(StaticRangeProvider::new(["0", "1"])),
//!         Arc::new(ScriptedFeedSource::new()),
//!         Arc::new(factory),
//!     )?;
//!
//!     processor.start().await?;
//!     tokio::time::sleep(Duration::from_secs(60)).await;
//!     processor.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────────┐
//! │       request pipeline       │   │       ChangeFeedProcessor        │
//! └──────────────────────────────┘   └──────────────────────────────────┘
//!          │            ▲                   │                   │
//!   set_token()   apply_session_token()  Bootstrapper   PartitionController
//!          ▼            │                   │                   │
//! ┌──────────────────────────────┐   ┌─────────────┐ ┌──────────────────────┐
//! │       SessionContainer       │   │ LeaseStore  │ │ PartitionSupervisor  │
//! │ name → rid → range → token   │   │ marker/lock │ │ processor ║ renewer  │
//! └──────────────────────────────┘   └─────────────┘ └──────────────────────┘
//!                                          │                   │
//!                                          ▼                   ▼
//!                                   ┌──────────────────────────────────┐
//!                                   │   ItemStore (conditional writes) │
//!                                   └──────────────────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Session tokens**: the stored token for a partition is always the merge
//!   of every token observed for it, never a wholesale overwrite
//! - **Leases**: at most one owner at a time, enforced solely by the store's
//!   conditional writes; a lost race is an outcome, not an error
//! - **Initialization lock**: best effort with TTL recovery; marker creation
//!   is idempotent so a double initializer stays correct

pub mod config;
pub mod error;
pub mod lease;
pub mod metrics;
pub mod observer;
pub mod processor;
pub mod session;
pub mod store;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{LeaseStoreConfig, ProcessorConfig};
pub use error::{
    BoxError, Error, FeedError, LeaseError, ObserverFault, ResourceIdError, Result, SessionTokenError,
    StoreError,
};
pub use types::{headers, now_ms, ConcurrencyTag, HostName, PartitionRangeId};

// Re-export session types
pub use session::{
    CollectionRef, DocumentRequest, DocumentResponse, HeaderMap, RegionId, ResourceId, SessionContainer,
    SessionRequest, SessionResponse, SessionToken,
};

// Re-export store types
pub use store::{InMemoryItemStore, ItemStore, StoreOp, StoreResult, StoredItem};

// Re-export lease types
pub use lease::{
    Bootstrapper, Lease, LeaseManager, LeaseOutcome, LeaseRenewer, LeaseStore, LeaseStoreState,
    PartitionSynchronizer, RenewalEnd, SharedLease,
};

// Re-export observer types
pub use observer::{
    ChangeFeedObserver, Checkpointer, CloseReason, FaultIsolatingObserver, ObserverContext, ObserverFactory,
};

// Re-export processor types
pub use processor::{
    ChangeBatch, ChangeFeedProcessor, ChangeFeedSource, PartitionController, PartitionRangeProvider,
};

// Re-export metrics types
pub use metrics::{CoordinationMetrics, Counter, Gauge, LabeledCounter, MetricsSnapshot};
