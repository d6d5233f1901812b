//! Testing utilities for change feed processing.
//!
//! This module provides in-process stand-ins for the processor's external
//! collaborators, so the whole lease protocol can run inside one test:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     ChangeFeedProcessor                      │
//! │                                                              │
//! │   ItemStore ◄──────────── InMemoryItemStore (store module)   │
//! │   PartitionRangeProvider ◄ StaticRangeProvider               │
//! │   ChangeFeedSource ◄────── ScriptedFeedSource                │
//! │   ObserverFactory ◄─────── RecordingObserverFactory          │
//! │                              └─ RecordingObserver            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use changefeed_core::testing::{RecordingObserverFactory, ScriptedFeedSource, StaticRangeProvider};
//! use changefeed_core::{ChangeFeedProcessor, InMemoryItemStore, ProcessorConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> changefeed_core::Result<()> {
//! let source = Arc::new(ScriptedFeedSource::new());
//! source.push_batch("0", vec![json!({"id": "a"})], "1");
//!
//! let observers = Arc::new(RecordingObserverFactory::new());
//! let processor = ChangeFeedProcessor::new(
//!     ProcessorConfig::new("host-a"),
//!     Arc::new(InMemoryItemStore::new()),
//!     Arc::new(StaticRangeProvider::new(["0"])),
//!     source,
//!     observers.clone(),
//! )?;
//!
//! processor.start().await?;
//! // ...
//! processor.stop().await;
//! # Ok(())
//! # }
//! ```

mod doubles;


pub use doubles::{RecordingObserver, RecordingObserverFactory, ScriptedFeedSource, StaticRangeProvider};

use std::time::Duration;

/// Poll `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn wait_until<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_until() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = flag.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            setter.store(true, Ordering::Relaxed);
        });

        assert!(wait_until(|| flag.load(Ordering::Relaxed), Duration::from_millis(500)).await);
        assert!(!wait_until(|| false, Duration::from_millis(30)).await);
    }
}
