//! Fault isolation around user observers.

use super::{ChangeFeedObserver, CloseReason, ObserverContext};
use crate::error::{BoxError, ObserverFault};
use crate::metrics::CoordinationMetrics;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::warn;

/// Wraps a user observer so that every failure, including a panic, comes
/// back as an [`ObserverFault`] instead of unwinding into the processor.
pub struct FaultIsolatingObserver {
    inner: Arc<dyn ChangeFeedObserver>,
    metrics: Arc<CoordinationMetrics>,
}

enum Phase {
    Open,
    Close,
    ProcessChanges,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::Open => "open",
            Phase::Close => "close",
            Phase::ProcessChanges => "process_changes",
        }
    }

    fn fault(&self, partition_id: &str, message: String) -> ObserverFault {
        let partition_id = partition_id.to_string();
        match self {
            Phase::Open => ObserverFault::Open { partition_id, message },
            Phase::Close => ObserverFault::Close { partition_id, message },
            Phase::ProcessChanges => ObserverFault::ProcessChanges { partition_id, message },
        }
    }
}

impl FaultIsolatingObserver {
    pub fn new(inner: Arc<dyn ChangeFeedObserver>, metrics: Arc<CoordinationMetrics>) -> Self {
        Self { inner, metrics }
    }

    pub async fn open(&self, ctx: &ObserverContext) -> Result<(), ObserverFault> {
        self.guard(Phase::Open, ctx, self.inner.open(ctx)).await
    }

    pub async fn close(&self, ctx: &ObserverContext, reason: CloseReason) -> Result<(), ObserverFault> {
        self.metrics.observer_closes.inc(reason.as_str());
        self.guard(Phase::Close, ctx, self.inner.close(ctx, reason)).await
    }

    pub async fn process_changes(&self, ctx: &ObserverContext, changes: &[Value]) -> Result<(), ObserverFault> {
        self.guard(Phase::ProcessChanges, ctx, self.inner.process_changes(ctx, changes))
            .await
    }

    async fn guard<F>(&self, phase: Phase, ctx: &ObserverContext, call: F) -> Result<(), ObserverFault>
    where
        F: Future<Output = Result<(), BoxError>>,
    {
        let message = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };

        self.metrics.observer_faults.inc();
        warn!(
            partition = %ctx.partition_id(),
            phase = phase.as_str(),
            error = %message,
            "Observer failed"
        );
        Err(phase.fault(ctx.partition_id(), message))
    }
}

impl std::fmt::Debug for FaultIsolatingObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultIsolatingObserver").finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Faulty;

    #[async_trait]
    impl ChangeFeedObserver for Faulty {
        async fn open(&self, _ctx: &ObserverContext) -> Result<(), BoxError> {
            Err("cannot connect downstream".into())
        }

        async fn close(&self, _ctx: &ObserverContext, _reason: CloseReason) -> Result<(), BoxError> {
            panic!("close exploded");
        }

        async fn process_changes(&self, _ctx: &ObserverContext, changes: &[Value]) -> Result<(), BoxError> {
            if changes.len() > 1 {
                tokio::task::yield_now().await;
                panic!("{} changes is too many", changes.len());
            }
            Ok(())
        }
    }

    fn wrapped() -> (FaultIsolatingObserver, Arc<CoordinationMetrics>) {
        let metrics = Arc::new(CoordinationMetrics::new());
        (FaultIsolatingObserver::new(Arc::new(Faulty), metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn test_error_becomes_fault() {
        let (observer, metrics) = wrapped();
        let ctx = ObserverContext::new("4", "host-a");

        let fault = observer.open(&ctx).await.unwrap_err();
        assert_eq!(
            fault,
            ObserverFault::Open {
                partition_id: "4".into(),
                message: "cannot connect downstream".into(),
            }
        );
        assert_eq!(metrics.observer_faults.get(), 1);
    }

    #[tokio::test]
    async fn test_panic_in_close_is_contained() {
        let (observer, metrics) = wrapped();
        let ctx = ObserverContext::new("4", "host-a");

        let fault = observer.close(&ctx, CloseReason::LeaseLost).await.unwrap_err();
        assert!(matches!(fault, ObserverFault::Close { ref message, .. } if message.contains("close exploded")));
        assert_eq!(metrics.observer_closes.get("lease_lost"), 1);
    }

    #[tokio::test]
    async fn test_panic_after_await_is_contained() {
        let (observer, _) = wrapped();
        let ctx = ObserverContext::new("4", "host-a");

        observer.process_changes(&ctx, &[json!(1)]).await.unwrap();
        let fault = observer
            .process_changes(&ctx, &[json!(1), json!(2)])
            .await
            .unwrap_err();
        assert!(matches!(fault, ObserverFault::ProcessChanges { ref message, .. } if message.contains("2 changes")));
    }
}
