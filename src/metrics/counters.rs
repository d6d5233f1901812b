//! Monotonic counters.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            value: AtomicU64::new(0),
        }
    }

    /// Metric name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Increment by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `n`.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter split by a single label (e.g. close reason).
#[derive(Debug)]
pub struct LabeledCounter {
    name: &'static str,
    label: &'static str,
    values: DashMap<String, AtomicU64>,
}

impl LabeledCounter {
    /// Create a new labeled counter.
    pub fn new(name: &'static str, label: &'static str) -> Self {
        Self {
            name,
            label,
            values: DashMap::new(),
        }
    }

    /// Metric name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Label name.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Increment the series for `value` by 1.
    pub fn inc(&self, value: &str) {
        if let Some(counter) = self.values.get(value) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.values
            .entry(value.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of the series for `value`.
    pub fn get(&self, value: &str) -> u64 {
        self.values
            .get(value)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// All series, sorted by label value.
    pub fn get_all(&self) -> Vec<(String, u64)> {
        let mut all: Vec<_> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        all.sort();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("leases_acquired_total");
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
        assert_eq!(counter.name(), "leases_acquired_total");
    }

    #[test]
    fn test_labeled_counter() {
        let counter = LabeledCounter::new("observer_closed_total", "reason");

        counter.inc("lease_lost");
        counter.inc("lease_lost");
        counter.inc("shutdown");

        assert_eq!(counter.get("lease_lost"), 2);
        assert_eq!(counter.get("shutdown"), 1);
        assert_eq!(counter.get("lease_gone"), 0);
        assert_eq!(
            counter.get_all(),
            vec![("lease_lost".to_string(), 2), ("shutdown".to_string(), 1)]
        );
    }
}
