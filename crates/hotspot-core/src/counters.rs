//! Named monotonic counters (`payment.webhook.duplicate`,
//! `policy.mismatch.address_list`, `usage_sync.lock.degraded`, ...).
//!
//! Values are kept in-process so the status endpoint and tests can read them.
//! With the `metrics` feature every increment is also forwarded to an
//! `OpenTelemetry` counter of the same name.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Cloneable handle to a shared counter registry.
#[derive(Clone, Default)]
pub struct Counters {
    values: Arc<DashMap<String, AtomicU64>>,
    #[cfg(feature = "metrics")]
    instruments: Arc<DashMap<String, opentelemetry::metrics::Counter<u64>>>,
}

impl std::fmt::Debug for Counters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, n: u64) {
        if n == 0 {
            return;
        }
        if let Some(value) = self.values.get(name) {
            value.fetch_add(n, Ordering::Relaxed);
        } else {
            self.values
                .entry(name.to_string())
                .or_default()
                .fetch_add(n, Ordering::Relaxed);
        }

        #[cfg(feature = "metrics")]
        self.forward(name, n);
    }

    pub fn get(&self, name: &str) -> u64 {
        self.values
            .get(name)
            .map_or(0, |v| v.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.values
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect()
    }

    #[cfg(feature = "metrics")]
    fn forward(&self, name: &str, n: u64) {
        let counter = self
            .instruments
            .entry(name.to_string())
            .or_insert_with(|| {
                opentelemetry::global::meter("hotspotd")
                    .u64_counter(name.to_string())
                    .build()
            })
            .clone();
        counter.add(n, &[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_are_shared_between_clones() {
        let counters = Counters::new();
        let other = counters.clone();
        counters.incr("payment.webhook.duplicate");
        other.add("payment.webhook.duplicate", 2);
        assert_eq!(counters.get("payment.webhook.duplicate"), 3);
        assert_eq!(counters.get("never.touched"), 0);
    }

    #[test]
    fn zero_add_does_not_create_entry() {
        let counters = Counters::new();
        counters.add("policy.mismatch.binding", 0);
        assert!(counters.snapshot().is_empty());
    }
}
