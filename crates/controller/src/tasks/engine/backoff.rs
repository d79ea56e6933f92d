//! Per-object exponential retry delays

use dashmap::DashMap;
use std::time::Duration;

/// Tracks consecutive failures per object key.
///
/// The delay for the n-th consecutive failure is `base * 2^(n-1)`, capped at
/// `ceiling`. A successful reconcile resets the key.
#[derive(Debug)]
pub struct BackoffTracker {
    base: Duration,
    ceiling: Duration,
    failures: DashMap<String, u32>,
}

impl BackoffTracker {
    #[must_use]
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
            failures: DashMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut entry = self.failures.entry(key.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
        let exponent = (*entry - 1).min(31);
        let delay = self.base.saturating_mul(1u32 << exponent);
        delay.min(self.ceiling)
    }

    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    #[must_use]
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map_or(0, |v| *v)
    }

    /// Number of objects currently backing off
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.failures.len()
    }
}
