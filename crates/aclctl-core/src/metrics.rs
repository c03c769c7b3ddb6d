//! Global atomic counters for aclctl.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when a worker pool drains).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    compiles: AtomicU64,
    cache_hits: AtomicU64,
    compile_failures: AtomicU64,
    deploys_succeeded: AtomicU64,
    deploys_rolled_back: AtomicU64,
    retries: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            compiles: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            compile_failures: AtomicU64::new(0),
            deploys_succeeded: AtomicU64::new(0),
            deploys_rolled_back: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// External compiler invoked.
    pub fn inc_compiles(&self) {
        self.compiles.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "compiles", "counter incremented");
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_hits", "counter incremented");
    }

    pub fn inc_compile_failures(&self) {
        self.compile_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "compile_failures", "counter incremented");
    }

    pub fn inc_deploys_succeeded(&self) {
        self.deploys_succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deploys_succeeded", "counter incremented");
    }

    pub fn inc_deploys_rolled_back(&self) {
        self.deploys_rolled_back.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deploys_rolled_back", "counter incremented");
    }

    /// Job put back for a transient failure or a busy device.
    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retries", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            compiles = self.compiles(),
            cache_hits = self.cache_hits(),
            compile_failures = self.compile_failures(),
            deploys_succeeded = self.deploys_succeeded(),
            deploys_rolled_back = self.deploys_rolled_back(),
            retries = self.retries(),
        );
    }

    pub fn compiles(&self) -> u64 {
        self.compiles.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn compile_failures(&self) -> u64 {
        self.compile_failures.load(Ordering::Relaxed)
    }

    pub fn deploys_succeeded(&self) -> u64 {
        self.deploys_succeeded.load(Ordering::Relaxed)
    }

    pub fn deploys_rolled_back(&self) -> u64 {
        self.deploys_rolled_back.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.compiles.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.compile_failures.store(0, Ordering::Relaxed);
        self.deploys_succeeded.store(0, Ordering::Relaxed);
        self.deploys_rolled_back.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_compiles();
        m.inc_compiles();
        m.inc_cache_hits();
        m.inc_retries();
        assert_eq!(m.compiles(), 2);
        assert_eq!(m.cache_hits(), 1);
        assert_eq!(m.retries(), 1);
        assert_eq!(m.deploys_succeeded(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_compile_failures();
        m.inc_deploys_succeeded();
        m.inc_deploys_rolled_back();
        m.reset();
        assert_eq!(m.compile_failures(), 0);
        assert_eq!(m.deploys_succeeded(), 0);
        assert_eq!(m.deploys_rolled_back(), 0);
    }
}
