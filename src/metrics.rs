use serde::Serialize;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters for the cache adapter and the host.
#[derive(Debug, Default)]
pub struct Metrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub cache_stale: AtomicU64,
    pub stores: AtomicU64,
    pub store_failures: AtomicU64,
    pub rewrites: AtomicU64,
    pub fallbacks: AtomicU64,
    pub transforms: AtomicU64,
    pub trimmed: AtomicU64,
    pub errors: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_stale: u64,
    pub stores: u64,
    pub store_failures: u64,
    pub rewrites: u64,
    pub fallbacks: u64,
    pub transforms: u64,
    pub trimmed: u64,
    pub errors: u64,
}

impl MetricsSnapshot {
    /// Share of freshness checks answered from cache, in percent.
    pub fn hit_rate_percent(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses + self.cache_stale;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64 * 100.0
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            cache_stale: load(&self.cache_stale),
            stores: load(&self.stores),
            store_failures: load(&self.store_failures),
            rewrites: load(&self.rewrites),
            fallbacks: load(&self.fallbacks),
            transforms: load(&self.transforms),
            trimmed: load(&self.trimmed),
            errors: load(&self.errors),
        }
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        let s = self.snapshot();
        let counters: [(&str, &str, u64); 10] = [
            ("cache_hits_total", "Freshness checks answered by a fresh artifact", s.cache_hits),
            ("cache_misses_total", "Freshness checks with no artifact", s.cache_misses),
            ("cache_stale_total", "Artifacts evicted as expired or outdated", s.cache_stale),
            ("cache_stores_total", "Artifacts written to storage", s.stores),
            ("cache_store_failures_total", "Artifact writes that failed", s.store_failures),
            ("cache_rewrites_total", "Requests served from a cached artifact", s.rewrites),
            ("cache_fallbacks_total", "Redirects to the logical path after a probe failure", s.fallbacks),
            ("transforms_total", "Images run through the transform pipeline", s.transforms),
            ("cache_trimmed_total", "Artifacts deleted by trim sweeps", s.trimmed),
            ("errors_total", "Requests that ended in an error", s.errors),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP imagecache_{name} {help}");
            let _ = writeln!(out, "# TYPE imagecache_{name} counter");
            let _ = writeln!(out, "imagecache_{name} {value}");
        }
        out
    }
}
