use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counter sink for the request pipeline. The exporter surface lives
/// outside the core; the admin API reads these through `snapshot`.
#[derive(Default)]
pub struct ProxyMetrics {
    pub total_requests: AtomicU64,
    pub blocked_requests: AtomicU64,
    pub bypassed_requests: AtomicU64,

    pub challenges_issued: AtomicU64,
    pub challenges_passed: AtomicU64,
    pub challenges_failed: AtomicU64,

    pub token_cache_hits: AtomicU64,
    pub token_cache_misses: AtomicU64,
    pub captcha_cache_hits: AtomicU64,
    pub captcha_cache_misses: AtomicU64,

    pub deduplicated_requests: AtomicU64,
    pub deduplication_savings: AtomicU64,

    pub upstream_errors: AtomicU64,
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub bypassed_requests: u64,
    pub challenges_issued: u64,
    pub challenges_passed: u64,
    pub challenges_failed: u64,
    pub token_cache_hits: u64,
    pub token_cache_misses: u64,
    pub captcha_cache_hits: u64,
    pub captcha_cache_misses: u64,
    pub deduplicated_requests: u64,
    pub deduplication_savings: u64,
    pub upstream_errors: u64,
}

impl ProxyMetrics {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_requests: load(&self.total_requests),
            blocked_requests: load(&self.blocked_requests),
            bypassed_requests: load(&self.bypassed_requests),
            challenges_issued: load(&self.challenges_issued),
            challenges_passed: load(&self.challenges_passed),
            challenges_failed: load(&self.challenges_failed),
            token_cache_hits: load(&self.token_cache_hits),
            token_cache_misses: load(&self.token_cache_misses),
            captcha_cache_hits: load(&self.captcha_cache_hits),
            captcha_cache_misses: load(&self.captcha_cache_misses),
            deduplicated_requests: load(&self.deduplicated_requests),
            deduplication_savings: load(&self.deduplication_savings),
            upstream_errors: load(&self.upstream_errors),
        }
    }
}
