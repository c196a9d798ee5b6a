use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::{HeaderMap, Method};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::helpers::current_ts;

pub const DEFAULT_MAX_PENDING: usize = 10_000;
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub type RequestKey = String;

/// Buffered upstream response shared with every waiter.
#[derive(Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub completed_at: u64,
}

struct PendingRequest {
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    response: RwLock<Option<Arc<CachedResponse>>>,
    waiters: AtomicUsize,
}

impl PendingRequest {
    fn new() -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            done_tx,
            done_rx,
            response: RwLock::new(None),
            waiters: AtomicUsize::new(0),
        }
    }
}

/// Outcome of waiting on an in-flight request. Timeout and
/// producer-cancellation are distinct; both mean the caller proceeds
/// with its own upstream call.
pub enum WaitOutcome {
    /// No pending entry for the key; the caller should `start` one.
    NoPending,
    Completed(Arc<CachedResponse>),
    Cancelled,
    TimedOut,
}

pub enum StartOutcome {
    Started,
    /// Another request registered the key between `wait` and `start`.
    AlreadyPending,
    /// Capacity reached; the caller proceeds without deduplication.
    Overflow,
}

#[derive(Serialize)]
pub struct DedupStats {
    pub enabled: bool,
    pub pending_count: usize,
    pub max_pending: usize,
}

/// Coalesces concurrent idempotent requests with an identical
/// cacheable surface into one upstream call. The pending map takes a
/// writer lock only for insert/remove; completion is broadcast
/// through a per-entry one-shot channel so any number of waiters can
/// observe it without touching the map.
pub struct Deduplicator {
    pending: RwLock<HashMap<RequestKey, Arc<PendingRequest>>>,
    enabled: bool,
    max_pending: usize,
    wait_timeout: Duration,
}

impl Deduplicator {
    pub fn new(enabled: bool) -> Self {
        Self::with_limits(enabled, DEFAULT_MAX_PENDING, DEFAULT_WAIT_TIMEOUT)
    }

    pub fn with_limits(enabled: bool, max_pending: usize, wait_timeout: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            enabled,
            max_pending,
            wait_timeout,
        }
    }

    /// Only idempotent, user-agnostic requests are eligible.
    pub fn should_dedupe(&self, method: &Method, headers: &HeaderMap) -> bool {
        if !self.enabled {
            return false;
        }
        if method != Method::GET && method != Method::HEAD {
            return false;
        }
        if headers.contains_key("authorization") {
            return false;
        }
        if headers.contains_key("cookie") {
            return false;
        }
        true
    }

    pub fn key(
        &self,
        method: &Method,
        host: &str,
        path: &str,
        raw_query: &str,
        headers: &HeaderMap,
    ) -> RequestKey {
        let mut hasher = Sha256::new();
        hasher.update(method.as_str().as_bytes());
        hasher.update(host.as_bytes());
        hasher.update(path.as_bytes());
        hasher.update(raw_query.as_bytes());
        for name in ["accept", "accept-encoding", "accept-language"] {
            if let Some(value) = headers.get(name) {
                hasher.update(value.as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Join an in-flight request, blocking until completion or the
    /// wait cap. A waiter that joins before `complete` observes the
    /// shared response; one that arrives after the removal sees
    /// `NoPending` and proceeds as a fresh request.
    pub async fn wait(&self, key: &str) -> WaitOutcome {
        let entry = {
            let pending = self.pending.read().unwrap();
            match pending.get(key) {
                Some(entry) => Arc::clone(entry),
                None => return WaitOutcome::NoPending,
            }
        };

        entry.waiters.fetch_add(1, Ordering::Relaxed);

        let mut done_rx = entry.done_rx.clone();
        let result = tokio::time::timeout(self.wait_timeout, done_rx.wait_for(|done| *done)).await;
        match result {
            Ok(Ok(_)) | Ok(Err(_)) => match entry.response.read().unwrap().clone() {
                Some(response) => WaitOutcome::Completed(response),
                None => WaitOutcome::Cancelled,
            },
            Err(_) => WaitOutcome::TimedOut,
        }
    }

    pub fn start(&self, key: &str) -> StartOutcome {
        let mut pending = self.pending.write().unwrap();
        if pending.contains_key(key) {
            return StartOutcome::AlreadyPending;
        }
        if pending.len() >= self.max_pending {
            return StartOutcome::Overflow;
        }
        pending.insert(key.to_string(), Arc::new(PendingRequest::new()));
        StartOutcome::Started
    }

    /// Remove the entry, publish the response and release every
    /// waiter. Returns how many waiters were released.
    pub fn complete(&self, key: &str, response: CachedResponse) -> usize {
        let entry = {
            let mut pending = self.pending.write().unwrap();
            pending.remove(key)
        };
        let Some(entry) = entry else {
            return 0;
        };
        *entry.response.write().unwrap() = Some(Arc::new(response));
        let waiters = entry.waiters.load(Ordering::Relaxed);
        let _ = entry.done_tx.send(true);
        waiters
    }

    /// Remove the entry and release waiters without a response, e.g.
    /// after an upstream failure. Waiters retry independently.
    pub fn cancel(&self, key: &str) {
        let entry = {
            let mut pending = self.pending.write().unwrap();
            pending.remove(key)
        };
        if let Some(entry) = entry {
            let _ = entry.done_tx.send(true);
        }
    }

    /// Drop entries whose completion already fired. Normal operation
    /// never needs this; it exists so a missed `complete`/`cancel`
    /// cannot leak entries forever.
    pub fn sweep(&self) -> usize {
        let mut pending = self.pending.write().unwrap();
        let before = pending.len();
        pending.retain(|_, entry| !*entry.done_rx.borrow());
        before - pending.len()
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            enabled: self.enabled,
            pending_count: self.pending.read().unwrap().len(),
            max_pending: self.max_pending,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Long-running sweeper; exits when the shutdown signal flips.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = self.sweep();
                    if removed > 0 {
                        tracing::warn!(removed, "dedup sweeper removed stale entries");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

/// Convenience constructor used by the dispatcher when an upstream
/// response has been buffered.
pub fn cached_response(status: u16, headers: HeaderMap, body: Vec<u8>) -> CachedResponse {
    CachedResponse {
        status,
        headers,
        body,
        completed_at: current_ts(),
    }
}
