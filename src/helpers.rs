use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::distributions::Alphanumeric;
use rand::Rng;

pub fn current_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Floor a unix timestamp to its 10-second window.
pub fn trim_time(ts: u64) -> u64 {
    (ts / 10) * 10
}

const STAGE_STRINGS: [&str; 6] = ["0", "1", "2", "3", "4", "5+"];

pub fn stage_to_str(stage: u8) -> &'static str {
    STAGE_STRINGS[usize::from(stage).min(5)]
}

pub fn random_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub fn is_hop_by_hop_http_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "host"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Pool of string buffers for the per-request key-building hot path.
/// The steady path reuses buffers instead of allocating per request.
pub struct BufferPool {
    pool: Mutex<Vec<String>>,
}

const POOL_MAX: usize = 64;

impl BufferPool {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, capacity: usize) -> String {
        let mut buf = self.pool.lock().unwrap().pop().unwrap_or_default();
        buf.clear();
        if buf.capacity() < capacity {
            buf.reserve(capacity - buf.capacity());
        }
        buf
    }

    pub fn put(&self, buf: String) {
        let mut pool = self.pool.lock().unwrap();
        if pool.len() < POOL_MAX {
            pool.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
