//! In-memory cache of blocked keys.
//!
//! Lets a limiter deny a known-blocked key without a round trip to its store.
//! Expired entries are dropped lazily, so no background task is needed.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Insertions after which a full sweep of expired entries runs.
const SWEEP_AFTER_INSERTS: usize = 999;

/// Keys blocked until an absolute instant.
#[derive(Debug, Default)]
pub struct BlockedKeys {
    inner: Mutex<BlockedInner>,
}

#[derive(Debug, Default)]
struct BlockedInner {
    keys: HashMap<String, Instant>,
    added_since_sweep: usize,
}

impl BlockedInner {
    fn collect_expired(&mut self, now: Instant) {
        let before = self.keys.len();
        self.keys.retain(|_, expire_at| *expire_at > now);
        self.added_since_sweep = 0;
        trace!(removed = before - self.keys.len(), "Swept blocked keys");
    }
}

impl BlockedKeys {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Block `key` for `secs` seconds.
    pub fn add(&self, key: &str, secs: u64) {
        self.add_ms(key, secs * 1000);
    }

    /// Block `key` for `ms` milliseconds, replacing any previous entry.
    pub fn add_ms(&self, key: &str, ms: u64) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner
            .keys
            .insert(key.to_string(), now + Duration::from_millis(ms));
        inner.added_since_sweep += 1;
        if inner.added_since_sweep > SWEEP_AFTER_INSERTS {
            inner.collect_expired(now);
        }
    }

    /// Milliseconds until `key` is unblocked, 0 if it is not blocked.
    pub fn ms_before_expire(&self, key: &str) -> u64 {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(expire_at) = inner.keys.get(key).copied() else {
            return 0;
        };
        if expire_at <= now {
            inner.collect_expired(now);
            return 0;
        }
        // Sub-millisecond remainders still count as blocked.
        (expire_at - now).as_millis().max(1) as u64
    }

    /// Remove every expired entry.
    pub fn collect_expired(&self) {
        self.inner.lock().collect_expired(Instant::now());
    }

    /// Unblock one key.
    pub fn delete(&self, key: &str) {
        self.inner.lock().keys.remove(key);
    }

    /// Unblock every key.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.keys.clear();
        inner.added_since_sweep = 0;
    }

    /// Number of entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.inner.lock().keys.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
