//! In-process counter storage with per-record expiry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::trace;

use super::options::CallOptions;
use super::res::RateLimiterRes;
use super::store::StoreAdapter;
use crate::error::Result;

/// A counter value as read from or written to [`MemoryStorage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRecord {
    /// Accumulated points
    pub points: i64,
    /// Milliseconds until expiry, `-1` for records that never expire
    pub ms_before_expire: i64,
    /// Whether this operation created the record
    pub is_first: bool,
}

struct Record {
    value: i64,
    expires_at: Option<Instant>,
    generation: u64,
    timer: Option<AbortHandle>,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }

    fn ms_before_expire(&self, now: Instant) -> i64 {
        self.expires_at
            .map_or(-1, |at| {
                i64::try_from(at.saturating_duration_since(now).as_millis()).unwrap_or(i64::MAX)
            })
    }

    fn cancel_timer(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct StorageInner {
    records: DashMap<String, Record>,
    generation: AtomicU64,
}

/// Process-local map of key to counter value and expiry.
///
/// Each expiring record owns a deletion task that is aborted when the record
/// is replaced or deleted. The task only holds a weak reference, so it never
/// keeps the storage alive. Reads also check expiry, which keeps them correct
/// when no tokio runtime was around to run the task.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<StorageInner>,
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("records", &self.inner.records.len())
            .finish()
    }
}

impl MemoryStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to the live record at `key`, keeping its expiry.
    ///
    /// Without a live record this behaves like [`set`](Self::set).
    pub fn incrby(&self, key: &str, delta: i64, duration: Duration) -> MemoryRecord {
        let now = Instant::now();
        match self.inner.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                let record = occupied.get_mut();
                record.value += delta;
                MemoryRecord {
                    points: record.value,
                    ms_before_expire: record.ms_before_expire(now),
                    is_first: false,
                }
            }
            Entry::Occupied(mut occupied) => {
                let (record, res) = self.new_record(key, delta, duration, now);
                occupied.insert(record).cancel_timer();
                res
            }
            Entry::Vacant(vacant) => {
                let (record, res) = self.new_record(key, delta, duration, now);
                vacant.insert(record);
                res
            }
        }
    }

    /// Replace the record at `key`. A zero `duration` keeps it indefinitely.
    pub fn set(&self, key: &str, value: i64, duration: Duration) -> MemoryRecord {
        let (record, res) = self.new_record(key, value, duration, Instant::now());
        if let Some(old) = self.inner.records.insert(key.to_string(), record) {
            old.cancel_timer();
        }
        res
    }

    /// Read the live record at `key`.
    pub fn get(&self, key: &str) -> Option<MemoryRecord> {
        let now = Instant::now();
        let live = {
            let record = self.inner.records.get(key)?;
            record.is_live(now).then(|| MemoryRecord {
                points: record.value,
                ms_before_expire: record.ms_before_expire(now),
                is_first: false,
            })
        };
        if live.is_none() {
            self.remove_expired(key, now);
        }
        live
    }

    /// Remove the record at `key`. Returns whether a live record existed.
    pub fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.inner.records.remove(key) {
            Some((_, record)) => {
                record.cancel_timer();
                record.is_live(now)
            }
            None => false,
        }
    }

    /// Number of stored records, expired ones included until removed.
    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    /// Whether no records are stored.
    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    fn new_record(&self, key: &str, value: i64, duration: Duration, now: Instant) -> (Record, MemoryRecord) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        // Durations too long to represent never expire.
        let (expires_at, timer, ms_before_expire) = match now.checked_add(duration) {
            Some(at) if !duration.is_zero() => (
                Some(at),
                self.schedule_delete(key, generation, duration),
                i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
            ),
            _ => (None, None, -1),
        };

        let record = Record {
            value,
            expires_at,
            generation,
            timer,
        };
        let res = MemoryRecord {
            points: value,
            ms_before_expire,
            is_first: true,
        };
        (record, res)
    }

    fn schedule_delete(&self, key: &str, generation: u64, duration: Duration) -> Option<AbortHandle> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let storage: Weak<StorageInner> = Arc::downgrade(&self.inner);
        let key = key.to_string();

        let task = runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(storage) = storage.upgrade() {
                if storage
                    .records
                    .remove_if(&key, |_, record| record.generation == generation)
                    .is_some()
                {
                    trace!(key = %key, "Expired record removed");
                }
            }
        });
        Some(task.abort_handle())
    }

    fn remove_expired(&self, key: &str, now: Instant) {
        if let Some((_, record)) = self.inner.records.remove_if(key, |_, record| !record.is_live(now)) {
            record.cancel_timer();
        }
    }
}

/// [`StoreAdapter`] over [`MemoryStorage`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    storage: MemoryStorage,
}

impl MemoryStore {
    /// Create an adapter over fresh storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an adapter over existing storage.
    pub fn with_storage(storage: MemoryStorage) -> Self {
        Self { storage }
    }

    /// The underlying storage.
    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    type Raw = MemoryRecord;

    async fn upsert(
        &self,
        key: &str,
        delta: i64,
        ms_duration: u64,
        force_expire: bool,
        _opts: &CallOptions,
    ) -> Result<MemoryRecord> {
        let duration = Duration::from_millis(ms_duration);
        Ok(if force_expire {
            self.storage.set(key, delta, duration)
        } else {
            self.storage.incrby(key, delta, duration)
        })
    }

    async fn get(&self, key: &str) -> Result<Option<MemoryRecord>> {
        Ok(self.storage.get(key))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.storage.delete(key))
    }

    fn to_result(&self, _key: &str, _changed_points: i64, raw: &MemoryRecord, points: u64) -> RateLimiterRes {
        let remaining = (points as i64).saturating_sub(raw.points).max(0) as u64;
        RateLimiterRes::new(remaining, raw.ms_before_expire, raw.points, raw.is_first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_incrby_creates_then_increments() {
        let storage = MemoryStorage::new();

        let first = storage.incrby("k", 1, Duration::from_secs(5));
        assert_eq!(first, MemoryRecord { points: 1, ms_before_expire: 5000, is_first: true });

        tokio::time::advance(Duration::from_secs(2)).await;
        let second = storage.incrby("k", 3, Duration::from_secs(5));
        assert_eq!(second.points, 4);
        assert!(!second.is_first);
        // Expiry is not pushed back by increments.
        assert_eq!(second.ms_before_expire, 3000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_expires() {
        let storage = MemoryStorage::new();
        storage.incrby("k", 2, Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(storage.get("k").is_none());
        assert!(storage.is_empty());

        let fresh = storage.incrby("k", 1, Duration::from_secs(1));
        assert_eq!(fresh.points, 1);
        assert!(fresh.is_first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_never_expires() {
        let storage = MemoryStorage::new();
        let res = storage.set("k", 7, Duration::ZERO);
        assert_eq!(res.ms_before_expire, -1);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        let res = storage.get("k").unwrap();
        assert_eq!(res.points, 7);
        assert_eq!(res.ms_before_expire, -1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_replaces_timer() {
        let storage = MemoryStorage::new();
        storage.set("k", 1, Duration::from_secs(1));
        storage.set("k", 9, Duration::from_secs(10));

        // The first timer must not delete the replacement record.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(storage.get("k").map(|r| r.points), Some(9));
    }

    #[tokio::test]
    async fn test_delete() {
        let storage = MemoryStorage::new();
        storage.set("k", 1, Duration::from_secs(10));

        assert!(storage.delete("k"));
        assert!(!storage.delete("k"));
        assert!(storage.get("k").is_none());
    }

    #[test]
    fn test_without_runtime() {
        let storage = MemoryStorage::new();
        let res = storage.incrby("k", 1, Duration::from_millis(10));
        assert!(res.is_first);
        std::thread::sleep(Duration::from_millis(20));
        assert!(storage.get("k").is_none());
    }

    #[tokio::test]
    async fn test_memory_store_to_result() {
        let store = MemoryStore::new();
        let opts = CallOptions::default();

        let raw = store.upsert("k", 3, 1000, false, &opts).await.unwrap();
        let res = store.to_result("k", 3, &raw, 2);
        assert_eq!(res.remaining_points, 0);
        assert_eq!(res.consumed_points, 3);
        assert!(res.is_first_in_duration);

        let raw = store.upsert("k", -5, 1000, false, &opts).await.unwrap();
        let res = store.to_result("k", -5, &raw, 2);
        assert_eq!(res.consumed_points, -2);
        assert_eq!(res.remaining_points, 4);
    }
}
