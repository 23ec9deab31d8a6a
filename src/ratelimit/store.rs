//! Store adapter trait for abstracting over counter backends.

use async_trait::async_trait;

use super::options::CallOptions;
use super::res::RateLimiterRes;
use crate::error::Result;

/// Trait for counter store backends.
///
/// This is all a backend has to provide for [`StoreLimiter`](super::StoreLimiter)
/// to run the full rate limiting algorithm on top of it. Atomicity of
/// `upsert` is the backend's responsibility.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// The backend's native record shape.
    type Raw: Send + Sync;

    /// Create or increment the record at `key` by `delta`.
    ///
    /// A new record expires after `ms_duration` milliseconds, 0 meaning never.
    /// With `force_expire` the record is overwritten with `delta` and a fresh
    /// expiry regardless of its current state.
    async fn upsert(
        &self,
        key: &str,
        delta: i64,
        ms_duration: u64,
        force_expire: bool,
        opts: &CallOptions,
    ) -> Result<Self::Raw>;

    /// Read the live record at `key`.
    async fn get(&self, key: &str) -> Result<Option<Self::Raw>>;

    /// Remove the record at `key`. Returns whether a record existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Normalize a raw record for a limiter allowing `points` per window.
    fn to_result(&self, key: &str, changed_points: i64, raw: &Self::Raw, points: u64) -> RateLimiterRes;
}
