//! Core rate limiter implementation over a store adapter.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::RateLimiter;
use super::blocked::BlockedKeys;
use super::memory::MemoryStore;
use super::options::{signed_points, CallOptions, LimiterOptions};
use super::res::RateLimiterRes;
use super::store::StoreAdapter;
use crate::error::{Rejection, Result};

/// Fixed-window rate limiter running on any [`StoreAdapter`].
///
/// # Algorithm
///
/// 1. Deny straight away if the key sits in the in-memory block cache.
/// 2. Add the points to the key's window record in the store.
/// 3. Over limit: block in memory once `in_memory_block_on_consumed` is
///    reached, otherwise block in the store for `block_duration` on the
///    first crossing, then deny.
/// 4. Within limit with `exec_evenly`: delay the answer so the remaining
///    points are spread over the rest of the window.
pub struct StoreLimiter<S: StoreAdapter> {
    options: LimiterOptions,
    store: S,
    blocked: BlockedKeys,
}

impl<S: StoreAdapter> std::fmt::Debug for StoreLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLimiter")
            .field("options", &self.options)
            .finish()
    }
}

impl StoreLimiter<MemoryStore> {
    /// Create a limiter over fresh in-process storage.
    pub fn in_memory(options: LimiterOptions) -> Result<Self> {
        Self::new(options, MemoryStore::new())
    }
}

impl<S: StoreAdapter> StoreLimiter<S> {
    /// Create a new limiter. Fails if the options are invalid.
    pub fn new(options: LimiterOptions, store: S) -> Result<Self> {
        options.validate()?;
        debug!(
            key_prefix = %options.key_prefix,
            points = options.points,
            duration = options.duration,
            block_duration = options.block_duration,
            exec_evenly = options.exec_evenly,
            "Creating store limiter"
        );
        Ok(Self {
            options,
            store,
            blocked: BlockedKeys::new(),
        })
    }

    /// The store adapter.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The in-memory block cache.
    pub fn blocked_keys(&self) -> &BlockedKeys {
        &self.blocked
    }

    async fn upsert(
        &self,
        rl_key: &str,
        delta: i64,
        ms_duration: u64,
        force_expire: bool,
        opts: &CallOptions,
    ) -> Result<RateLimiterRes> {
        let raw = self
            .store
            .upsert(rl_key, delta, ms_duration, force_expire, opts)
            .await?;
        Ok(self.store.to_result(rl_key, delta, &raw, self.options.points))
    }

    /// Duration of records created by this call.
    fn window_ms(&self, opts: &CallOptions) -> u64 {
        opts.custom_duration_ms
            .unwrap_or_else(|| self.options.duration_ms())
    }

    /// Apply the over-limit and even-spacing policies to a fresh result.
    async fn after_consume(
        &self,
        rl_key: &str,
        points_to_consume: i64,
        mut res: RateLimiterRes,
        opts: &CallOptions,
    ) -> std::result::Result<RateLimiterRes, Rejection> {
        let points = signed_points(self.options.points)?;

        if res.consumed_points > points {
            let on_consumed = self.options.in_memory_block_on_consumed;
            if on_consumed > 0 && res.consumed_points as u64 >= on_consumed {
                let block_ms = self.options.in_memory_block_duration_ms();
                self.blocked.add_ms(rl_key, block_ms);
                res.ms_before_next = i64::try_from(block_ms).unwrap_or(i64::MAX);
                debug!(
                    key = %self.options.parse_key(rl_key),
                    consumed = res.consumed_points,
                    block_ms = block_ms,
                    "Key blocked in memory"
                );
                return Err(Rejection::Limited(res));
            }

            if self.options.block_duration > 0 && res.consumed_points <= points.saturating_add(points_to_consume) {
                let block_ms = self.options.block_duration_ms();
                self.upsert(rl_key, res.consumed_points, block_ms, true, opts)
                    .await?;
                res.ms_before_next = i64::try_from(block_ms).unwrap_or(i64::MAX);
                debug!(
                    key = %self.options.parse_key(rl_key),
                    consumed = res.consumed_points,
                    block_ms = block_ms,
                    "Key blocked"
                );
            }

            return Err(Rejection::Limited(res));
        }

        if self.options.exec_evenly && res.ms_before_next > 0 && !res.is_first_in_duration {
            let spaced = (res.ms_before_next as u64).div_ceil(res.remaining_points + 2);
            let delay = spaced.max(self.options.exec_evenly_min_delay_ms);
            trace!(key = %self.options.parse_key(rl_key), delay_ms = delay, "Delaying consume");
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        Ok(res)
    }
}

#[async_trait]
impl<S: StoreAdapter> RateLimiter for StoreLimiter<S> {
    fn options(&self) -> &LimiterOptions {
        &self.options
    }

    fn options_mut(&mut self) -> &mut LimiterOptions {
        &mut self.options
    }

    async fn consume(
        &self,
        key: &str,
        points: u64,
        opts: &CallOptions,
    ) -> std::result::Result<RateLimiterRes, Rejection> {
        let rl_key = self.options.get_key(key);

        let blocked_ms = self.blocked.ms_before_expire(&rl_key);
        if blocked_ms > 0 {
            trace!(key = %key, blocked_ms = blocked_ms, "Key is blocked in memory");
            return Err(Rejection::Limited(RateLimiterRes::new(0, blocked_ms as i64, 0, false)));
        }

        let delta = signed_points(points)?;
        let res = self
            .upsert(&rl_key, delta, self.window_ms(opts), false, opts)
            .await?;

        trace!(
            key = %key,
            points = points,
            consumed = res.consumed_points,
            remaining = res.remaining_points,
            "Consumed"
        );

        self.after_consume(&rl_key, delta, res, opts).await
    }

    async fn penalty(&self, key: &str, points: u64, opts: &CallOptions) -> Result<RateLimiterRes> {
        let rl_key = self.options.get_key(key);
        self.upsert(&rl_key, signed_points(points)?, self.window_ms(opts), false, opts)
            .await
    }

    async fn reward(&self, key: &str, points: u64, opts: &CallOptions) -> Result<RateLimiterRes> {
        let rl_key = self.options.get_key(key);
        self.upsert(&rl_key, -signed_points(points)?, self.window_ms(opts), false, opts)
            .await
    }

    async fn get(&self, key: &str, _opts: &CallOptions) -> Result<Option<RateLimiterRes>> {
        let rl_key = self.options.get_key(key);
        let Some(raw) = self.store.get(&rl_key).await? else {
            return Ok(None);
        };
        let mut res = self.store.to_result(&rl_key, 0, &raw, self.options.points);
        res.is_first_in_duration = false;
        Ok(Some(res))
    }

    async fn set(&self, key: &str, points: i64, sec_duration: u64, opts: &CallOptions) -> Result<RateLimiterRes> {
        let rl_key = self.options.get_key(key);
        self.upsert(&rl_key, points, sec_duration.saturating_mul(1000), true, opts)
            .await
    }

    async fn block(&self, key: &str, sec_duration: u64, opts: &CallOptions) -> Result<RateLimiterRes> {
        let rl_key = self.options.get_key(key);
        let over_limit = signed_points(self.options.points)?.saturating_add(1);
        debug!(key = %key, sec_duration = sec_duration, "Blocking key");
        self.upsert(&rl_key, over_limit, sec_duration.saturating_mul(1000), true, opts)
            .await
    }

    async fn delete(&self, key: &str, _opts: &CallOptions) -> Result<bool> {
        let rl_key = self.options.get_key(key);
        let deleted = self.store.delete(&rl_key).await?;
        self.blocked.delete(&rl_key);
        Ok(deleted)
    }
}
