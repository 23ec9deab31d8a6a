//! Rate limiter trait shared by every limiter implementation.

use async_trait::async_trait;

use super::options::{CallOptions, LimiterOptions};
use super::res::RateLimiterRes;
use crate::error::{LimiterError, Rejection, Result};

/// Trait for rate limiter implementations.
///
/// This trait abstracts over the store-backed limiter, the cluster worker
/// and the insurance decorator so callers and wrappers can work with any of
/// them. Only `consume` can deny; every other verb either succeeds or fails
/// with an infrastructure error.
///
/// Verbs other than `consume` default to [`LimiterError::Unimplemented`].
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// The limiter's options.
    fn options(&self) -> &LimiterOptions;

    /// Mutable access to the options, used when attaching an insurance limiter.
    fn options_mut(&mut self) -> &mut LimiterOptions;

    /// Consume `points` for `key`.
    async fn consume(
        &self,
        key: &str,
        points: u64,
        opts: &CallOptions,
    ) -> std::result::Result<RateLimiterRes, Rejection>;

    /// Add `points` to `key` without any blocking policy.
    async fn penalty(&self, _key: &str, _points: u64, _opts: &CallOptions) -> Result<RateLimiterRes> {
        Err(LimiterError::Unimplemented("penalty"))
    }

    /// Give `points` back to `key`. May drive the consumed count below zero.
    async fn reward(&self, _key: &str, _points: u64, _opts: &CallOptions) -> Result<RateLimiterRes> {
        Err(LimiterError::Unimplemented("reward"))
    }

    /// Read the state of `key`, `None` if it has no live record.
    async fn get(&self, _key: &str, _opts: &CallOptions) -> Result<Option<RateLimiterRes>> {
        Err(LimiterError::Unimplemented("get"))
    }

    /// Overwrite `key` with `points` for `sec_duration` seconds, 0 for ever.
    async fn set(
        &self,
        _key: &str,
        _points: i64,
        _sec_duration: u64,
        _opts: &CallOptions,
    ) -> Result<RateLimiterRes> {
        Err(LimiterError::Unimplemented("set"))
    }

    /// Put `key` over limit for `sec_duration` seconds, 0 for ever.
    async fn block(&self, _key: &str, _sec_duration: u64, _opts: &CallOptions) -> Result<RateLimiterRes> {
        Err(LimiterError::Unimplemented("block"))
    }

    /// Forget `key`, lifting any block on it.
    async fn delete(&self, _key: &str, _opts: &CallOptions) -> Result<bool> {
        Err(LimiterError::Unimplemented("delete"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConsumeOnly {
        options: LimiterOptions,
    }

    #[async_trait]
    impl RateLimiter for ConsumeOnly {
        fn options(&self) -> &LimiterOptions {
            &self.options
        }

        fn options_mut(&mut self) -> &mut LimiterOptions {
            &mut self.options
        }

        async fn consume(
            &self,
            _key: &str,
            points: u64,
            _opts: &CallOptions,
        ) -> std::result::Result<RateLimiterRes, Rejection> {
            Ok(RateLimiterRes::new(self.options.points - points, 1000, points as i64, true))
        }
    }

    #[tokio::test]
    async fn test_unimplemented_verbs_fail_fast() {
        let limiter = ConsumeOnly {
            options: LimiterOptions::default(),
        };
        let opts = CallOptions::default();

        assert!(limiter.consume("k", 1, &opts).await.is_ok());
        assert!(matches!(
            limiter.penalty("k", 1, &opts).await,
            Err(LimiterError::Unimplemented("penalty"))
        ));
        assert!(matches!(
            limiter.block("k", 10, &opts).await,
            Err(LimiterError::Unimplemented("block"))
        ));
        assert!(matches!(
            limiter.delete("k", &opts).await,
            Err(LimiterError::Unimplemented("delete"))
        ));
    }
}
