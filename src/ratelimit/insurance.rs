//! Fallback to a secondary limiter when the primary's infrastructure fails.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::warn;

use super::backend::RateLimiter;
use super::options::{CallOptions, LimiterOptions};
use super::res::RateLimiterRes;
use crate::error::{LimiterError, Rejection, Result};

/// Wraps a limiter with an optional insurance limiter.
///
/// When the primary fails with an infrastructure error, the same call is
/// made once on the insurance limiter and its outcome is returned. Denials
/// from the primary are returned as they are.
pub struct Insured<L> {
    primary: L,
    insurance: Option<Arc<dyn RateLimiter>>,
}

impl<L: RateLimiter> Insured<L> {
    /// Wrap `primary` without insurance. Errors propagate unchanged.
    pub fn new(primary: L) -> Self {
        Self {
            primary,
            insurance: None,
        }
    }

    /// Attach an insurance limiter.
    ///
    /// The primary's `block_duration` and `exec_evenly` are copied onto it
    /// once, here.
    pub fn with_insurance<I: RateLimiter + 'static>(mut self, mut insurance: I) -> Self {
        let primary = self.primary.options();
        let (block_duration, exec_evenly) = (primary.block_duration, primary.exec_evenly);
        let options = insurance.options_mut();
        options.block_duration = block_duration;
        options.exec_evenly = exec_evenly;
        self.insurance = Some(Arc::new(insurance));
        self
    }

    /// The primary limiter.
    pub fn primary(&self) -> &L {
        &self.primary
    }

    /// The insurance limiter, if any.
    pub fn insurance(&self) -> Option<&Arc<dyn RateLimiter>> {
        self.insurance.as_ref()
    }

    fn fallback(&self, verb: &'static str, key: &str, err: &LimiterError) -> Option<&dyn RateLimiter> {
        let insurance = self.insurance.as_deref()?;
        warn!(verb = verb, key = %key, error = %err, "Primary limiter failed, using insurance limiter");
        Some(insurance)
    }

    async fn insured<'a, T, F>(
        &'a self,
        verb: &'static str,
        key: &'a str,
        primary: BoxFuture<'a, Result<T>>,
        retry: F,
    ) -> Result<T>
    where
        T: Send,
        F: FnOnce(&'a dyn RateLimiter) -> BoxFuture<'a, Result<T>> + Send,
    {
        match primary.await {
            Err(err) => match self.fallback(verb, key, &err) {
                Some(insurance) => retry(insurance).await,
                None => Err(err),
            },
            ok => ok,
        }
    }
}

#[async_trait]
impl<L: RateLimiter> RateLimiter for Insured<L> {
    fn options(&self) -> &LimiterOptions {
        self.primary.options()
    }

    fn options_mut(&mut self) -> &mut LimiterOptions {
        self.primary.options_mut()
    }

    async fn consume(
        &self,
        key: &str,
        points: u64,
        opts: &CallOptions,
    ) -> std::result::Result<RateLimiterRes, Rejection> {
        match self.primary.consume(key, points, opts).await {
            Err(Rejection::Failed(err)) => match self.fallback("consume", key, &err) {
                Some(insurance) => insurance.consume(key, points, opts).await,
                None => Err(Rejection::Failed(err)),
            },
            outcome => outcome,
        }
    }

    async fn penalty(&self, key: &str, points: u64, opts: &CallOptions) -> Result<RateLimiterRes> {
        self.insured("penalty", key, self.primary.penalty(key, points, opts), move |insurance| {
            insurance.penalty(key, points, opts)
        })
        .await
    }

    async fn reward(&self, key: &str, points: u64, opts: &CallOptions) -> Result<RateLimiterRes> {
        self.insured("reward", key, self.primary.reward(key, points, opts), move |insurance| {
            insurance.reward(key, points, opts)
        })
        .await
    }

    async fn get(&self, key: &str, opts: &CallOptions) -> Result<Option<RateLimiterRes>> {
        self.insured("get", key, self.primary.get(key, opts), move |insurance| {
            insurance.get(key, opts)
        })
        .await
    }

    async fn set(&self, key: &str, points: i64, sec_duration: u64, opts: &CallOptions) -> Result<RateLimiterRes> {
        self.insured(
            "set",
            key,
            self.primary.set(key, points, sec_duration, opts),
            move |insurance| insurance.set(key, points, sec_duration, opts),
        )
        .await
    }

    async fn block(&self, key: &str, sec_duration: u64, opts: &CallOptions) -> Result<RateLimiterRes> {
        self.insured("block", key, self.primary.block(key, sec_duration, opts), move |insurance| {
            insurance.block(key, sec_duration, opts)
        })
        .await
    }

    async fn delete(&self, key: &str, opts: &CallOptions) -> Result<bool> {
        self.insured("delete", key, self.primary.delete(key, opts), move |insurance| {
            insurance.delete(key, opts)
        })
        .await
    }
}
