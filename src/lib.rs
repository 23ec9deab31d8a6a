//! Ratekeeper - Fixed-Window Rate Limiting
//!
//! This crate tracks points consumed per key inside a fixed window and
//! decides whether more consumption is allowed. Limiters run on any store
//! that implements [`ratelimit::StoreAdapter`], can block abusive keys,
//! spread allowed actions evenly over a window, and fall back to an insurance
//! limiter when their store fails. The [`cluster`] module lets many worker
//! processes share counters held by one coordinator.

pub mod cluster;
pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{LimiterError, Rejection};
pub use ratelimit::{CallOptions, Insured, LimiterOptions, RateLimiter, RateLimiterRes, StoreLimiter};
