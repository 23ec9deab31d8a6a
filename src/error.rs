//! Error types for Ratekeeper.

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::ratelimit::RateLimiterRes;

/// Infrastructure, configuration and programming errors.
///
/// None of these mean "the caller is over limit"; that outcome is
/// [`Rejection::Limited`] and only ever comes out of `consume`.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Invalid limiter options, raised by constructors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The backing store failed.
    #[error("Store error: {0}")]
    Store(String),

    /// The cluster transport or coordinator failed.
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// The limiter does not implement this verb.
    #[error("{0} is not implemented by this limiter")]
    Unimplemented(&'static str),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a `consume` call did not go through.
#[derive(Error, Debug)]
pub enum Rejection {
    /// The key is over limit or blocked. Carries the limiter state so the
    /// caller can build a retry-after response.
    #[error("rate limited, retry in {}ms", .0.ms_before_next)]
    Limited(RateLimiterRes),

    /// The operation itself failed.
    #[error(transparent)]
    Failed(#[from] LimiterError),
}

impl Rejection {
    /// The limiter state if this is a denial.
    pub fn limited(&self) -> Option<&RateLimiterRes> {
        match self {
            Rejection::Limited(res) => Some(res),
            Rejection::Failed(_) => None,
        }
    }

    /// True if this is an infrastructure failure rather than a denial.
    pub fn is_failure(&self) -> bool {
        matches!(self, Rejection::Failed(_))
    }
}

/// Result type alias for limiter operations other than `consume`.
pub type Result<T> = std::result::Result<T, LimiterError>;
