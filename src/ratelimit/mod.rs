//! Rate limiting logic and state management.

mod backend;
mod blocked;
mod insurance;
mod limiter;
mod memory;
mod options;
mod res;
mod store;

pub use backend::RateLimiter;
pub use blocked::BlockedKeys;
pub use insurance::Insured;
pub use limiter::StoreLimiter;
pub use memory::{MemoryRecord, MemoryStorage, MemoryStore};
pub(crate) use options::signed_points;
pub use options::{CallOptions, LimiterOptions, DEFAULT_DURATION_SECS, DEFAULT_KEY_PREFIX, DEFAULT_POINTS};
pub use res::RateLimiterRes;
pub use store::StoreAdapter;

/// In-process limiter over [`MemoryStore`].
pub type MemoryRateLimiter = StoreLimiter<MemoryStore>;
