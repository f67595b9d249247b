pub mod clock;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod metrics;
pub mod rate_limiter;
pub mod store;
pub mod token_bucket;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LimiterConfig, RedisConfig};
pub use error::{Error, Result, StoreError, StoreOp};
pub use rate_limiter::{Decision, RateLimiter};
pub use store::{AtomicStateStore, MemoryStore, RedisHashStore, RedisStringStore, StateStore};
pub use token_bucket::BucketState;
