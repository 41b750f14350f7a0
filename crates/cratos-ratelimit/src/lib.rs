//! Cratos Ratelimit — client-side rate limiting for outbound calls.
//!
//! Admits calls at a rate no greater than a configured [`Quota`], bounds
//! concurrent in-flight calls, and optionally rejects calls whose queue wait
//! would exceed a deadline. In distributed mode (behind the `redis`-backed
//! [`DistributedQuotaManager`]) a group of cooperating instances divide one
//! shared quota between themselves over a pub/sub discovery channel, without
//! a central arbiter.
//!
//! ```ignore
//! use cratos_ratelimit::{Quota, RateLimiter};
//! use std::time::Duration;
//!
//! let quota = Quota::new().with_concurrency(2);
//! let limiter = RateLimiter::new(quota)?;
//!
//! let result = limiter.schedule(|| async { fetch_thing().await }).await;
//! ```

mod clock;
mod dispatcher;
mod error;
mod local;
mod quota;
mod settings;

pub mod coordination;
pub mod distributed;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::RateLimiter;
pub use distributed::DistributedQuotaManager;
pub use error::{RateLimitTimeoutError, RateLimiterError, Result, ScheduleError};
pub use local::{LocalQuotaManager, QuotaManager};
pub use quota::{Quota, SharedQuota};
pub use settings::LimiterSettings;
