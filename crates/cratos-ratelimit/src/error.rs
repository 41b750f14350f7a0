//! Error types for cratos-ratelimit

use thiserror::Error;

/// Errors that can occur while configuring or constructing a limiter.
#[derive(Debug, Error)]
pub enum RateLimiterError {
    /// `rate`/`interval` were only partially supplied, or another field
    /// combination the admission model cannot represent.
    #[error("invalid quota: {0}")]
    InvalidQuota(String),

    /// The supplied pub/sub client cannot produce an independent subscriber
    /// connection, which the coordination protocol requires.
    #[error("coordination client does not support an independent subscriber connection")]
    UnsupportedClient,

    /// A coordination transport operation (publish, subscribe) failed.
    ///
    /// Transport errors are transient by design: the caller of
    /// [`crate::DistributedQuotaManager::new`] sees this only at construction
    /// time (while validating the transport); failures after that point are
    /// logged and the protocol self-heals via the next heartbeat.
    #[error("coordination transport error: {0}")]
    Transport(String),
}

/// Crate-local result alias for construction and configuration errors.
pub type Result<T> = std::result::Result<T, RateLimiterError>;

/// Sentinel error surfaced when a waiter's queue wait exceeds `max_delay`.
///
/// Callers should match on this type, not on its message text.
#[derive(Debug, Clone, Error)]
#[error("rate limit timeout: {message}")]
pub struct RateLimitTimeoutError {
    message: String,
}

impl RateLimitTimeoutError {
    pub(crate) fn new() -> Self {
        Self {
            message: "queue wait exceeded the configured max_delay".to_string(),
        }
    }
}

/// The outcome of a call scheduled through [`crate::RateLimiter::schedule`].
///
/// Distinguishes a timeout rejection from the operation's own error so
/// callers never have to downcast.
#[derive(Debug, Error)]
pub enum ScheduleError<E: std::fmt::Debug + std::fmt::Display> {
    /// The waiter's queue wait exceeded `max_delay` before it was admitted.
    #[error(transparent)]
    Timeout(#[from] RateLimitTimeoutError),

    /// The operation itself returned an error; propagated unchanged.
    #[error("operation failed: {0}")]
    Operation(E),
}

impl<E: std::fmt::Debug + std::fmt::Display> ScheduleError<E> {
    /// True if this is a timeout rejection rather than an operation error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ScheduleError::Timeout(_))
    }
}
