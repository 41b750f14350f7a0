//! The [`Quota`] descriptor and its mutable handle, [`SharedQuota`].

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::{RateLimiterError, Result};

/// Immutable configuration record for a rate limiter.
///
/// An empty quota (every field unset) is a pass-through: see
/// [`crate::RateLimiter::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Quota {
    /// Window length. Requires `rate`.
    pub interval: Option<Duration>,
    /// Max starts per window. Requires `interval`.
    pub rate: Option<u32>,
    /// Max simultaneously in-flight calls. `None` means unbounded.
    pub concurrency: Option<u32>,
    /// Max time a call may wait in queue before failing. `None` or `Some(0)`
    /// disables deadline enforcement.
    pub max_delay: Option<Duration>,
    /// Distributed-only: begin accepting work at full quota before peer
    /// discovery completes, downshifting as peers are found.
    pub fast_start: bool,
}

impl Quota {
    /// An empty quota: no rate limit, no concurrency limit, no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a `rate` starts per `interval` sliding-window limit.
    pub fn with_rate(mut self, rate: u32, interval: Duration) -> Self {
        self.rate = Some(rate);
        self.interval = Some(interval);
        self
    }

    /// Cap the number of simultaneously in-flight calls.
    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Fail calls whose queue wait exceeds `max_delay`.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Enable (or disable) fast-start for distributed quota managers.
    pub fn with_fast_start(mut self, fast_start: bool) -> Self {
        self.fast_start = fast_start;
        self
    }

    /// True if this quota imposes no rate, concurrency, or interval limit.
    pub fn is_empty(&self) -> bool {
        self.rate.is_none() && self.interval.is_none() && self.concurrency.is_none()
    }

    /// True if `max_delay` enforcement is active.
    pub fn has_deadline(&self) -> bool {
        self.max_delay.is_some_and(|d| !d.is_zero())
    }

    /// Validate the `rate`/`interval` pairing invariant.
    pub fn validate(&self) -> Result<()> {
        if self.rate.is_some() != self.interval.is_some() {
            return Err(RateLimiterError::InvalidQuota(
                "rate and interval must be supplied together".to_string(),
            ));
        }
        Ok(())
    }

    /// Compute this instance's floor-divided share of the quota across a
    /// group of `group_size` peers (self included). `interval`, `max_delay`,
    /// and `fast_start` are copied unchanged.
    pub fn share(&self, group_size: u32) -> Quota {
        debug_assert!(group_size >= 1, "group size includes self, so is never zero");
        let group_size = group_size.max(1);
        Quota {
            interval: self.interval,
            rate: self.rate.map(|r| r / group_size),
            concurrency: self.concurrency.map(|c| c / group_size),
            max_delay: self.max_delay,
            fast_start: self.fast_start,
        }
    }

    /// The quota a distributed manager presents while still discovering
    /// peers: zero concurrency/rate if either was configured (so the
    /// dispatcher blocks rather than risks overshooting), unbounded
    /// otherwise.
    pub fn undiscovered(&self) -> Quota {
        Quota {
            interval: self.interval,
            rate: self.rate.map(|_| 0),
            concurrency: self.concurrency.map(|_| 0),
            max_delay: self.max_delay,
            fast_start: self.fast_start,
        }
    }
}

/// A [`Quota`] that can be swapped out from under a running
/// [`crate::LocalQuotaManager`] — the mechanism a
/// [`crate::DistributedQuotaManager`] uses to push down a recomputed share.
#[derive(Clone, Debug)]
pub struct SharedQuota(Arc<RwLock<Quota>>);

impl SharedQuota {
    /// Wrap a starting `Quota` in a shareable, swappable cell.
    pub fn new(quota: Quota) -> Self {
        Self(Arc::new(RwLock::new(quota)))
    }

    /// Read the currently-effective quota.
    pub fn get(&self) -> Quota {
        *self.0.read().expect("SharedQuota poisoned")
    }

    /// Replace the currently-effective quota.
    pub fn set(&self, quota: Quota) {
        *self.0.write().expect("SharedQuota poisoned") = quota;
    }
}

impl From<Quota> for SharedQuota {
    fn from(quota: Quota) -> Self {
        Self::new(quota)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_quota_has_no_limits() {
        assert!(Quota::new().is_empty());
    }

    #[test]
    fn rate_without_interval_is_invalid() {
        let mut quota = Quota::new();
        quota.rate = Some(5);
        assert!(quota.validate().is_err());
    }

    #[test]
    fn share_floors_and_copies_other_fields() {
        let quota = Quota::new()
            .with_rate(4, Duration::from_millis(500))
            .with_concurrency(2)
            .with_max_delay(Duration::from_millis(250));

        let share = quota.share(3);
        assert_eq!(share.rate, Some(1));
        assert_eq!(share.concurrency, Some(0));
        assert_eq!(share.interval, quota.interval);
        assert_eq!(share.max_delay, quota.max_delay);
    }

    #[test]
    fn shared_quota_reflects_latest_set() {
        let shared = SharedQuota::new(Quota::new().with_concurrency(1));
        assert_eq!(shared.get().concurrency, Some(1));
        shared.set(Quota::new().with_concurrency(5));
        assert_eq!(shared.get().concurrency, Some(5));
    }
}
