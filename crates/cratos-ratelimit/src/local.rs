//! The local quota manager: the admission engine in §4.1 of the design.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::trace;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::quota::{Quota, SharedQuota};

/// The admission contract shared by [`LocalQuotaManager`] and
/// [`crate::DistributedQuotaManager`].
///
/// `try_start`/`end` are pure, synchronous decisions with no I/O — the
/// dispatcher calls them from inside its tick loop without awaiting.
pub trait QuotaManager: Send + Sync {
    /// Atomically decide whether a call may start right now. On `true`, the
    /// call counts against `concurrency` and the rate window until a
    /// matching [`QuotaManager::end`].
    fn try_start(&self) -> bool;

    /// Release a slot claimed by a prior `true` result from `try_start`.
    /// Tolerated without a matching `try_start` (clamped at zero) so a
    /// double-release bug in the caller cannot underflow the counter.
    fn end(&self);

    /// The current number of in-flight calls.
    fn active_count(&self) -> u32;

    /// The quota currently in effect (for a distributed manager, this is
    /// the instance's current share, not the configured quota).
    fn quota(&self) -> Quota;
}

impl std::fmt::Debug for dyn QuotaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn QuotaManager")
            .field("active_count", &self.active_count())
            .field("quota", &self.quota())
            .finish()
    }
}

#[derive(Debug, Default)]
struct Counters {
    active: u32,
    starts: VecDeque<Instant>,
}

/// In-process admission engine: a sliding-window rate limit composed with a
/// concurrency cap, guarded by one mutex so both decisions are made
/// atomically.
#[derive(Debug)]
pub struct LocalQuotaManager {
    quota: SharedQuota,
    clock: Arc<dyn Clock>,
    counters: Mutex<Counters>,
}

impl LocalQuotaManager {
    /// Build a manager for a fixed `quota`, using the system clock.
    ///
    /// Fails if `quota` violates the `rate`/`interval` pairing invariant;
    /// see [`Quota::validate`].
    pub fn new(quota: Quota) -> Result<Self> {
        Self::with_clock(quota, Arc::new(SystemClock))
    }

    /// Build a manager for a fixed `quota` with an injected clock, for tests.
    pub fn with_clock(quota: Quota, clock: Arc<dyn Clock>) -> Result<Self> {
        quota.validate()?;
        Ok(Self::with_shared_quota(SharedQuota::new(quota), clock))
    }

    /// Build a manager whose effective quota can be swapped out from under
    /// it — used by [`crate::DistributedQuotaManager`] to push down a
    /// recomputed share without rebuilding the counters.
    pub fn with_shared_quota(quota: SharedQuota, clock: Arc<dyn Clock>) -> Self {
        Self {
            quota,
            clock,
            counters: Mutex::new(Counters::default()),
        }
    }
}

impl QuotaManager for LocalQuotaManager {
    fn try_start(&self) -> bool {
        let quota = self.quota.get();
        let now = self.clock.now();
        let mut counters = self.counters.lock().expect("LocalQuotaManager poisoned");

        if let Some(concurrency) = quota.concurrency {
            if counters.active >= concurrency {
                trace!(active = counters.active, concurrency, "rejected: concurrency limit");
                return false;
            }
        }

        if let (Some(rate), Some(interval)) = (quota.rate, quota.interval) {
            while counters
                .starts
                .front()
                .is_some_and(|start| now.duration_since(*start) >= interval)
            {
                counters.starts.pop_front();
            }
            if counters.starts.len() as u32 >= rate {
                trace!(in_window = counters.starts.len(), rate, "rejected: rate limit");
                return false;
            }
            counters.starts.push_back(now);
        }

        counters.active += 1;
        trace!(active = counters.active, "admitted");
        true
    }

    fn end(&self) {
        let mut counters = self.counters.lock().expect("LocalQuotaManager poisoned");
        counters.active = counters.active.saturating_sub(1);
    }

    fn active_count(&self) -> u32 {
        self.counters.lock().expect("LocalQuotaManager poisoned").active
    }

    fn quota(&self) -> Quota {
        self.quota.get()
    }
}
