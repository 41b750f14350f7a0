//! The rate limiter facade: the queue/dispatcher in §4.3 of the design.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{RateLimitTimeoutError, Result as CrateResult, ScheduleError};
use crate::local::{LocalQuotaManager, QuotaManager};
use crate::quota::Quota;
use crate::settings::LimiterSettings;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased waiter action: admit it (run the operation and settle its
/// result) or reject it for having overstayed its deadline. Exactly one of
/// these is invoked, exactly once, per waiter.
trait Waiter: Send {
    fn admit(self: Box<Self>, manager: Arc<dyn QuotaManager>) -> BoxFuture<'static, ()>;
    fn reject_timeout(self: Box<Self>);
}

struct TypedWaiter<F, T, E> {
    op: F,
    tx: oneshot::Sender<std::result::Result<T, ScheduleError<E>>>,
}

impl<F, Fut, T, E> Waiter for TypedWaiter<F, T, E>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + std::fmt::Debug + std::fmt::Display + 'static,
{
    fn admit(self: Box<Self>, manager: Arc<dyn QuotaManager>) -> BoxFuture<'static, ()> {
        let Self { op, tx } = *self;
        Box::pin(async move {
            let result = op().await;
            manager.end();
            let _ = tx.send(result.map_err(ScheduleError::Operation));
        })
    }

    fn reject_timeout(self: Box<Self>) {
        let _ = self.tx.send(Err(ScheduleError::Timeout(RateLimitTimeoutError::new())));
    }
}

struct PendingWaiter {
    enqueue_time: Instant,
    deadline: Option<Instant>,
    inner: Box<dyn Waiter>,
}

enum Command {
    Enqueue(PendingWaiter),
}

/// Accepts a user-supplied async operation, enqueues it, and admits it once
/// the underlying [`QuotaManager`] allows it (or rejects it once its
/// deadline passes).
///
/// Constructing a limiter from an empty [`Quota`] (no rate, concurrency, or
/// interval set) yields a pass-through: `schedule` invokes the operation
/// immediately and a one-time warning is logged. This is a misuse escape
/// hatch, not a mode a caller should rely on.
pub struct RateLimiter {
    mode: Mode,
}

enum Mode {
    PassThrough(Arc<AtomicBool>),
    Dispatched {
        manager: Arc<dyn QuotaManager>,
        tx: mpsc::UnboundedSender<Command>,
        cancel: CancellationToken,
    },
}

impl RateLimiter {
    /// Build a limiter directly from a `Quota`, using the system clock and
    /// default [`LimiterSettings`].
    ///
    /// Fails if `quota` violates the `rate`/`interval` pairing invariant;
    /// see [`Quota::validate`].
    pub fn new(quota: Quota) -> CrateResult<Self> {
        Self::with_settings(quota, LimiterSettings::default())
    }

    /// Build a limiter from a `Quota` with explicit [`LimiterSettings`].
    pub fn with_settings(quota: Quota, settings: LimiterSettings) -> CrateResult<Self> {
        if quota.is_empty() {
            warn_empty_quota_once();
            return Ok(Self {
                mode: Mode::PassThrough(Arc::new(AtomicBool::new(false))),
            });
        }
        let manager = Arc::new(LocalQuotaManager::with_clock(quota, Arc::new(SystemClock))?);
        Ok(Self::from_manager_with_settings(manager, settings))
    }

    /// Build a limiter from a prebuilt [`QuotaManager`] — a local manager,
    /// a [`crate::DistributedQuotaManager`], or a test double.
    pub fn from_manager(manager: Arc<dyn QuotaManager>) -> Self {
        Self::from_manager_with_settings(manager, LimiterSettings::default())
    }

    /// Build a limiter from a prebuilt [`QuotaManager`] with explicit
    /// [`LimiterSettings`].
    pub fn from_manager_with_settings(manager: Arc<dyn QuotaManager>, settings: LimiterSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        spawn_dispatch_loop(manager.clone(), rx, settings, cancel.clone());
        Self {
            mode: Mode::Dispatched { manager, tx, cancel },
        }
    }

    /// Schedule `op` to run once admitted. Resolves with the operation's
    /// value, or rejects with [`ScheduleError::Timeout`] if the queue wait
    /// exceeded `max_delay`, or [`ScheduleError::Operation`] if `op` itself
    /// returned an error.
    pub async fn schedule<F, Fut, T, E>(&self, op: F) -> std::result::Result<T, ScheduleError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + std::fmt::Debug + std::fmt::Display + 'static,
    {
        match &self.mode {
            Mode::PassThrough(_) => op().await.map_err(ScheduleError::Operation),
            Mode::Dispatched { manager, tx, .. } => {
                let (resolver, receiver) = oneshot::channel();
                let enqueue_time = Instant::now();
                let quota = manager.quota();
                let deadline = quota
                    .has_deadline()
                    .then(|| enqueue_time + quota.max_delay.expect("has_deadline implies max_delay is set"));
                let waiter = PendingWaiter {
                    enqueue_time,
                    deadline,
                    inner: Box::new(TypedWaiter { op, tx: resolver }),
                };
                if tx.send(Command::Enqueue(waiter)).is_err() {
                    // Dispatcher task is gone (limiter dropped mid-call);
                    // treat like any other settle-exactly-once timeout.
                    return Err(ScheduleError::Timeout(RateLimitTimeoutError::new()));
                }
                receiver
                    .await
                    .unwrap_or_else(|_| Err(ScheduleError::Timeout(RateLimitTimeoutError::new())))
            }
        }
    }

    /// The quota manager's effective quota right now.
    pub fn quota(&self) -> Quota {
        match &self.mode {
            Mode::PassThrough(_) => Quota::new(),
            Mode::Dispatched { manager, .. } => manager.quota(),
        }
    }

    /// Currently in-flight call count.
    pub fn active_count(&self) -> u32 {
        match &self.mode {
            Mode::PassThrough(_) => 0,
            Mode::Dispatched { manager, .. } => manager.active_count(),
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Mode::Dispatched { cancel, .. } = &self.mode {
            cancel.cancel();
        }
    }
}

fn warn_empty_quota_once() {
    use std::sync::OnceLock;
    static WARNED: OnceLock<()> = OnceLock::new();
    WARNED.get_or_init(|| {
        warn!("constructed with an empty quota; operating as a pass-through limiter");
    });
}

fn spawn_dispatch_loop(
    manager: Arc<dyn QuotaManager>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    settings: LimiterSettings,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut queue: VecDeque<PendingWaiter> = VecDeque::new();
        let mut tick = tokio::time::interval(settings.dispatch_tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(dropped = queue.len(), "dispatcher cancelled, rejecting queued waiters");
                    for waiter in queue.drain(..) {
                        waiter.inner.reject_timeout();
                    }
                    break;
                }
                maybe_cmd = rx.recv() => {
                    match maybe_cmd {
                        Some(Command::Enqueue(waiter)) => queue.push_back(waiter),
                        None => {
                            // All RateLimiter handles dropped.
                            for waiter in queue.drain(..) {
                                waiter.inner.reject_timeout();
                            }
                            break;
                        }
                    }
                }
                _ = tick.tick() => {
                    drain_admissible(&mut queue, &manager);
                }
            }
        }
    });
}

/// Repeatedly examine the head of the queue: admit it, reject it past its
/// deadline, or stop for this tick. A rejected head advances the queue on
/// the same tick so one expired waiter never starves the next.
fn drain_admissible(queue: &mut VecDeque<PendingWaiter>, manager: &Arc<dyn QuotaManager>) {
    loop {
        let Some(head) = queue.front() else { break };

        if manager.try_start() {
            let waiter = queue.pop_front().expect("front just checked Some");
            let manager = manager.clone();
            tokio::spawn(waiter.inner.admit(manager));
            continue;
        }

        if let Some(deadline) = head.deadline {
            if Instant::now() >= deadline {
                let waiter = queue.pop_front().expect("front just checked Some");
                debug!(
                    waited_ms = waiter.enqueue_time.elapsed().as_millis() as u64,
                    "rejecting waiter: deadline exceeded"
                );
                waiter.inner.reject_timeout();
                continue;
            }
        }

        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pass_through_runs_immediately() {
        let limiter = RateLimiter::new(Quota::new()).unwrap();
        let result: std::result::Result<_, std::convert::Infallible> =
            limiter.schedule(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn concurrency_two_admits_two_then_queues(
    ) {
        let limiter = RateLimiter::with_settings(
            Quota::new().with_concurrency(2),
            LimiterSettings {
                dispatch_tick: Duration::from_millis(10),
                ..LimiterSettings::default()
            },
        )
        .unwrap();

        let a = limiter.schedule(|| async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok::<_, std::convert::Infallible>(1)
        });
        let b = limiter.schedule(|| async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok::<_, std::convert::Infallible>(2)
        });
        let c = limiter.schedule(|| async { Ok::<_, std::convert::Infallible>(3) });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(limiter.active_count(), 2);

        let (ra, rb, rc) = tokio::join!(a, b, c);
        assert_eq!(ra.unwrap(), 1);
        assert_eq!(rb.unwrap(), 2);
        assert_eq!(rc.unwrap(), 3);
    }

    #[tokio::test]
    async fn deadline_rejection_advances_queue() {
        let limiter = RateLimiter::with_settings(
            Quota::new()
                .with_rate(1, Duration::from_millis(1000))
                .with_concurrency(1)
                .with_max_delay(Duration::from_millis(60)),
            LimiterSettings {
                dispatch_tick: Duration::from_millis(10),
                ..LimiterSettings::default()
            },
        )
        .unwrap();

        let first = limiter.schedule(|| async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            Ok::<_, std::convert::Infallible>("first")
        });
        let second = limiter.schedule(|| async { Ok::<_, std::convert::Infallible>("second") });
        let third = limiter.schedule(|| async { Ok::<_, std::convert::Infallible>("third") });

        let (first, second, third) = tokio::join!(first, second, third);
        assert_eq!(first.unwrap(), "first");
        assert!(second.unwrap_err().is_timeout());
        assert!(third.unwrap_err().is_timeout());

        // The limiter remains usable afterwards.
        let again = limiter
            .schedule(|| async { Ok::<_, std::convert::Infallible>("again") })
            .await;
        assert_eq!(again.unwrap(), "again");
    }

    #[tokio::test]
    async fn operation_errors_propagate_and_release_the_slot() {
        let limiter = RateLimiter::with_settings(
            Quota::new().with_concurrency(2),
            LimiterSettings {
                dispatch_tick: Duration::from_millis(10),
                ..LimiterSettings::default()
            },
        )
        .unwrap();

        let ok_a = limiter.schedule(|| async { Ok::<_, &'static str>(1) });
        let err_a = limiter.schedule(|| async { Err::<i32, _>("boom") });
        let ok_b = limiter.schedule(|| async { Ok::<_, &'static str>(2) });
        let err_b = limiter.schedule(|| async { Err::<i32, _>("bang") });
        let ok_c = limiter.schedule(|| async { Ok::<_, &'static str>(3) });

        let (ok_a, err_a, ok_b, err_b, ok_c) = tokio::join!(ok_a, err_a, ok_b, err_b, ok_c);
        assert_eq!(ok_a.unwrap(), 1);
        assert_eq!(ok_b.unwrap(), 2);
        assert_eq!(ok_c.unwrap(), 3);
        assert!(matches!(err_a.unwrap_err(), ScheduleError::Operation("boom")));
        assert!(matches!(err_b.unwrap_err(), ScheduleError::Operation("bang")));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(limiter.active_count(), 0);
    }

    #[test]
    fn invalid_quota_is_rejected_at_construction() {
        let mut quota = Quota::new();
        quota.rate = Some(5);
        assert!(RateLimiter::new(quota).is_err());
    }
}
