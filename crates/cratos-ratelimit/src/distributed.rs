//! The distributed quota manager: §4.2's peer-coordination protocol.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::coordination::{CoordinationMessage, PeerRegistry, PubSubTransport};
use crate::error::Result;
use crate::local::{LocalQuotaManager, QuotaManager};
use crate::quota::{Quota, SharedQuota};
use crate::settings::LimiterSettings;

/// Wraps a [`LocalQuotaManager`] and replaces its quota with this
/// instance's *share* of `configured`, recomputed as peers join, leave, or
/// go silent past the expiry horizon.
///
/// All [`QuotaManager`] operations delegate to the wrapped local manager;
/// only the effective quota it enforces changes underneath it.
pub struct DistributedQuotaManager {
    local: Arc<LocalQuotaManager>,
    self_id: Uuid,
    ready_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    transport: Arc<dyn PubSubTransport>,
    channel: String,
}

impl DistributedQuotaManager {
    /// Join the coordination group on `channel`, sharing `configured`
    /// across every instance that also joins it.
    ///
    /// Fails only if `transport` cannot be used at all; day-to-day
    /// transport errors after construction are logged and self-heal via
    /// the next heartbeat.
    pub async fn new(
        configured: Quota,
        channel: impl Into<String>,
        transport: Arc<dyn PubSubTransport>,
        settings: LimiterSettings,
    ) -> Result<Self> {
        configured.validate()?;
        let channel = channel.into();
        let self_id = Uuid::new_v4();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let starting_quota = if configured.fast_start {
            configured
        } else {
            configured.undiscovered()
        };
        let shared_quota = SharedQuota::new(starting_quota);
        let local = Arc::new(LocalQuotaManager::with_shared_quota(shared_quota.clone(), clock.clone()));

        let registry = Arc::new(std::sync::Mutex::new(PeerRegistry::new(
            self_id,
            clock,
            settings.expiry_horizon(),
        )));

        let (ready_tx, ready_rx) = watch::channel(configured.fast_start);
        let cancel = CancellationToken::new();

        let stream = transport.subscribe(&channel).await?;
        transport
            .publish(&channel, &CoordinationMessage::hello(self_id).to_json())
            .await
            .unwrap_or_else(|e| warn!(error = %e, "initial HELLO publish failed, will retry on next heartbeat"));

        spawn_protocol_task(ProtocolTask {
            self_id,
            channel: channel.clone(),
            configured,
            shared_quota,
            registry,
            transport: transport.clone(),
            stream,
            settings,
            ready_tx,
            cancel: cancel.clone(),
        });

        Ok(Self {
            local,
            self_id,
            ready_rx,
            cancel,
            transport,
            channel,
        })
    }

    /// This instance's id on the coordination channel.
    pub fn self_id(&self) -> Uuid {
        self.self_id
    }

    /// Resolves once this instance is READY: either immediately (if
    /// `fast_start`), or once the discovery window has elapsed and the
    /// post-ready quiescence delay has passed.
    pub async fn ready(&self) {
        let mut rx = self.ready_rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Broadcast `GOODBYE` and stop participating in the protocol. The
    /// wrapped local manager keeps working with whatever share it last
    /// held; it is the caller's responsibility to stop scheduling new work
    /// through it.
    pub async fn unregister(&self) {
        self.cancel.cancel();
        if let Err(e) = self
            .transport
            .publish(&self.channel, &CoordinationMessage::goodbye(self.self_id).to_json())
            .await
        {
            warn!(error = %e, "GOODBYE publish failed");
        }
    }
}

impl QuotaManager for DistributedQuotaManager {
    fn try_start(&self) -> bool {
        self.local.try_start()
    }

    fn end(&self) {
        self.local.end()
    }

    fn active_count(&self) -> u32 {
        self.local.active_count()
    }

    fn quota(&self) -> Quota {
        self.local.quota()
    }
}

impl Drop for DistributedQuotaManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ProtocolTask {
    self_id: Uuid,
    channel: String,
    configured: Quota,
    shared_quota: SharedQuota,
    registry: Arc<std::sync::Mutex<PeerRegistry>>,
    transport: Arc<dyn PubSubTransport>,
    stream: Box<dyn crate::coordination::MessageStream>,
    settings: LimiterSettings,
    ready_tx: watch::Sender<bool>,
    cancel: CancellationToken,
}

fn recompute_share(configured: &Quota, group_size: u32, shared_quota: &SharedQuota) {
    let share = configured.share(group_size);
    debug!(group_size, rate = ?share.rate, concurrency = ?share.concurrency, "recomputed share");
    if let Some(configured_rate) = configured.rate {
        if configured_rate > 0 && share.rate == Some(0) {
            warn!(group_size, "share floored to zero rate; calls will queue or time out");
        }
    }
    if let Some(configured_concurrency) = configured.concurrency {
        if configured_concurrency > 0 && share.concurrency == Some(0) {
            warn!(group_size, "share floored to zero concurrency; calls will queue or time out");
        }
    }
    shared_quota.set(share);
}

fn spawn_protocol_task(mut task: ProtocolTask) {
    tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(task.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut housekeeping = tokio::time::interval(task.settings.expiry_horizon().max(task.settings.heartbeat_interval));
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut discovery_deadline: Option<std::pin::Pin<Box<tokio::time::Sleep>>> = if task.configured.fast_start {
            None
        } else {
            Some(Box::pin(tokio::time::sleep(task.settings.discovery_window())))
        };

        loop {
            tokio::select! {
                _ = task.cancel.cancelled() => {
                    debug!(self_id = %task.self_id, "protocol task cancelled");
                    break;
                }
                _ = heartbeat.tick() => {
                    let msg = CoordinationMessage::hello(task.self_id).to_json();
                    if let Err(e) = task.transport.publish(&task.channel, &msg).await {
                        warn!(error = %e, "HELLO publish failed, will retry next heartbeat");
                    }
                }
                _ = housekeeping.tick() => {
                    let evicted = {
                        let mut registry = task.registry.lock().expect("registry poisoned");
                        let evicted = registry.evict_stale();
                        if !evicted.is_empty() {
                            recompute_share(&task.configured, registry.group_size(), &task.shared_quota);
                        }
                        evicted
                    };
                    for id in evicted {
                        info!(peer_id = %id, "peer expired");
                    }
                }
                _ = wait_discovery_deadline(&mut discovery_deadline), if discovery_deadline.is_some() => {
                    info!(self_id = %task.self_id, "discovery window elapsed, entering READY");
                    {
                        let registry = task.registry.lock().expect("registry poisoned");
                        recompute_share(&task.configured, registry.group_size(), &task.shared_quota);
                    }
                    tokio::time::sleep(task.settings.ready_quiescence).await;
                    let _ = task.ready_tx.send(true);
                    discovery_deadline = None;
                }
                maybe_payload = task.stream.recv() => {
                    let is_ready = discovery_deadline.is_none();
                    match maybe_payload {
                        Some(payload) => handle_message(&mut task, &payload, is_ready).await,
                        None => {
                            warn!(self_id = %task.self_id, "coordination subscription ended");
                            break;
                        }
                    }
                }
            }
        }
    });
}

/// Awaits the discovery deadline if one is pending, otherwise never resolves
/// — lets the `select!` arm above be conditioned on `is_some()`.
async fn wait_discovery_deadline(deadline: &mut Option<std::pin::Pin<Box<tokio::time::Sleep>>>) {
    match deadline.as_mut() {
        Some(sleep) => sleep.await,
        None => std::future::pending().await,
    }
}

/// Updates the peer registry for any incoming message, but only pushes a
/// recomputed share while READY (`is_ready`). While still DISCOVERING, the
/// quota stays at `Quota::undiscovered()` regardless of what's learned here
/// — the first real share is computed once by the "discovery window
/// elapsed" branch in `spawn_protocol_task`, after the true peer count is
/// known.
async fn handle_message(task: &mut ProtocolTask, payload: &str, is_ready: bool) {
    let Some(message) = CoordinationMessage::from_json(payload) else {
        return;
    };
    if message.id() == task.self_id {
        return;
    }

    match message {
        CoordinationMessage::Hello { id, .. } => {
            let is_new = {
                let mut registry = task.registry.lock().expect("registry poisoned");
                registry.observe(id)
            };
            if is_new {
                info!(peer_id = %id, "peer discovered via HELLO");
                let welcome = CoordinationMessage::welcome(task.self_id).to_json();
                if let Err(e) = task.transport.publish(&task.channel, &welcome).await {
                    warn!(error = %e, "WELCOME publish failed");
                }
                if is_ready {
                    let group_size = task.registry.lock().expect("registry poisoned").group_size();
                    recompute_share(&task.configured, group_size, &task.shared_quota);
                }
            }
        }
        CoordinationMessage::Welcome { id, .. } => {
            let is_new = {
                let mut registry = task.registry.lock().expect("registry poisoned");
                registry.observe(id)
            };
            if is_new {
                info!(peer_id = %id, "peer discovered via WELCOME");
                if is_ready {
                    let group_size = task.registry.lock().expect("registry poisoned").group_size();
                    recompute_share(&task.configured, group_size, &task.shared_quota);
                }
            }
        }
        CoordinationMessage::Goodbye { id, .. } => {
            let mut registry = task.registry.lock().expect("registry poisoned");
            registry.remove(id);
            let group_size = registry.group_size();
            drop(registry);
            info!(peer_id = %id, "peer departed via GOODBYE");
            if is_ready {
                recompute_share(&task.configured, group_size, &task.shared_quota);
            }
        }
    }
}
