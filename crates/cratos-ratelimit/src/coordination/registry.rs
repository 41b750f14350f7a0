//! Flat peer membership table — §9's "peer graph with cycles" design note:
//! peers refer to each other only by id through this shared map, never by
//! structural pointer, so the membership graph is trivially serializable
//! and immune to lifetime cycles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::clock::Clock;

/// Tracks live peers on one coordination channel and decides when a silent
/// one has gone stale.
#[derive(Debug)]
pub struct PeerRegistry {
    self_id: Uuid,
    clock: Arc<dyn Clock>,
    expiry_horizon: Duration,
    peers: HashMap<Uuid, Instant>,
}

impl PeerRegistry {
    pub fn new(self_id: Uuid, clock: Arc<dyn Clock>, expiry_horizon: Duration) -> Self {
        Self {
            self_id,
            clock,
            expiry_horizon,
            peers: HashMap::new(),
        }
    }

    /// This instance's own id. Never present in `peers` — self is tracked
    /// implicitly by the `+1` in `group_size`.
    pub fn self_id(&self) -> Uuid {
        self.self_id
    }

    /// Record that `id` was just heard from. Returns `true` if `id` is new
    /// to the registry (the caller should reply with a `WELCOME`).
    pub fn observe(&mut self, id: Uuid) -> bool {
        if id == self.self_id {
            return false;
        }
        let is_new = !self.peers.contains_key(&id);
        self.peers.insert(id, self.clock.now());
        is_new
    }

    /// Drop any peer whose `lastHeardAt` is older than the expiry horizon.
    /// Returns the evicted ids.
    pub fn evict_stale(&mut self) -> Vec<Uuid> {
        let now = self.clock.now();
        let horizon = self.expiry_horizon;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, last_heard)| now.duration_since(**last_heard) >= horizon)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    /// Explicitly remove a peer (e.g. on receiving `GOODBYE`).
    pub fn remove(&mut self, id: Uuid) {
        self.peers.remove(&id);
    }

    /// Group size including self.
    pub fn group_size(&self) -> u32 {
        self.peers.len() as u32 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn self_is_never_tracked_as_a_peer() {
        let self_id = Uuid::new_v4();
        let clock = Arc::new(ManualClock::new());
        let mut registry = PeerRegistry::new(self_id, clock, Duration::from_secs(3));
        registry.observe(self_id);
        assert_eq!(registry.group_size(), 1);
    }

    #[test]
    fn observe_reports_only_genuinely_new_peers() {
        let clock = Arc::new(ManualClock::new());
        let mut registry = PeerRegistry::new(Uuid::new_v4(), clock, Duration::from_secs(3));
        let peer = Uuid::new_v4();
        assert!(registry.observe(peer));
        assert!(!registry.observe(peer));
        assert_eq!(registry.group_size(), 2);
    }

    #[test]
    fn stale_peers_are_evicted_past_the_horizon() {
        let clock = Arc::new(ManualClock::new());
        let mut registry = PeerRegistry::new(Uuid::new_v4(), clock.clone(), Duration::from_millis(300));
        let peer = Uuid::new_v4();
        registry.observe(peer);
        assert_eq!(registry.group_size(), 2);

        clock.advance(Duration::from_millis(301));
        let evicted = registry.evict_stale();
        assert_eq!(evicted, vec![peer]);
        assert_eq!(registry.group_size(), 1);
    }

    #[test]
    fn heartbeats_before_the_horizon_keep_a_peer_alive() {
        let clock = Arc::new(ManualClock::new());
        let mut registry = PeerRegistry::new(Uuid::new_v4(), clock.clone(), Duration::from_millis(300));
        let peer = Uuid::new_v4();
        registry.observe(peer);

        clock.advance(Duration::from_millis(200));
        registry.observe(peer);
        clock.advance(Duration::from_millis(200));
        assert!(registry.evict_stale().is_empty());
        assert_eq!(registry.group_size(), 2);
    }
}
