//! An in-process pub/sub transport: production-usable for a single-process
//! group of limiters (e.g. several tokio tasks sharing a quota without
//! Redis), and the transport of choice for tests that exercise the
//! coordination protocol deterministically.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;

use super::transport::{MessageStream, PubSubTransport};

const CHANNEL_CAPACITY: usize = 256;

/// A [`PubSubTransport`] backed by a `tokio::sync::broadcast` channel per
/// coordination-channel name. Always capable of producing an independent
/// subscriber, so construction never fails.
pub struct InMemoryTransport {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().expect("InMemoryTransport poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct BroadcastStream(broadcast::Receiver<String>);

#[async_trait]
impl MessageStream for BroadcastStream {
    async fn recv(&mut self) -> Option<String> {
        loop {
            match self.0.recv().await {
                Ok(payload) => return Some(payload),
                // A slow subscriber missed messages; the protocol is
                // heartbeat-driven and self-healing, so skip ahead rather
                // than stall on history that is already stale.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
impl PubSubTransport for InMemoryTransport {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // Mirrors Redis PUBLISH semantics: publishing with zero subscribers
        // is not an error.
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn MessageStream>> {
        Ok(Box::new(BroadcastStream(self.sender(channel).subscribe())))
    }
}
