//! The pub/sub transport abstraction the coordination protocol runs on.
//!
//! Modeled as a trait, the way the rest of this corpus swaps storage
//! backends behind one trait (`SessionStore` behind `RedisStore`/
//! `MemoryStore`): production code talks to [`RedisTransport`]; tests
//! substitute an in-process transport with no live Redis required.

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use crate::error::{RateLimiterError, Result};

/// A subscription handle yielding raw message payloads.
#[async_trait]
pub trait MessageStream: Send {
    /// The next message, or `None` once the subscription ends.
    async fn recv(&mut self) -> Option<String>;
}

/// Publish/subscribe transport for the coordination channel.
///
/// Implementors must be able to produce a dedicated subscriber connection,
/// independent of the one used for publishing — most pub/sub clients block
/// non-subscription commands on a connection that is actively subscribed.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Publish `payload` to `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to `channel` on a dedicated connection.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn MessageStream>>;
}

/// Production transport backed by a `redis::Client`.
pub struct RedisTransport {
    client: redis::Client,
    publish_conn: redis::aio::MultiplexedConnection,
}

impl RedisTransport {
    /// Build a transport from a `redis::Client`, validating up front that it
    /// can produce an independent subscriber connection. Fails with
    /// [`RateLimiterError::UnsupportedClient`] otherwise.
    pub async fn new(client: redis::Client) -> Result<Self> {
        let publish_conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RateLimiterError::Transport(e.to_string()))?;

        // A dedicated subscriber connection must be obtainable independent
        // of `publish_conn`; if the client can't produce one, construction
        // fails fast rather than deadlocking the first `subscribe` call.
        client
            .get_async_pubsub()
            .await
            .map_err(|_| RateLimiterError::UnsupportedClient)?;

        Ok(Self { client, publish_conn })
    }
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.publish_conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| RateLimiterError::Transport(format!("PUBLISH failed: {e}")))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn MessageStream>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| RateLimiterError::Transport(format!("subscriber connection failed: {e}")))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| RateLimiterError::Transport(format!("SUBSCRIBE failed: {e}")))?;
        debug!(channel, "subscribed to coordination channel");
        Ok(Box::new(RedisMessageStream {
            stream: Box::pin(pubsub.into_on_message()),
        }))
    }
}

struct RedisMessageStream {
    stream: std::pin::Pin<Box<dyn futures::Stream<Item = redis::Msg> + Send>>,
}

#[async_trait]
impl MessageStream for RedisMessageStream {
    async fn recv(&mut self) -> Option<String> {
        let msg = self.stream.next().await?;
        msg.get_payload().ok()
    }
}


// Redis tests require a running Redis instance.
// Run with: cargo test --features redis-tests
#[cfg(feature = "redis-tests")]
mod redis_tests {
    use super::{PubSubTransport, RedisTransport};

    #[tokio::test]
    async fn redis_transport_delivers_published_messages() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let transport = RedisTransport::new(client).await.unwrap();

        let mut stream = transport.subscribe("cratos-ratelimit:test").await.unwrap();
        transport
            .publish("cratos-ratelimit:test", "hello")
            .await
            .unwrap();
        assert_eq!(stream.recv().await, Some("hello".to_string()));
    }
}
