//! The peer-coordination protocol: §4.2's `HELLO`/`WELCOME`/`GOODBYE`
//! exchange over a pub/sub channel, and the transport abstraction it runs on.

mod memory_transport;
mod message;
mod registry;
mod transport;

pub use memory_transport::InMemoryTransport;
pub use message::CoordinationMessage;
pub use registry::PeerRegistry;
pub use transport::{MessageStream, PubSubTransport, RedisTransport};
