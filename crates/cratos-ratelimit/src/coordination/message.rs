//! Wire format for the coordination channel.
//!
//! Payloads are small JSON records, encoded with `serde_json` the same way
//! the rest of this corpus encodes values handed to Redis.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message exchanged between peers sharing a quota on one channel.
///
/// `t` is an optional sender-side monotonic timestamp, carried only for
/// diagnostics — it plays no role in the protocol itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CoordinationMessage {
    /// Broadcast on startup and repeated every heartbeat interval.
    #[serde(rename = "HELLO")]
    Hello {
        id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        t: Option<u64>,
    },
    /// Sent by an already-running peer when it sees a `HELLO` from an
    /// id it doesn't yet know, to teach the newcomer about this peer.
    #[serde(rename = "WELCOME")]
    Welcome {
        id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        t: Option<u64>,
    },
    /// Broadcast on explicit unregister.
    #[serde(rename = "GOODBYE")]
    Goodbye {
        id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        t: Option<u64>,
    },
}

impl CoordinationMessage {
    /// The sender id carried by any variant.
    pub fn id(&self) -> Uuid {
        match self {
            CoordinationMessage::Hello { id, .. }
            | CoordinationMessage::Welcome { id, .. }
            | CoordinationMessage::Goodbye { id, .. } => *id,
        }
    }

    pub fn hello(id: Uuid) -> Self {
        Self::Hello { id, t: None }
    }

    pub fn welcome(id: Uuid) -> Self {
        Self::Welcome { id, t: None }
    }

    pub fn goodbye(id: Uuid) -> Self {
        Self::Goodbye { id, t: None }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("CoordinationMessage always serializes")
    }

    pub fn from_json(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }
}
