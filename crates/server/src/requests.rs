//! Requests handed from connections to the rest of the server.
//!
//! These are JSON-serializable so an embedding application can queue them
//! outside the process.

use std::time::Duration;

use protocol::{Header, Message};
use serde::{Deserialize, Serialize};

/// A request to relay a message to another identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub receiver: String,
    #[serde(rename = "service")]
    pub receiver_service: String,
    /// How long the message may wait in the cache. Zero means forever.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    /// The message, already stamped with the sender's identity.
    #[serde(rename = "msg")]
    pub message: Message,
}

/// A request to subscribe to (or unsubscribe from) a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub subscribe: bool,
    pub service: String,
    pub username: String,
    pub params: Header,
}

/// A message a client sent to the server itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub service: String,
    pub username: String,
    pub message: Message,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ttl: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(ttl.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
