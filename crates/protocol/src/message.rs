//! Application messages carried over a connection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Header fields of a message. Keys are unique and kept sorted so that the
/// encoded form of a message is deterministic.
pub type Header = BTreeMap<String, String>;

/// An application message.
///
/// `id`, `sender` and `sender_service` describe where a message lives and who
/// sent it; `header` and `body` are the payload. Equality (`==`) compares every
/// field, [`Message::eq_content`] compares the payload only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Identifier assigned by the server (usually a cache id).
    #[serde(default)]
    pub id: String,
    /// Username of the originating identity. Empty when sent by the server.
    #[serde(default)]
    pub sender: String,
    /// Service of the originating identity.
    #[serde(default)]
    pub sender_service: String,
    /// Header fields.
    #[serde(default)]
    pub header: Header,
    /// Opaque body.
    #[serde(default, with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl Message {
    /// Creates a message with the given header and body.
    pub fn new(header: Header, body: Vec<u8>) -> Self {
        Self {
            header,
            body,
            ..Default::default()
        }
    }

    /// Creates a message with only a body.
    pub fn with_body(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Compares header and body only, ignoring id and sender identity.
    pub fn eq_content(&self, other: &Message) -> bool {
        self.header == other.header && self.body == other.body
    }

    /// Size of the payload used for digest and compression thresholds.
    ///
    /// Each header entry counts as `key NUL value NUL`, followed by the body.
    pub fn size(&self) -> usize {
        let header: usize = self
            .header
            .iter()
            .map(|(k, v)| k.len() + 1 + v.len() + 1)
            .sum();
        header + self.body.len()
    }

    /// Returns true if the message has neither header fields nor a body.
    pub fn is_empty(&self) -> bool {
        self.header.is_empty() && self.body.is_empty()
    }

    /// Encodes the message as MessagePack.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decodes a message from MessagePack.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
