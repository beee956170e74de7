//! Wire message model.
//!
//! Every message on the socket is one JSON object:
//!
//! ```text
//! {"Type": <int>, "Data": "<string>"}
//! ```
//!
//! `Type` follows `Heartbeat=0, Disconnect=1, Data=2, Invalid=3`. In Rust the
//! envelope is a tagged enum; the integer form only exists at the serde
//! boundary.

use serde::{Deserialize, Serialize};

/// Numeric message type carried in the `Type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Liveness probe or reply.
    Heartbeat = 0,
    /// Teardown request or acknowledgment.
    Disconnect = 1,
    /// Application payload.
    Data = 2,
    /// Default/failure sentinel, never intentionally sent.
    Invalid = 3,
}

impl MessageType {
    /// Map a raw `Type` value, treating anything unknown as `Invalid`.
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            0 => Self::Heartbeat,
            1 => Self::Disconnect,
            2 => Self::Data,
            _ => Self::Invalid,
        }
    }
}

/// The typed envelope exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Envelope", into = "Envelope")]
pub enum WireMessage {
    /// Heartbeat request (client) or reply (server).
    Heartbeat(String),
    /// Disconnect request (client) or acknowledgment (server).
    Disconnect(String),
    /// Application data.
    Data(String),
    /// Anything that could not be classified.
    Invalid(String),
}

impl WireMessage {
    /// Numeric type of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Heartbeat(_) => MessageType::Heartbeat,
            Self::Disconnect(_) => MessageType::Disconnect,
            Self::Data(_) => MessageType::Data,
            Self::Invalid(_) => MessageType::Invalid,
        }
    }

    /// Payload carried by this message.
    pub fn payload(&self) -> &str {
        match self {
            Self::Heartbeat(p) | Self::Disconnect(p) | Self::Data(p) | Self::Invalid(p) => p,
        }
    }

    fn into_payload(self) -> String {
        match self {
            Self::Heartbeat(p) | Self::Disconnect(p) | Self::Data(p) | Self::Invalid(p) => p,
        }
    }
}

impl Default for WireMessage {
    fn default() -> Self {
        Self::Invalid(String::new())
    }
}

/// Serde shape of a message as it appears on the wire.
///
/// Field names are capitalised to stay compatible with existing peers.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "Type", default = "invalid_type")]
    kind: i64,
    #[serde(rename = "Data", default)]
    data: Option<String>,
}

fn invalid_type() -> i64 {
    MessageType::Invalid as i64
}

impl From<Envelope> for WireMessage {
    fn from(envelope: Envelope) -> Self {
        let payload = envelope.data.unwrap_or_default();
        match MessageType::from_raw(envelope.kind) {
            MessageType::Heartbeat => Self::Heartbeat(payload),
            MessageType::Disconnect => Self::Disconnect(payload),
            MessageType::Data => Self::Data(payload),
            MessageType::Invalid => Self::Invalid(payload),
        }
    }
}

impl From<WireMessage> for Envelope {
    fn from(message: WireMessage) -> Self {
        let kind = message.message_type() as i64;
        Self {
            kind,
            data: Some(message.into_payload()),
        }
    }
}
