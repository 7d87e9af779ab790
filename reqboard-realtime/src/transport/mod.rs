//! WebSocket transport for the broadcast relay.
//!
//! ```text
//! WsRelay ──Subscribe/Broadcast──► RelayServer ── RelayHub ──┐
//!    ▲                                                       │
//!    └──────────────── Broadcast (seq stamped) ◄─────────────┘
//! ```
//!
//! Every WebSocket binary message is one bincode-encoded [`RelayEnvelope`].

pub mod client;
pub mod server;

pub use client::{ConnectionState, WsRelay};
pub use server::{RelayServer, RelayServerConfig, RelayServerStats};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol;
use crate::relay::RelayFrame;

/// Envelope discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Client → server: start receiving a channel
    Subscribe,
    /// Client → server: stop receiving a channel
    Unsubscribe,
    /// Both directions: an event on a channel
    Broadcast,
    Ping,
    Pong,
    /// Server → client: a Subscribe was refused; `event` holds the reason
    Rejected,
}

/// One relay wire message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub kind: EnvelopeKind,
    pub channel: String,
    pub event: String,
    pub payload: Vec<u8>,
    /// Set by the server on outgoing broadcasts.
    pub seq: u64,
}

impl RelayEnvelope {
    fn control(kind: EnvelopeKind, channel: &str) -> Self {
        Self {
            kind,
            channel: channel.to_string(),
            event: String::new(),
            payload: Vec::new(),
            seq: 0,
        }
    }

    pub fn subscribe(channel: &str) -> Self {
        Self::control(EnvelopeKind::Subscribe, channel)
    }

    pub fn unsubscribe(channel: &str) -> Self {
        Self::control(EnvelopeKind::Unsubscribe, channel)
    }

    pub fn ping() -> Self {
        Self::control(EnvelopeKind::Ping, "")
    }

    pub fn pong() -> Self {
        Self::control(EnvelopeKind::Pong, "")
    }

    pub fn rejected(channel: &str, reason: &str) -> Self {
        Self {
            event: reason.to_string(),
            ..Self::control(EnvelopeKind::Rejected, channel)
        }
    }

    pub fn broadcast(channel: &str, event: &str, payload: Vec<u8>) -> Self {
        Self {
            kind: EnvelopeKind::Broadcast,
            channel: channel.to_string(),
            event: event.to_string(),
            payload,
            seq: 0,
        }
    }

    pub fn from_frame(frame: &RelayFrame) -> Self {
        Self {
            kind: EnvelopeKind::Broadcast,
            channel: frame.channel.clone(),
            event: frame.event.clone(),
            payload: frame.payload.clone(),
            seq: frame.seq,
        }
    }

    pub fn into_frame(self) -> RelayFrame {
        RelayFrame {
            channel: self.channel,
            event: self.event,
            payload: self.payload,
            seq: self.seq,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        protocol::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        protocol::decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_conversion_keeps_sequence() {
        let frame = RelayFrame {
            channel: "doc:1:presence".into(),
            event: "lock".into(),
            payload: vec![1, 2],
            seq: 42,
        };
        let env = RelayEnvelope::from_frame(&frame);
        assert_eq!(env.kind, EnvelopeKind::Broadcast);
        let bytes = env.encode().unwrap();
        assert_eq!(RelayEnvelope::decode(&bytes).unwrap().into_frame(), frame);
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(RelayEnvelope::decode(&[]).is_err());
        assert!(RelayEnvelope::decode(&[9]).is_err());
    }
}
