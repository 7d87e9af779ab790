//! Broadcast relay seam.
//!
//! A relay fans named events out to every subscriber of a channel,
//! including the sender. Implementations: [`MemoryRelay`](crate::broadcast::MemoryRelay)
//! for in-process use and [`WsRelay`](crate::transport::WsRelay) over a
//! WebSocket relay server.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::protocol;

/// One event delivered on a relay channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub channel: String,
    pub event: String,
    pub payload: Vec<u8>,
    /// Stamped by the relay, strictly increasing per channel. 0 = unsequenced.
    pub seq: u64,
}

/// Pub/sub transport for presence and lock broadcasts.
#[async_trait]
pub trait BroadcastRelay: Send + Sync {
    /// Join a channel and receive every frame published on it from now on.
    async fn open_channel(&self, name: &str) -> Result<broadcast::Receiver<Arc<RelayFrame>>>;

    /// Publish one event. Fails if the channel is not open.
    async fn send(&self, channel: &str, event: &str, payload: Vec<u8>) -> Result<()>;

    /// Leave a channel.
    async fn close_channel(&self, name: &str) -> Result<()>;
}

/// Fire-and-forget publisher bound to one channel.
#[derive(Clone)]
pub struct Outbox {
    relay: Arc<dyn BroadcastRelay>,
    channel: String,
}

impl Outbox {
    pub fn new(relay: Arc<dyn BroadcastRelay>, channel: impl Into<String>) -> Self {
        Self {
            relay,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Encode and send. Failures are logged, never returned; callers treat
    /// broadcasts as best effort. Returns whether the send went through.
    pub async fn publish<T: Serialize + Sync>(&self, event: &str, msg: &T) -> bool {
        let payload = match protocol::encode(msg) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("{}: could not encode {event}: {e}", self.channel);
                return false;
            }
        };
        match self.relay.send(&self.channel, event, payload).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{}: {event} broadcast failed: {e}", self.channel);
                false
            }
        }
    }
}

/// Drops frames that arrive out of order or twice.
///
/// Unsequenced frames (seq 0) always pass.
#[derive(Debug, Default)]
pub struct SequenceGuard {
    last: HashMap<String, u64>,
}

impl SequenceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `frame` if its seq is newer than anything seen on its channel.
    pub fn accept(&mut self, frame: &RelayFrame) -> bool {
        if frame.seq == 0 {
            return true;
        }
        let last = self.last.entry(frame.channel.clone()).or_insert(0);
        if frame.seq <= *last {
            log::debug!("{}: stale frame seq={} (last {})", frame.channel, frame.seq, last);
            return false;
        }
        *last = frame.seq;
        true
    }

    pub fn last_seq(&self, channel: &str) -> Option<u64> {
        self.last.get(channel).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(channel: &str, seq: u64) -> RelayFrame {
        RelayFrame {
            channel: channel.into(),
            event: "presence".into(),
            payload: vec![],
            seq,
        }
    }

    #[test]
    fn test_sequence_guard_drops_stale() {
        let mut guard = SequenceGuard::new();
        assert!(guard.accept(&frame("a", 1)));
        assert!(guard.accept(&frame("a", 3)));
        assert!(!guard.accept(&frame("a", 2)));
        assert!(!guard.accept(&frame("a", 3)));
        assert_eq!(guard.last_seq("a"), Some(3));
    }

    #[test]
    fn test_sequence_guard_per_channel() {
        let mut guard = SequenceGuard::new();
        assert!(guard.accept(&frame("a", 5)));
        assert!(guard.accept(&frame("b", 1)));
        assert_eq!(guard.last_seq("c"), None);
    }

    #[test]
    fn test_unsequenced_always_accepted() {
        let mut guard = SequenceGuard::new();
        assert!(guard.accept(&frame("a", 4)));
        assert!(guard.accept(&frame("a", 0)));
        assert!(guard.accept(&frame("a", 0)));
    }
}
