//! Error types for the realtime core.
//!
//! Only the seams (relay, change feed, transport) return these. UI-facing
//! operations degrade to "state did not update" and log instead.

use thiserror::Error;

/// Errors raised by relay, feed and transport operations.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The underlying transport failed to deliver or subscribe
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation on a channel that is not (or no longer) open
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Unknown channel key in the lifecycle registry
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// A change event or broadcast payload was missing required fields
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Failed to encode a payload for the wire
    #[error("encode failed: {0}")]
    Encode(String),

    /// Failed to decode a payload from the wire
    #[error("decode failed: {0}")]
    Decode(String),

    /// Socket level failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RealtimeError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for RealtimeError {
    fn from(err: serde_json::Error) -> Self {
        RealtimeError::Malformed(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RealtimeError>;
