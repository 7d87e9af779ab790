//! # reqboard-realtime: realtime collaboration core for ReqBoard
//!
//! Keeps a client's local view of a requirements document in step with the
//! database change feed and with the other people editing it.
//!
//! ## Architecture
//!
//! ```text
//!   change feed (rows)                     broadcast relay (events)
//!          │                                        ▲   │
//!          ▼                                        │   ▼
//! ┌──────────────────┐   dedup   ┌───────────┐  ┌────────────────────┐
//! │ ChangeReconciler │ ────────► │ Collection│  │ PresenceBroadcaster│
//! │ (per document)   │           │ Cache     │  │ LockCoordinator    │
//! └────────┬─────────┘           └───────────┘  └─────────┬──────────┘
//!          │                                              │
//!          └────────── ChannelRegistry (ref-counted) ─────┘
//!                               │
//!                      DocumentSubscription ◄── UI
//! ```
//!
//! ## Modules
//!
//! - [`dedup`]: bounded, TTL'd operation id set (two scopes)
//! - [`reconciler`]: applies change events to the [`cache`]
//! - [`presence`]: who is here and where their cursor is
//! - [`lock`]: optimistic entity locks
//! - [`channels`]: reference-counted channel lifecycle
//! - [`throttle`]: trailing-edge throttled projections
//! - [`relay`] / [`feed`]: the two transport seams, with in-memory
//!   implementations in [`broadcast`] and [`feed`]
//! - [`transport`]: WebSocket relay server and client
//! - [`session`]: the context and per-document subscription handed to UI code

/// Log a reconciliation decision: `info` when the debug flag is set,
/// `debug` otherwise.
macro_rules! decision {
    ($debug:expr, $($arg:tt)+) => {
        if $debug {
            log::info!(target: "reqboard_realtime::decisions", $($arg)+);
        } else {
            log::debug!(target: "reqboard_realtime::decisions", $($arg)+);
        }
    };
}

pub mod broadcast;
pub mod cache;
pub mod channels;
pub mod config;
pub mod dedup;
pub mod error;
pub mod feed;
pub mod lock;
pub mod presence;
pub mod protocol;
pub mod reconciler;
pub mod relay;
pub mod session;
pub mod throttle;
pub mod transport;

/// Current instant on the tokio clock, so paused-time tests drive the
/// dedup TTL, heartbeats and throttles consistently.
pub(crate) fn clock_now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

pub use broadcast::{MemoryRelay, RelayHub};
pub use cache::{CacheKey, Entity};
pub use config::RealtimeConfig;
pub use error::{RealtimeError, Result};
pub use feed::{ChangeFeed, ChangeFilter, MemoryChangeFeed};
pub use lock::LockRecord;
pub use presence::Collaborator;
pub use protocol::{
    ChangeType, ChannelPurpose, ClientId, CursorPosition, DocumentId, EntityKind, LockKind, RawChange,
    UserId, UserProfile,
};
pub use reconciler::ApplyOutcome;
pub use relay::{BroadcastRelay, RelayFrame};
pub use session::{DocumentSubscription, LocalIdentity, RealtimeContext};
pub use throttle::{Throttle, ThrottledProjection};
pub use transport::{RelayServer, RelayServerConfig, WsRelay};
