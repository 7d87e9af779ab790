//! Tunables for the realtime core.

use std::time::Duration;

/// Configuration shared by every document opened through a
/// [`RealtimeContext`](crate::session::RealtimeContext).
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Maximum operation ids tracked per dedup scope
    pub dedup_capacity: usize,
    /// Fraction of the oldest entries evicted when the capacity is exceeded
    pub dedup_evict_ratio: f64,
    /// Operation ids are forgotten after this long
    pub dedup_ttl: Duration,
    /// Interval between "active" presence re-broadcasts
    pub heartbeat_interval: Duration,
    /// Peers silent for longer than this are evicted by the sweep
    pub presence_timeout: Duration,
    /// How often the presence sweep runs
    pub sweep_interval: Duration,
    /// Minimum spacing of outgoing cursor broadcasts
    pub cursor_throttle: Duration,
    /// Buffer size of each change-feed subscription
    pub feed_buffer: usize,
    /// Promote join/leave/lock/dedup decision lines to `info`
    pub debug: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_secs(30);
        Self {
            dedup_capacity: 1000,
            dedup_evict_ratio: 0.2,
            dedup_ttl: Duration::from_secs(5 * 60),
            heartbeat_interval,
            presence_timeout: heartbeat_interval * 2,
            sweep_interval: Duration::from_secs(10),
            cursor_throttle: Duration::from_millis(50),
            feed_buffer: 256,
            debug: false,
        }
    }
}

impl RealtimeConfig {
    /// Enable decision logging at `info` level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Override the heartbeat interval; the liveness timeout follows at 2x.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.presence_timeout = interval * 2;
        self
    }
}
