//! Bounded set of recently applied operation ids.
//!
//! ```text
//! record(op) ──► [ oldest ... newest ]   len > capacity ─► drop oldest 20%
//!                                        age >= ttl      ─► expire
//! ```
//!
//! Clock instants are passed in explicitly so the async layer can drive it
//! from the tokio clock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::RealtimeConfig;

/// Insertion-ordered, size- and age-bounded operation id set.
#[derive(Debug)]
pub struct OperationDeduplicator {
    order: VecDeque<(String, Instant)>,
    recorded: HashMap<String, Instant>,
    capacity: usize,
    evict_count: usize,
    ttl: Duration,
}

impl OperationDeduplicator {
    /// `evict_ratio` of the entries (at least one) are dropped when the set
    /// grows past `capacity`.
    pub fn new(capacity: usize, evict_ratio: f64, ttl: Duration) -> Self {
        let evict_count = ((capacity as f64 * evict_ratio).ceil() as usize).max(1);
        Self {
            order: VecDeque::with_capacity(capacity.min(4096) + 1),
            recorded: HashMap::new(),
            capacity,
            evict_count,
            ttl,
        }
    }

    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self::new(config.dedup_capacity, config.dedup_evict_ratio, config.dedup_ttl)
    }

    /// Whether `op` was recorded and has not yet expired.
    pub fn seen(&mut self, op: &str, now: Instant) -> bool {
        self.expire(now);
        self.recorded.contains_key(op)
    }

    /// Remember `op`. Recording an id twice keeps the original timestamp.
    pub fn record(&mut self, op: &str, now: Instant) {
        self.expire(now);
        if self.recorded.contains_key(op) {
            return;
        }
        self.recorded.insert(op.to_string(), now);
        self.order.push_back((op.to_string(), now));

        if self.order.len() > self.capacity {
            let n = self.evict_count.min(self.order.len());
            for (old, _) in self.order.drain(..n) {
                self.recorded.remove(&old);
            }
            log::debug!("dedup evicted {n} oldest operation ids");
        }
    }

    /// Drop entries older than the TTL. Returns how many were dropped.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut dropped = 0;
        while let Some((_, at)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.ttl {
                break;
            }
            if let Some((op, _)) = self.order.pop_front() {
                self.recorded.remove(&op);
                dropped += 1;
            }
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.recorded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Process-wide dedup scope, shared by every open document.
pub type SharedDeduplicator = Arc<Mutex<OperationDeduplicator>>;

/// The two tracking scopes consulted for each event: the process-wide one
/// and one owned by a single reconciler.
#[derive(Debug)]
pub struct DedupScopes {
    global: SharedDeduplicator,
    local: OperationDeduplicator,
}

impl DedupScopes {
    pub fn new(global: SharedDeduplicator, local: OperationDeduplicator) -> Self {
        Self { global, local }
    }

    /// Duplicate if either scope has seen the id.
    pub async fn seen(&mut self, op: &str, now: Instant) -> bool {
        if self.local.seen(op, now) {
            return true;
        }
        self.global.lock().await.seen(op, now)
    }

    /// Record in both scopes.
    pub async fn record(&mut self, op: &str, now: Instant) {
        self.local.record(op, now);
        self.global.lock().await.record(op, now);
    }

    pub fn local(&self) -> &OperationDeduplicator {
        &self.local
    }
}
