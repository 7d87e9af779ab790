//! In-process fan-out for relay channels.
//!
//! Every channel is a tokio broadcast channel: one send reaches all
//! subscribers, each of which buffers up to `capacity` frames before it
//! starts lagging. [`RelayHub`] is shared by the WebSocket relay server and
//! by [`MemoryRelay`], the in-process [`BroadcastRelay`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::error::{RealtimeError, Result};
use crate::relay::{BroadcastRelay, RelayFrame};

/// Counters for one channel.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub frames_sent: u64,
    pub frames_unheard: u64,
    pub subscribers: usize,
}

/// Fan-out group for a single channel.
pub struct RelayGroup {
    name: String,
    sender: broadcast::Sender<Arc<RelayFrame>>,
    /// Held across stamping and `send`, so queue order is seq order.
    next_seq: std::sync::Mutex<u64>,
    frames_sent: AtomicU64,
    frames_unheard: AtomicU64,
    capacity: usize,
}

impl RelayGroup {
    /// `capacity` is clamped to at least 1.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.into(),
            sender,
            next_seq: std::sync::Mutex::new(1),
            frames_sent: AtomicU64::new(0),
            frames_unheard: AtomicU64::new(0),
            capacity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stamp the next sequence number and fan out. Returns the number of
    /// subscribers reached.
    pub fn publish(&self, event: &str, payload: Vec<u8>) -> usize {
        let mut next = self.next_seq.lock().unwrap_or_else(PoisonError::into_inner);
        let frame = RelayFrame {
            channel: self.name.clone(),
            event: event.to_string(),
            payload,
            seq: *next,
        };
        *next += 1;
        self.fan_out(Arc::new(frame))
    }

    fn fan_out(&self, frame: Arc<RelayFrame>) -> usize {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(frame) {
            Ok(n) => n,
            Err(_) => {
                self.frames_unheard.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RelayFrame>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_unheard: self.frames_unheard.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Maps channel names to fan-out groups.
pub struct RelayHub {
    groups: RwLock<HashMap<String, Arc<RelayGroup>>>,
    capacity: usize,
}

impl RelayHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<RelayGroup>> {
        self.groups.read().await.get(name).cloned()
    }

    pub async fn get_or_create(&self, name: &str) -> Arc<RelayGroup> {
        {
            let groups = self.groups.read().await;
            if let Some(group) = groups.get(name) {
                return group.clone();
            }
        }

        let mut groups = self.groups.write().await;
        // another task may have created it between the two locks
        if let Some(group) = groups.get(name) {
            return group.clone();
        }
        let group = Arc::new(RelayGroup::new(name, self.capacity));
        groups.insert(name.to_string(), group.clone());
        group
    }

    /// Drop a channel nobody listens to any more.
    pub async fn remove_if_unused(&self, name: &str) -> bool {
        let mut groups = self.groups.write().await;
        let unused = groups.get(name).is_some_and(|g| g.subscriber_count() == 0);
        if unused {
            groups.remove(name);
        }
        unused
    }

    pub async fn channel_count(&self) -> usize {
        self.groups.read().await.len()
    }

    pub async fn active_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// In-process [`BroadcastRelay`]. Clients sharing one hub see each other's
/// frames, so a test can run several "browsers" against one hub.
pub struct MemoryRelay {
    hub: Arc<RelayHub>,
    open: Mutex<HashSet<String>>,
    offline: AtomicBool,
}

impl MemoryRelay {
    pub fn new(hub: Arc<RelayHub>) -> Self {
        Self {
            hub,
            open: Mutex::new(HashSet::new()),
            offline: AtomicBool::new(false),
        }
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    /// Simulate a dropped connection: sends fail until set back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    pub async fn is_open(&self, name: &str) -> bool {
        self.open.lock().await.contains(name)
    }
}

#[async_trait]
impl BroadcastRelay for MemoryRelay {
    async fn open_channel(&self, name: &str) -> Result<broadcast::Receiver<Arc<RelayFrame>>> {
        let group = self.hub.get_or_create(name).await;
        self.open.lock().await.insert(name.to_string());
        Ok(group.subscribe())
    }

    async fn send(&self, channel: &str, event: &str, payload: Vec<u8>) -> Result<()> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(RealtimeError::Transport("relay offline".into()));
        }
        if !self.open.lock().await.contains(channel) {
            return Err(RealtimeError::ChannelClosed(channel.to_string()));
        }
        let group = self.hub.get_or_create(channel).await;
        let reached = group.publish(event, payload);
        log::trace!("{channel}: {event} reached {reached} subscriber(s)");
        Ok(())
    }

    async fn close_channel(&self, name: &str) -> Result<()> {
        if !self.open.lock().await.remove(name) {
            return Err(RealtimeError::ChannelClosed(name.to_string()));
        }
        self.hub.remove_if_unused(name).await;
        Ok(())
    }
}
