//! Presence & cursor tracking for one document room.
//!
//! ## Peer lifecycle
//!
//! ```text
//! unknown ──Joined──► joined ──Active──► active ─┐
//!    │                  │                  ▲     │ Active (heartbeat)
//!    └──Active──────────┼──────────────────┘◄────┘
//!                       │
//!          Left / heartbeat older than timeout
//!                       ▼
//!                    removed
//! ```
//!
//! `Cursor` messages only move a known peer's cursor; they never refresh the
//! heartbeat. Messages carrying the local user id are ignored.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};

use crate::protocol::{CursorPosition, PresenceMessage, UserId, UserProfile, PRESENCE_EVENT};
use crate::relay::Outbox;

// ───────────────────────────────────────────────────────────────────
// Records
// ───────────────────────────────────────────────────────────────────

/// A remote collaborator currently viewing the document.
#[derive(Debug, Clone)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub cursor: Option<CursorPosition>,
    pub last_heartbeat: Instant,
}

impl PresenceRecord {
    fn from_profile(user: &UserProfile, now: Instant) -> Self {
        Self {
            user_id: user.user_id,
            display_name: user.display_name.clone(),
            avatar_url: user.avatar_url.clone(),
            cursor: None,
            last_heartbeat: now,
        }
    }

    /// Time since the last join/heartbeat.
    pub fn heartbeat_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        self.heartbeat_age(now) > timeout
    }
}

/// Render-facing view of a collaborator. Heartbeat timing is left out so a
/// heartbeat alone never looks like a change.
#[derive(Debug, Clone, PartialEq)]
pub struct Collaborator {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub cursor: Option<CursorPosition>,
}

impl From<&PresenceRecord> for Collaborator {
    fn from(r: &PresenceRecord) -> Self {
        Self {
            user_id: r.user_id,
            display_name: r.display_name.clone(),
            avatar_url: r.avatar_url.clone(),
            cursor: r.cursor.clone(),
        }
    }
}

/// Effect of one incoming presence message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Joined(UserId),
    Refreshed(UserId),
    CursorMoved(UserId),
    Left(UserId),
    Ignored,
}

// ───────────────────────────────────────────────────────────────────
// Room state machine
// ───────────────────────────────────────────────────────────────────

/// Presence state of one document as seen by the local user.
pub struct PresenceRoom {
    local: UserProfile,
    peers: HashMap<UserId, PresenceRecord>,
    local_cursor: Option<CursorPosition>,
    timeout: Duration,
}

impl PresenceRoom {
    /// `timeout` is the heartbeat age beyond which a peer is swept.
    pub fn new(local: UserProfile, timeout: Duration) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            local_cursor: None,
            timeout,
        }
    }

    /// Apply a message received from the relay.
    pub fn handle_message(&mut self, msg: &PresenceMessage, now: Instant) -> PresenceChange {
        if msg.user_id() == self.local.user_id {
            return PresenceChange::Ignored;
        }

        match msg {
            PresenceMessage::Joined { user, cursor } | PresenceMessage::Active { user, cursor } => {
                let is_new = !self.peers.contains_key(&user.user_id);
                let record = self
                    .peers
                    .entry(user.user_id)
                    .or_insert_with(|| PresenceRecord::from_profile(user, now));
                record.display_name = user.display_name.clone();
                record.avatar_url = user.avatar_url.clone();
                record.last_heartbeat = now;
                if let Some(pos) = cursor {
                    record.cursor = Some(pos.clone());
                }
                if is_new {
                    PresenceChange::Joined(user.user_id)
                } else {
                    PresenceChange::Refreshed(user.user_id)
                }
            }

            PresenceMessage::Cursor { user_id, position } => match self.peers.get_mut(user_id) {
                Some(record) => {
                    record.cursor = Some(position.clone());
                    PresenceChange::CursorMoved(*user_id)
                }
                // no profile yet; wait for the next heartbeat
                None => PresenceChange::Ignored,
            },

            PresenceMessage::Left { user_id } => match self.peers.remove(user_id) {
                Some(_) => PresenceChange::Left(*user_id),
                None => PresenceChange::Ignored,
            },
        }
    }

    /// Remove peers whose heartbeat is older than the timeout.
    pub fn sweep(&mut self, now: Instant) -> Vec<UserId> {
        let timeout = self.timeout;
        let stale: Vec<UserId> = self
            .peers
            .values()
            .filter(|p| p.is_stale(now, timeout))
            .map(|p| p.user_id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn join_message(&self) -> PresenceMessage {
        PresenceMessage::Joined {
            user: self.local.clone(),
            cursor: self.local_cursor.clone(),
        }
    }

    pub fn heartbeat_message(&self) -> PresenceMessage {
        PresenceMessage::Active {
            user: self.local.clone(),
            cursor: self.local_cursor.clone(),
        }
    }

    pub fn leave_message(&self) -> PresenceMessage {
        PresenceMessage::Left {
            user_id: self.local.user_id,
        }
    }

    /// Record the local cursor and build its broadcast.
    pub fn cursor_message(&mut self, position: CursorPosition) -> PresenceMessage {
        self.local_cursor = Some(position.clone());
        PresenceMessage::Cursor {
            user_id: self.local.user_id,
            position,
        }
    }

    pub fn peer(&self, user_id: &UserId) -> Option<&PresenceRecord> {
        self.peers.get(user_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Collaborators ordered by display name, then id.
    pub fn collaborators(&self) -> Vec<Collaborator> {
        let mut list: Vec<Collaborator> = self.peers.values().map(Collaborator::from).collect();
        list.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        list
    }

    pub fn local_user(&self) -> &UserProfile {
        &self.local
    }

    pub fn local_cursor(&self) -> Option<&CursorPosition> {
        self.local_cursor.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

// ───────────────────────────────────────────────────────────────────
// Broadcaster
// ───────────────────────────────────────────────────────────────────

/// Couples a [`PresenceRoom`] with its relay channel and publishes the
/// collaborator list on a watch channel.
pub struct PresenceBroadcaster {
    room: Mutex<PresenceRoom>,
    outbox: Outbox,
    collaborators_tx: watch::Sender<Vec<Collaborator>>,
    debug: bool,
}

impl PresenceBroadcaster {
    pub fn new(room: PresenceRoom, outbox: Outbox, debug: bool) -> Self {
        let (collaborators_tx, _) = watch::channel(Vec::new());
        Self {
            room: Mutex::new(room),
            outbox,
            collaborators_tx,
            debug,
        }
    }

    pub async fn announce_join(&self) {
        let msg = self.room.lock().await.join_message();
        decision!(self.debug, "{} presence join user={}", self.outbox.channel(), msg.user_id());
        self.outbox.publish(PRESENCE_EVENT, &msg).await;
    }

    pub async fn heartbeat(&self) {
        let msg = self.room.lock().await.heartbeat_message();
        log::trace!("{} heartbeat", self.outbox.channel());
        self.outbox.publish(PRESENCE_EVENT, &msg).await;
    }

    pub async fn announce_leave(&self) {
        let msg = self.room.lock().await.leave_message();
        decision!(self.debug, "{} presence leave user={}", self.outbox.channel(), msg.user_id());
        self.outbox.publish(PRESENCE_EVENT, &msg).await;
    }

    pub async fn send_cursor(&self, position: CursorPosition) {
        let msg = self.room.lock().await.cursor_message(position);
        self.outbox.publish(PRESENCE_EVENT, &msg).await;
    }

    /// Apply a remote message and republish the collaborator list.
    pub async fn handle(&self, msg: &PresenceMessage, now: Instant) -> PresenceChange {
        let mut room = self.room.lock().await;
        let change = room.handle_message(msg, now);
        match &change {
            PresenceChange::Joined(id) => {
                decision!(self.debug, "{} peer joined user={id}", self.outbox.channel())
            }
            PresenceChange::Left(id) => {
                decision!(self.debug, "{} peer left user={id}", self.outbox.channel())
            }
            _ => {}
        }
        if change != PresenceChange::Ignored {
            self.collaborators_tx.send_replace(room.collaborators());
        }
        change
    }

    /// Evict silent peers. Returns the evicted user ids.
    pub async fn sweep(&self, now: Instant) -> Vec<UserId> {
        let mut room = self.room.lock().await;
        let evicted = room.sweep(now);
        if !evicted.is_empty() {
            for id in &evicted {
                decision!(
                    self.debug,
                    "{} peer timed out user={id} (no heartbeat for {:?})",
                    self.outbox.channel(),
                    room.timeout()
                );
            }
            self.collaborators_tx.send_replace(room.collaborators());
        }
        evicted
    }

    pub async fn collaborators(&self) -> Vec<Collaborator> {
        self.room.lock().await.collaborators()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<Collaborator>> {
        self.collaborators_tx.subscribe()
    }
}
