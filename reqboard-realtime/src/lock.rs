//! Soft, optimistic entity locks reconciled over broadcasts.
//!
//! `acquire` only consults the local table: if no record exists the lock is
//! taken locally and an `Acquire` is broadcast. Two clients acquiring the
//! same entity within one round-trip both succeed until their broadcasts
//! cross; each then holds the record of whichever `Acquire` it processed
//! last. This is a UX hint, not a mutex.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::protocol::{ClientId, LockKind, LockMessage, UserId, UserProfile, LOCK_EVENT};
use crate::relay::Outbox;

/// One locked entity.
#[derive(Debug, Clone, PartialEq)]
pub struct LockRecord {
    pub entity_id: String,
    pub kind: LockKind,
    pub holder_id: UserId,
    pub holder_name: String,
    pub holder_client: ClientId,
    pub acquired_at: Instant,
}

/// Effect of one incoming lock message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockChange {
    Acquired { entity_id: String, holder_id: UserId },
    Released { entity_id: String },
    Ignored,
}

/// Local view of every lock in a document. At most one record per entity.
#[derive(Debug)]
pub struct LockTable {
    records: HashMap<String, LockRecord>,
    local_user: UserProfile,
    local_client: ClientId,
}

impl LockTable {
    pub fn new(local_user: UserProfile, local_client: ClientId) -> Self {
        Self {
            records: HashMap::new(),
            local_user,
            local_client,
        }
    }

    /// Take the lock if nobody holds it. Returns the broadcast to send.
    pub fn try_acquire(&mut self, entity_id: &str, kind: LockKind, now: Instant) -> Option<LockMessage> {
        if self.records.contains_key(entity_id) {
            return None;
        }
        self.records.insert(
            entity_id.to_string(),
            LockRecord {
                entity_id: entity_id.to_string(),
                kind,
                holder_id: self.local_user.user_id,
                holder_name: self.local_user.display_name.clone(),
                holder_client: self.local_client,
                acquired_at: now,
            },
        );
        Some(LockMessage::Acquire {
            entity_id: entity_id.to_string(),
            kind,
            holder: self.local_user.clone(),
            client_id: self.local_client,
        })
    }

    /// Drop the local record if this client holds it, and return the
    /// `Release` broadcast (sent regardless).
    pub fn release(&mut self, entity_id: &str) -> LockMessage {
        if self.is_held_locally(entity_id) {
            self.records.remove(entity_id);
        }
        LockMessage::Release {
            entity_id: entity_id.to_string(),
            user_id: self.local_user.user_id,
            client_id: self.local_client,
        }
    }

    /// Apply a broadcast from another client.
    pub fn handle_message(&mut self, msg: &LockMessage, now: Instant) -> LockChange {
        if msg.client_id() == self.local_client {
            return LockChange::Ignored;
        }
        match msg {
            LockMessage::Acquire { entity_id, kind, holder, client_id } => {
                // last processed acquire wins
                self.records.insert(
                    entity_id.clone(),
                    LockRecord {
                        entity_id: entity_id.clone(),
                        kind: *kind,
                        holder_id: holder.user_id,
                        holder_name: holder.display_name.clone(),
                        holder_client: *client_id,
                        acquired_at: now,
                    },
                );
                LockChange::Acquired {
                    entity_id: entity_id.clone(),
                    holder_id: holder.user_id,
                }
            }
            LockMessage::Release { entity_id, .. } => match self.records.remove(entity_id) {
                Some(_) => LockChange::Released {
                    entity_id: entity_id.clone(),
                },
                None => LockChange::Ignored,
            },
        }
    }

    /// Drop every lock held by a departed user. Returns the freed entity ids.
    pub fn drop_holder(&mut self, user_id: UserId) -> Vec<String> {
        let freed: Vec<String> = self
            .records
            .values()
            .filter(|r| r.holder_id == user_id && r.holder_client != self.local_client)
            .map(|r| r.entity_id.clone())
            .collect();
        for id in &freed {
            self.records.remove(id);
        }
        freed
    }

    pub fn is_held_locally(&self, entity_id: &str) -> bool {
        self.records
            .get(entity_id)
            .is_some_and(|r| r.holder_client == self.local_client)
    }

    /// Entity ids this client holds.
    pub fn held_locally(&self) -> Vec<String> {
        self.records
            .values()
            .filter(|r| r.holder_client == self.local_client)
            .map(|r| r.entity_id.clone())
            .collect()
    }

    pub fn get(&self, entity_id: &str) -> Option<&LockRecord> {
        self.records.get(entity_id)
    }

    pub fn records(&self) -> Vec<LockRecord> {
        let mut list: Vec<LockRecord> = self.records.values().cloned().collect();
        list.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        list
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A [`LockTable`] wired to a document's relay channel.
pub struct LockCoordinator {
    table: Mutex<LockTable>,
    outbox: Outbox,
    debug: bool,
}

impl LockCoordinator {
    pub fn new(table: LockTable, outbox: Outbox, debug: bool) -> Self {
        Self {
            table: Mutex::new(table),
            outbox,
            debug,
        }
    }

    /// Returns false without broadcasting when any record exists.
    pub async fn acquire(&self, entity_id: &str, kind: LockKind, now: Instant) -> bool {
        let msg = self.table.lock().await.try_acquire(entity_id, kind, now);
        match msg {
            Some(msg) => {
                decision!(self.debug, "{} lock acquired entity={entity_id} kind={kind:?}", self.outbox.channel());
                self.outbox.publish(LOCK_EVENT, &msg).await;
                true
            }
            None => {
                decision!(self.debug, "{} lock busy entity={entity_id}", self.outbox.channel());
                false
            }
        }
    }

    pub async fn release(&self, entity_id: &str) {
        let msg = self.table.lock().await.release(entity_id);
        decision!(self.debug, "{} lock released entity={entity_id}", self.outbox.channel());
        self.outbox.publish(LOCK_EVENT, &msg).await;
    }

    /// Release everything this client holds.
    pub async fn release_all(&self) -> usize {
        let held = self.table.lock().await.held_locally();
        for entity_id in &held {
            self.release(entity_id).await;
        }
        held.len()
    }

    pub async fn handle(&self, msg: &LockMessage, now: Instant) -> LockChange {
        let change = self.table.lock().await.handle_message(msg, now);
        match &change {
            LockChange::Acquired { entity_id, holder_id } => decision!(
                self.debug,
                "{} remote lock entity={entity_id} holder={holder_id}",
                self.outbox.channel()
            ),
            LockChange::Released { entity_id } => {
                decision!(self.debug, "{} remote unlock entity={entity_id}", self.outbox.channel())
            }
            LockChange::Ignored => {}
        }
        change
    }

    /// Forget locks of a user who left or timed out.
    pub async fn drop_holder(&self, user_id: UserId) -> Vec<String> {
        let freed = self.table.lock().await.drop_holder(user_id);
        if !freed.is_empty() {
            decision!(
                self.debug,
                "{} dropped {} lock(s) of departed user={user_id}",
                self.outbox.channel(),
                freed.len()
            );
        }
        freed
    }

    pub async fn holder(&self, entity_id: &str) -> Option<LockRecord> {
        self.table.lock().await.get(entity_id).cloned()
    }

    pub async fn records(&self) -> Vec<LockRecord> {
        self.table.lock().await.records()
    }
}
