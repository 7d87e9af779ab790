//! Document sessions: the surface UI code talks to.
//!
//! ```text
//! RealtimeContext ──subscribe_to_document(doc)──► DocumentSubscription
//!   │                                                │
//!   ├─ ChannelRegistry<ChangeChannel>    doc ──► ChangeChannel
//!   │     4 feed subscriptions ─► pump ─► ChangeReconciler ─► cache
//!   │
//!   └─ ChannelRegistry<PresenceChannel>  doc ──► PresenceChannel
//!         relay frames ─► pump ─► PresenceBroadcaster / LockCoordinator
//!         heartbeat task, sweep task, throttled cursor forwarder
//! ```
//!
//! Both channels of a document are shared by every subscription to it and
//! torn down when the last one unsubscribes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, select_all, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::{CacheKey, CollectionCache, Entity};
use crate::channels::{ChannelKey, ChannelRegistry, ManagedChannel};
use crate::clock_now;
use crate::config::RealtimeConfig;
use crate::dedup::{DedupScopes, OperationDeduplicator, SharedDeduplicator};
use crate::error::Result;
use crate::feed::{ChangeFeed, ChangeFilter, SubscriptionId};
use crate::lock::{LockCoordinator, LockRecord, LockTable};
use crate::presence::{Collaborator, PresenceBroadcaster, PresenceChange, PresenceRoom};
use crate::protocol::{
    self, channel_name, ChangeType, ChannelPurpose, ClientId, CursorPosition, DocumentId, EntityKind,
    LockKind, LockMessage, OperationId, PresenceMessage, RawChange, UserProfile, LOCK_EVENT,
    PRESENCE_EVENT,
};
use crate::reconciler::{ApplyOutcome, ChangeReconciler, SharedCache};
use crate::relay::{BroadcastRelay, Outbox, RelayFrame, SequenceGuard};
use crate::throttle::ThrottledProjection;

/// Who this process is.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub client_id: ClientId,
    pub user: UserProfile,
}

impl LocalIdentity {
    /// A fresh client id for `user`.
    pub fn new(user: UserProfile) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            user,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Change channel
// ───────────────────────────────────────────────────────────────────

/// Feed subscriptions for one document plus the reconciler they drive.
pub struct ChangeChannel {
    document_id: DocumentId,
    reconciler: Arc<Mutex<ChangeReconciler>>,
    cache: SharedCache,
    version_rx: watch::Receiver<u64>,
    feed: Arc<dyn ChangeFeed>,
    subscriptions: Vec<SubscriptionId>,
    pump: JoinHandle<()>,
}

impl ChangeChannel {
    async fn open(ctx: &ContextInner, document_id: DocumentId) -> Result<Self> {
        let cache: SharedCache = Arc::new(RwLock::new(CollectionCache::new()));
        let scopes = DedupScopes::new(ctx.dedup.clone(), OperationDeduplicator::from_config(&ctx.config));
        let reconciler = ChangeReconciler::new(
            document_id,
            ctx.identity.client_id,
            scopes,
            cache.clone(),
            ctx.config.debug,
        );
        let version_rx = reconciler.watch_version();

        let mut subs = Vec::with_capacity(EntityKind::ALL.len());
        for kind in EntityKind::ALL {
            let filter = match kind {
                EntityKind::Document | EntityKind::Block => ChangeFilter::for_document(kind, document_id),
                EntityKind::Column | EntityKind::Requirement => ChangeFilter::table(kind),
            };
            match ctx.feed.subscribe(filter).await {
                Ok(sub) => subs.push(sub),
                Err(e) => {
                    for sub in &subs {
                        if let Err(undo) = ctx.feed.unsubscribe(sub.id).await {
                            log::warn!("doc {document_id}: rollback of feed #{} failed: {undo}", sub.id);
                        }
                    }
                    return Err(e);
                }
            }
        }

        let subscriptions = subs.iter().map(|s| s.id).collect();
        let streams = subs.into_iter().map(|sub| {
            Box::pin(stream::unfold(sub.events, |mut rx: mpsc::Receiver<RawChange>| async move {
                rx.recv().await.map(|change| (change, rx))
            }))
        });
        let mut merged = select_all(streams);

        let reconciler = Arc::new(Mutex::new(reconciler));
        let pump_reconciler = reconciler.clone();
        let pump = tokio::spawn(async move {
            while let Some(change) = merged.next().await {
                pump_reconciler.lock().await.handle_raw(change, clock_now()).await;
            }
            log::debug!("doc {document_id}: change feed ended");
        });

        Ok(Self {
            document_id,
            reconciler,
            cache,
            version_rx,
            feed: ctx.feed.clone(),
            subscriptions,
            pump,
        })
    }
}

#[async_trait]
impl ManagedChannel for ChangeChannel {
    async fn close(&self) -> Result<()> {
        self.pump.abort();
        let mut result = Ok(());
        for id in &self.subscriptions {
            if let Err(e) = self.feed.unsubscribe(*id).await {
                log::warn!("doc {}: feed unsubscribe #{id} failed: {e}", self.document_id);
                result = Err(e);
            }
        }
        result
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence channel
// ───────────────────────────────────────────────────────────────────

/// Relay channel for one document's presence and locks, with its timers.
pub struct PresenceChannel {
    name: String,
    relay: Arc<dyn BroadcastRelay>,
    presence: Arc<PresenceBroadcaster>,
    locks: Arc<LockCoordinator>,
    cursor: ThrottledProjection<Option<CursorPosition>>,
    tasks: Vec<JoinHandle<()>>,
}

impl PresenceChannel {
    async fn open(ctx: &ContextInner, document_id: DocumentId) -> Result<Self> {
        let config = &ctx.config;
        let name = channel_name(document_id, ChannelPurpose::Presence);
        let frames = ctx.relay.open_channel(&name).await?;

        let outbox = Outbox::new(ctx.relay.clone(), name.clone());
        let room = PresenceRoom::new(ctx.identity.user.clone(), config.presence_timeout);
        let presence = Arc::new(PresenceBroadcaster::new(room, outbox.clone(), config.debug));
        let table = LockTable::new(ctx.identity.user.clone(), ctx.identity.client_id);
        let locks = Arc::new(LockCoordinator::new(table, outbox, config.debug));

        presence.announce_join().await;

        let cursor = ThrottledProjection::spawn(None, config.cursor_throttle);
        let tasks = vec![
            tokio::spawn(pump_frames(frames, presence.clone(), locks.clone())),
            tokio::spawn(heartbeat_loop(presence.clone(), config.heartbeat_interval)),
            tokio::spawn(sweep_loop(presence.clone(), locks.clone(), config.sweep_interval)),
            tokio::spawn(forward_cursor(cursor.subscribe(), presence.clone())),
        ];

        Ok(Self {
            name,
            relay: ctx.relay.clone(),
            presence,
            locks,
            cursor,
            tasks,
        })
    }
}

#[async_trait]
impl ManagedChannel for PresenceChannel {
    async fn close(&self) -> Result<()> {
        for task in &self.tasks {
            task.abort();
        }
        let released = self.locks.release_all().await;
        if released > 0 {
            log::debug!("{}: released {released} lock(s) on close", self.name);
        }
        self.presence.announce_leave().await;
        self.relay.close_channel(&self.name).await
    }
}

async fn pump_frames(
    mut frames: broadcast::Receiver<Arc<RelayFrame>>,
    presence: Arc<PresenceBroadcaster>,
    locks: Arc<LockCoordinator>,
) {
    let mut guard = SequenceGuard::new();
    loop {
        match frames.recv().await {
            Ok(frame) => {
                if guard.accept(&frame) {
                    dispatch_frame(&frame, &presence, &locks).await;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("presence pump lagged, {skipped} frame(s) skipped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn dispatch_frame(frame: &RelayFrame, presence: &PresenceBroadcaster, locks: &LockCoordinator) {
    let now = clock_now();
    match frame.event.as_str() {
        PRESENCE_EVENT => {
            let msg: PresenceMessage = match protocol::decode(&frame.payload) {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!("{}: dropping presence frame: {e}", frame.channel);
                    return;
                }
            };
            let change = presence.handle(&msg, now).await;
            match change {
                PresenceChange::Left(user_id) => {
                    locks.drop_holder(user_id).await;
                }
                // let a newcomer see us without waiting a heartbeat
                PresenceChange::Joined(_) | PresenceChange::Refreshed(_)
                    if matches!(msg, PresenceMessage::Joined { .. }) =>
                {
                    presence.heartbeat().await;
                }
                _ => {}
            }
        }
        LOCK_EVENT => match protocol::decode::<LockMessage>(&frame.payload) {
            Ok(msg) => {
                locks.handle(&msg, now).await;
            }
            Err(e) => log::warn!("{}: dropping lock frame: {e}", frame.channel),
        },
        other => log::debug!("{}: ignoring event {other:?}", frame.channel),
    }
}

async fn heartbeat_loop(presence: Arc<PresenceBroadcaster>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // the first tick is immediate and the join was just announced
    ticker.tick().await;
    loop {
        ticker.tick().await;
        presence.heartbeat().await;
    }
}

async fn sweep_loop(presence: Arc<PresenceBroadcaster>, locks: Arc<LockCoordinator>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for user_id in presence.sweep(clock_now()).await {
            locks.drop_holder(user_id).await;
        }
    }
}

async fn forward_cursor(mut positions: watch::Receiver<Option<CursorPosition>>, presence: Arc<PresenceBroadcaster>) {
    while positions.changed().await.is_ok() {
        let position = positions.borrow_and_update().clone();
        if let Some(position) = position {
            presence.send_cursor(position).await;
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Context
// ───────────────────────────────────────────────────────────────────

struct ContextInner {
    config: RealtimeConfig,
    identity: LocalIdentity,
    relay: Arc<dyn BroadcastRelay>,
    feed: Arc<dyn ChangeFeed>,
    dedup: SharedDeduplicator,
    changes: ChannelRegistry<ChangeChannel>,
    presence: ChannelRegistry<PresenceChannel>,
}

/// Process-wide realtime state. Cheap to clone.
#[derive(Clone)]
pub struct RealtimeContext {
    inner: Arc<ContextInner>,
}

impl RealtimeContext {
    pub fn new(
        config: RealtimeConfig,
        identity: LocalIdentity,
        relay: Arc<dyn BroadcastRelay>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Self {
        let dedup = Arc::new(Mutex::new(OperationDeduplicator::from_config(&config)));
        Self {
            inner: Arc::new(ContextInner {
                config,
                identity,
                relay,
                feed,
                dedup,
                changes: ChannelRegistry::new(),
                presence: ChannelRegistry::new(),
            }),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.inner.identity
    }

    /// The process-wide dedup scope.
    pub fn dedup(&self) -> &SharedDeduplicator {
        &self.inner.dedup
    }

    /// Open (or share) both channels of a document.
    pub async fn subscribe_to_document(&self, document_id: DocumentId) -> Result<DocumentSubscription> {
        let inner = &self.inner;
        let changes_key = ChannelKey::new(document_id, ChannelPurpose::Changes);
        let presence_key = ChannelKey::new(document_id, ChannelPurpose::Presence);

        let changes = inner
            .changes
            .subscribe(changes_key, || ChangeChannel::open(inner, document_id))
            .await?;
        let presence = match inner
            .presence
            .subscribe(presence_key, || PresenceChannel::open(inner, document_id))
            .await
        {
            Ok(presence) => presence,
            Err(e) => {
                log::error!("doc {document_id}: presence channel failed to open: {e}");
                if let Err(undo) = inner.changes.unsubscribe(&changes_key).await {
                    log::warn!("doc {document_id}: rollback failed: {undo}");
                }
                return Err(e);
            }
        };

        Ok(DocumentSubscription {
            document_id,
            ctx: self.clone(),
            changes,
            presence,
            active: true,
        })
    }

    async fn release(&self, document_id: DocumentId) -> Result<()> {
        let changes = self
            .inner
            .changes
            .unsubscribe(&ChannelKey::new(document_id, ChannelPurpose::Changes))
            .await;
        let presence = self
            .inner
            .presence
            .unsubscribe(&ChannelKey::new(document_id, ChannelPurpose::Presence))
            .await;
        changes.and(presence)
    }

    /// Close every open channel (the before-unload hook). Returns how many
    /// channels were closed.
    pub async fn shutdown(&self) -> usize {
        let closed = self.inner.presence.teardown_all().await + self.inner.changes.teardown_all().await;
        log::info!("realtime shutdown: {closed} channel(s) closed");
        closed
    }

    /// Subscribers sharing the given channel; 0 if it is not open.
    pub async fn channel_ref_count(&self, document_id: DocumentId, purpose: ChannelPurpose) -> usize {
        let key = ChannelKey::new(document_id, purpose);
        match purpose {
            ChannelPurpose::Changes => self.inner.changes.ref_count(&key).await,
            ChannelPurpose::Presence => self.inner.presence.ref_count(&key).await,
        }
    }

    pub async fn open_channels(&self) -> usize {
        self.inner.changes.len().await + self.inner.presence.len().await
    }
}

// ───────────────────────────────────────────────────────────────────
// Subscription
// ───────────────────────────────────────────────────────────────────

/// One consumer's handle on a document. Dropping it without calling
/// [`unsubscribe`](Self::unsubscribe) releases it in the background.
pub struct DocumentSubscription {
    document_id: DocumentId,
    ctx: RealtimeContext,
    changes: Arc<ChangeChannel>,
    presence: Arc<PresenceChannel>,
    active: bool,
}

impl DocumentSubscription {
    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// Cached entities of `kind` under `parent_id`, in display order.
    pub async fn collection(&self, kind: EntityKind, parent_id: &str) -> Vec<Entity> {
        self.changes.cache.read().await.entities(&CacheKey::new(kind, parent_id))
    }

    pub async fn collections(&self) -> HashMap<CacheKey, Vec<Entity>> {
        self.changes.cache.read().await.snapshot()
    }

    /// Cache version; changes after every applied mutation.
    pub fn watch_cache(&self) -> watch::Receiver<u64> {
        self.changes.version_rx.clone()
    }

    /// Seed a collection from an initial fetch.
    pub async fn hydrate(&self, kind: EntityKind, parent_id: &str, rows: Vec<Entity>) {
        let reconciler = self.changes.reconciler.lock().await;
        reconciler.hydrate(CacheKey::new(kind, parent_id), rows).await;
    }

    /// Apply an optimistic local write. Its operation id is recorded in the
    /// process-wide scope so the feed echo is dropped.
    pub async fn apply_local_write(
        &self,
        kind: EntityKind,
        change: ChangeType,
        row: Entity,
        operation_id: Option<OperationId>,
    ) -> ApplyOutcome {
        if let Some(op) = operation_id.as_deref() {
            self.ctx.inner.dedup.lock().await.record(op, clock_now());
        }
        let reconciler = self.changes.reconciler.lock().await;
        reconciler.apply_local(kind, change, row).await
    }

    /// Broadcast the local cursor, throttled.
    pub fn update_cursor(&self, position: CursorPosition) {
        self.presence.cursor.project(Some(position));
    }

    /// Optimistic lock; false if a holder is already known locally.
    pub async fn acquire_entity_lock(&self, entity_id: &str, kind: LockKind) -> bool {
        self.presence.locks.acquire(entity_id, kind, clock_now()).await
    }

    pub async fn release_entity_lock(&self, entity_id: &str) {
        self.presence.locks.release(entity_id).await;
    }

    pub async fn lock_holder(&self, entity_id: &str) -> Option<LockRecord> {
        self.presence.locks.holder(entity_id).await
    }

    pub async fn locks(&self) -> Vec<LockRecord> {
        self.presence.locks.records().await
    }

    pub async fn collaborators(&self) -> Vec<Collaborator> {
        self.presence.presence.collaborators().await
    }

    pub fn watch_collaborators(&self) -> watch::Receiver<Vec<Collaborator>> {
        self.presence.presence.watch()
    }

    /// Collaborator list throttled for rendering.
    pub fn project_collaborators(&self, interval: Duration) -> ThrottledProjection<Vec<Collaborator>> {
        ThrottledProjection::from_watch(self.watch_collaborators(), interval)
    }

    /// Release this subscription; the document's channels close when it was
    /// the last one.
    pub async fn unsubscribe(mut self) -> Result<()> {
        self.active = false;
        self.ctx.release(self.document_id).await
    }
}

impl Drop for DocumentSubscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let ctx = self.ctx.clone();
        let document_id = self.document_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = ctx.release(document_id).await {
                        log::debug!("doc {document_id}: background unsubscribe: {e}");
                    }
                });
            }
            Err(_) => log::warn!("doc {document_id}: subscription dropped outside a runtime, channels leak"),
        }
    }
}

impl std::fmt::Debug for DocumentSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSubscription")
            .field("document_id", &self.document_id)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{MemoryRelay, RelayHub};
    use crate::feed::MemoryChangeFeed;
    use serde_json::json;

    struct Harness {
        hub: Arc<RelayHub>,
        feed: Arc<MemoryChangeFeed>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                hub: Arc::new(RelayHub::new(64)),
                feed: Arc::new(MemoryChangeFeed::new(64)),
            }
        }

        fn client(&self, name: &str) -> RealtimeContext {
            RealtimeContext::new(
                RealtimeConfig::default(),
                LocalIdentity::new(UserProfile::new(Uuid::new_v4(), name)),
                Arc::new(MemoryRelay::new(self.hub.clone())),
                self.feed.clone(),
            )
        }
    }

    #[tokio::test]
    async fn test_channels_shared_and_released() {
        let h = Harness::new();
        let ctx = h.client("Alice");
        let doc = Uuid::new_v4();

        let a = ctx.subscribe_to_document(doc).await.unwrap();
        let b = ctx.subscribe_to_document(doc).await.unwrap();
        assert_eq!(ctx.channel_ref_count(doc, ChannelPurpose::Presence).await, 2);
        assert_eq!(h.feed.subscriber_count().await, 4);

        a.unsubscribe().await.unwrap();
        assert_eq!(ctx.channel_ref_count(doc, ChannelPurpose::Changes).await, 1);
        b.unsubscribe().await.unwrap();
        assert_eq!(ctx.open_channels().await, 0);
        assert_eq!(h.feed.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_feed_change_reaches_cache() {
        let h = Harness::new();
        let ctx = h.client("Alice");
        let doc = Uuid::new_v4();
        let sub = ctx.subscribe_to_document(doc).await.unwrap();
        let mut version = sub.watch_cache();

        h.feed
            .publish(RawChange::new(
                EntityKind::Block,
                ChangeType::Insert,
                Some(json!({"id": "b1", "document_id": doc.to_string(), "position": 1})),
                None,
            ))
            .await;
        version.changed().await.unwrap();

        let blocks = sub.collection(EntityKind::Block, &doc.to_string()).await;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].id(), "b1");
        sub.unsubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_write_echo_dropped() {
        let h = Harness::new();
        let ctx = h.client("Alice");
        let doc = Uuid::new_v4();
        let sub = ctx.subscribe_to_document(doc).await.unwrap();

        let row = json!({"id": "b1", "document_id": doc.to_string(), "operation_id": "op-local"});
        let out = sub
            .apply_local_write(
                EntityKind::Block,
                ChangeType::Insert,
                Entity::from_json(row.clone()).unwrap(),
                Some("op-local".into()),
            )
            .await;
        assert_eq!(out, ApplyOutcome::Applied);
        assert!(ctx.dedup().lock().await.seen("op-local", clock_now()));
        sub.unsubscribe().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let h = Harness::new();
        let ctx = h.client("Alice");
        let _a = ctx.subscribe_to_document(Uuid::new_v4()).await.unwrap();
        let _b = ctx.subscribe_to_document(Uuid::new_v4()).await.unwrap();
        assert_eq!(ctx.shutdown().await, 4);
        assert_eq!(ctx.open_channels().await, 0);
        assert_eq!(h.feed.subscriber_count().await, 0);
    }
}
