//! Change Stream Reconciler: merges feed events into a document's cache.
//!
//! Per event:
//! 1. drop if it originated from this client (own echo);
//! 2. drop if its operation id is known to either dedup scope;
//! 3. record the operation id, resolve `(kind, parent)` and apply
//!    insert-if-absent / shallow-merge update / delete-by-id.
//!
//! Apply is idempotent, so at-least-once redelivery is harmless.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, RwLock};

use crate::cache::{CacheKey, CollectionCache, Entity};
use crate::dedup::DedupScopes;
use crate::protocol::{ChangeEvent, ChangeType, ClientId, DocumentId, EntityKind, RawChange};

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The cache changed.
    Applied,
    /// Accepted but nothing changed (insert of a present id, update or
    /// delete of an absent one).
    Unchanged,
    /// Originated from this client.
    SelfEcho,
    /// Operation id already applied.
    Duplicate,
    /// No parent in this document could be resolved.
    Unscoped,
    /// Failed validation.
    Malformed,
}

/// Shared handle to one document's cache.
pub type SharedCache = Arc<RwLock<CollectionCache>>;

/// Applies change events for a single document.
pub struct ChangeReconciler {
    document_id: DocumentId,
    local_client: ClientId,
    scopes: DedupScopes,
    cache: SharedCache,
    version_tx: watch::Sender<u64>,
    debug: bool,
}

impl ChangeReconciler {
    pub fn new(
        document_id: DocumentId,
        local_client: ClientId,
        scopes: DedupScopes,
        cache: SharedCache,
        debug: bool,
    ) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            document_id,
            local_client,
            scopes,
            cache,
            version_tx,
            debug,
        }
    }

    /// Receiver that observes the cache version after each applied change.
    pub fn watch_version(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// Validate and apply a raw feed record. Malformed input is logged and
    /// dropped.
    pub async fn handle_raw(&mut self, raw: RawChange, now: Instant) -> ApplyOutcome {
        let table = raw.table.clone();
        match ChangeEvent::try_from(raw) {
            Ok(event) => self.handle(event, now).await,
            Err(e) => {
                log::warn!("doc {}: dropping {table} change: {e}", self.document_id);
                ApplyOutcome::Malformed
            }
        }
    }

    /// Filter and apply one event.
    pub async fn handle(&mut self, event: ChangeEvent, now: Instant) -> ApplyOutcome {
        if event.origin == Some(self.local_client) {
            decision!(
                self.debug,
                "doc {} skip own echo {} {}",
                self.document_id,
                event.kind,
                event.entity_id()
            );
            return ApplyOutcome::SelfEcho;
        }

        if let Some(op) = event.operation_id.as_deref() {
            if self.scopes.seen(op, now).await {
                decision!(self.debug, "doc {} dedup drop op={op}", self.document_id);
                return ApplyOutcome::Duplicate;
            }
            self.scopes.record(op, now).await;
        }

        let outcome = {
            let mut cache = self.cache.write().await;
            let outcome = self.apply(&mut cache, &event);
            if outcome == ApplyOutcome::Applied {
                let version = cache.bump();
                self.version_tx.send_replace(version);
            }
            outcome
        };

        if outcome == ApplyOutcome::Unscoped {
            log::warn!(
                "doc {}: no resolvable parent for {} {} {:?}, dropped",
                self.document_id,
                event.kind,
                event.entity_id(),
                event.change
            );
        }
        outcome
    }

    fn apply(&self, cache: &mut CollectionCache, event: &ChangeEvent) -> ApplyOutcome {
        let id = event.entity_id();
        let target = self.resolve_key(cache, event);

        match event.change {
            ChangeType::Insert => {
                let (Some(key), Some(row)) = (target, event.new.clone()) else {
                    return ApplyOutcome::Unscoped;
                };
                changed(cache.collection_mut(key).insert_if_absent(row))
            }

            ChangeType::Update => {
                let Some(row) = event.new.as_ref() else {
                    return ApplyOutcome::Malformed;
                };
                let current = cache.locate(event.kind, id);
                match (target, current) {
                    (Some(key), Some(at)) if key == at => {
                        changed(cache.collection_mut(key).merge_update(row))
                    }
                    // parent changed: move between collections
                    (Some(key), Some(at)) => {
                        let Some(mut moved) = cache.collection_mut(at).remove(id) else {
                            return ApplyOutcome::Unchanged;
                        };
                        moved.merge(row);
                        cache.collection_mut(key).insert_if_absent(moved);
                        ApplyOutcome::Applied
                    }
                    (Some(_), None) => {
                        log::debug!("doc {}: update for unknown {} {id}", self.document_id, event.kind);
                        ApplyOutcome::Unchanged
                    }
                    // moved to a parent outside this document
                    (None, Some(at)) if names_parent(event.kind, row) => {
                        cache.collection_mut(at).remove(id);
                        ApplyOutcome::Applied
                    }
                    // partial row without the parent column keeps its parent
                    (None, Some(at)) => changed(cache.collection_mut(at).merge_update(row)),
                    (None, None) => ApplyOutcome::Unscoped,
                }
            }

            ChangeType::Delete => {
                // old rows often carry only the primary key
                let Some(key) = target.or_else(|| cache.locate(event.kind, id)) else {
                    return ApplyOutcome::Unscoped;
                };
                changed(cache.collection_mut(key).remove(id).is_some())
            }
        }
    }

    /// Cache key for the event, or None if it does not belong here.
    fn resolve_key(&self, cache: &CollectionCache, event: &ChangeEvent) -> Option<CacheKey> {
        let doc = self.document_id.to_string();
        let row = event.snapshot()?;

        let Some(column) = event.kind.parent_column() else {
            return (row.id() == doc).then(|| CacheKey::new(EntityKind::Document, doc));
        };
        let parent = row.get_id(column)?;

        match event.kind {
            EntityKind::Block => (parent == doc).then(|| CacheKey::new(EntityKind::Block, parent)),
            kind => {
                let blocks = CacheKey::new(EntityKind::Block, doc);
                let known = cache.get(&blocks).is_some_and(|c| c.contains(&parent));
                known.then(|| CacheKey::new(kind, parent))
            }
        }
    }

    /// Optimistic local write: apply to the cache directly.
    pub async fn apply_local(&self, kind: EntityKind, change: ChangeType, row: Entity) -> ApplyOutcome {
        let event = ChangeEvent {
            kind,
            change,
            old: (change == ChangeType::Delete).then(|| row.clone()),
            new: (change != ChangeType::Delete).then_some(row),
            origin: None,
            operation_id: None,
            commit_timestamp: None,
        };
        let mut cache = self.cache.write().await;
        let outcome = self.apply(&mut cache, &event);
        if outcome == ApplyOutcome::Applied {
            let version = cache.bump();
            self.version_tx.send_replace(version);
        }
        outcome
    }

    /// Seed a collection from an initial fetch.
    pub async fn hydrate(&self, key: CacheKey, rows: Vec<Entity>) {
        let mut cache = self.cache.write().await;
        cache.hydrate(key, rows);
        self.version_tx.send_replace(cache.version());
    }
}

fn names_parent(kind: EntityKind, row: &Entity) -> bool {
    kind.parent_column().is_some_and(|column| row.get_id(column).is_some())
}

fn changed(did: bool) -> ApplyOutcome {
    if did {
        ApplyOutcome::Applied
    } else {
        ApplyOutcome::Unchanged
    }
}
