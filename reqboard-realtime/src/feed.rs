//! Change feed seam: filtered subscriptions to row changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{RealtimeError, Result};
use crate::protocol::{DocumentId, EntityKind, RawChange};

pub type SubscriptionId = u64;

/// Server-side filter for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub table: EntityKind,
    /// Restrict document and block rows to one document. Column and
    /// requirement rows carry no document id and are scoped by the
    /// reconciler instead.
    pub document_id: Option<DocumentId>,
}

impl ChangeFilter {
    pub fn table(table: EntityKind) -> Self {
        Self {
            table,
            document_id: None,
        }
    }

    pub fn for_document(table: EntityKind, document_id: DocumentId) -> Self {
        Self {
            table,
            document_id: Some(document_id),
        }
    }

    pub fn matches(&self, change: &RawChange) -> bool {
        if change.table != self.table.table() {
            return false;
        }
        let Some(doc) = self.document_id else {
            return true;
        };
        let doc = doc.to_string();
        match self.table {
            EntityKind::Document => change.row_id().as_deref() == Some(doc.as_str()),
            EntityKind::Block => change.document_id().is_none_or(|d| d == doc),
            EntityKind::Column | EntityKind::Requirement => true,
        }
    }
}

/// A live subscription. Dropping the receiver ends delivery.
pub struct FeedSubscription {
    pub id: SubscriptionId,
    pub events: mpsc::Receiver<RawChange>,
}

/// Source of row change events (at-least-once, unordered across tables).
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<FeedSubscription>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
}

struct Subscriber {
    filter: ChangeFilter,
    tx: mpsc::Sender<RawChange>,
}

/// In-process change feed. `publish` plays the role of the database.
pub struct MemoryChangeFeed {
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl MemoryChangeFeed {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Deliver to every matching subscriber. Returns how many received it.
    pub async fn publish(&self, change: RawChange) -> usize {
        let targets: Vec<mpsc::Sender<RawChange>> = {
            let subs = self.subscribers.lock().await;
            subs.values()
                .filter(|s| s.filter.matches(&change))
                .map(|s| s.tx.clone())
                .collect()
        };
        let mut delivered = 0;
        for tx in targets {
            if tx.send(change.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        log::trace!("feed {} {}: delivered to {delivered}", change.table, change.event_type);
        delivered
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    pub fn buffer(&self) -> usize {
        self.buffer
    }
}

impl Default for MemoryChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<FeedSubscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, events) = mpsc::channel(self.buffer);
        log::debug!("feed subscribe #{id} table={} doc={:?}", filter.table, filter.document_id);
        self.subscribers.lock().await.insert(id, Subscriber { filter, tx });
        Ok(FeedSubscription { id, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        match self.subscribers.lock().await.remove(&id) {
            Some(_) => Ok(()),
            None => Err(RealtimeError::UnknownChannel(format!("feed subscription #{id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChangeType;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_filter_scopes_blocks_by_document() {
        let doc = Uuid::new_v4();
        let filter = ChangeFilter::for_document(EntityKind::Block, doc);
        let ours = RawChange::new(
            EntityKind::Block,
            ChangeType::Insert,
            Some(json!({"id": "b1", "document_id": doc.to_string()})),
            None,
        );
        let theirs = RawChange::new(
            EntityKind::Block,
            ChangeType::Insert,
            Some(json!({"id": "b2", "document_id": Uuid::new_v4().to_string()})),
            None,
        );
        let key_only_delete = RawChange::new(EntityKind::Block, ChangeType::Delete, None, Some(json!({"id": "b1"})));
        assert!(filter.matches(&ours));
        assert!(!filter.matches(&theirs));
        assert!(filter.matches(&key_only_delete));
    }

    #[test]
    fn test_filter_document_row_by_id() {
        let doc = Uuid::new_v4();
        let filter = ChangeFilter::for_document(EntityKind::Document, doc);
        let row = RawChange::new(EntityKind::Document, ChangeType::Update, Some(json!({"id": doc.to_string()})), None);
        let other = RawChange::new(EntityKind::Document, ChangeType::Update, Some(json!({"id": "x"})), None);
        assert!(filter.matches(&row));
        assert!(!filter.matches(&other));
    }

    #[test]
    fn test_filter_table_mismatch() {
        let filter = ChangeFilter::table(EntityKind::Column);
        let req = RawChange::new(EntityKind::Requirement, ChangeType::Insert, Some(json!({"id": "r"})), None);
        assert!(!filter.matches(&req));
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let feed = MemoryChangeFeed::new(8);
        let mut cols = feed.subscribe(ChangeFilter::table(EntityKind::Column)).await.unwrap();
        let mut reqs = feed.subscribe(ChangeFilter::table(EntityKind::Requirement)).await.unwrap();

        let change = RawChange::new(EntityKind::Column, ChangeType::Insert, Some(json!({"id": "c1"})), None);
        assert_eq!(feed.publish(change).await, 1);
        assert_eq!(cols.events.recv().await.unwrap().row_id().as_deref(), Some("c1"));
        assert!(reqs.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let feed = MemoryChangeFeed::default();
        let sub = feed.subscribe(ChangeFilter::table(EntityKind::Block)).await.unwrap();
        assert_eq!(feed.subscriber_count().await, 1);
        feed.unsubscribe(sub.id).await.unwrap();
        assert_eq!(feed.subscriber_count().await, 0);
        assert!(feed.unsubscribe(sub.id).await.is_err());
    }
}
