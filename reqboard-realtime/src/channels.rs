//! Reference-counted registry of per-document channels.
//!
//! The first subscriber for a key opens the channel; later subscribers
//! share it. The channel is closed when the last one unsubscribes, so a
//! document viewed from two components keeps exactly one set of
//! subscriptions and one heartbeat.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{RealtimeError, Result};
use crate::protocol::{channel_name, ChannelPurpose, DocumentId};

/// Identifies one channel: a document and what it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub document_id: DocumentId,
    pub purpose: ChannelPurpose,
}

impl ChannelKey {
    pub fn new(document_id: DocumentId, purpose: ChannelPurpose) -> Self {
        Self { document_id, purpose }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&channel_name(self.document_id, self.purpose))
    }
}

/// A resource that must be torn down when its last user leaves.
#[async_trait]
pub trait ManagedChannel: Send + Sync {
    async fn close(&self) -> Result<()>;
}

struct ChannelHandle<R> {
    resource: Arc<R>,
    ref_count: usize,
}

/// Keyed, reference-counted set of open channels.
pub struct ChannelRegistry<R> {
    handles: Mutex<HashMap<ChannelKey, ChannelHandle<R>>>,
}

impl<R: ManagedChannel> ChannelRegistry<R> {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Share the channel for `key`, opening it with `open` if this is the
    /// first subscriber. The registry lock is held while opening so two
    /// concurrent first subscribers cannot both open.
    pub async fn subscribe<F, Fut>(&self, key: ChannelKey, open: F) -> Result<Arc<R>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get_mut(&key) {
            handle.ref_count += 1;
            log::debug!("{key}: shared, {} subscriber(s)", handle.ref_count);
            return Ok(handle.resource.clone());
        }

        let resource = Arc::new(open().await?);
        handles.insert(
            key,
            ChannelHandle {
                resource: resource.clone(),
                ref_count: 1,
            },
        );
        log::info!("{key}: opened");
        Ok(resource)
    }

    /// Drop one reference. Closes the channel when none remain; a failing
    /// close is logged and the entry is removed anyway.
    pub async fn unsubscribe(&self, key: &ChannelKey) -> Result<()> {
        let closing = {
            let mut handles = self.handles.lock().await;
            let Some(handle) = handles.get_mut(key) else {
                return Err(RealtimeError::UnknownChannel(key.to_string()));
            };
            handle.ref_count -= 1;
            if handle.ref_count > 0 {
                log::debug!("{key}: released, {} subscriber(s) left", handle.ref_count);
                return Ok(());
            }
            handles.remove(key).map(|h| h.resource)
        };

        if let Some(resource) = closing {
            match resource.close().await {
                Ok(()) => log::info!("{key}: closed"),
                Err(e) => log::warn!("{key}: close failed: {e}"),
            }
        }
        Ok(())
    }

    /// Close every channel regardless of reference counts. Failures are
    /// logged and do not stop the remaining closes. Returns how many were
    /// closed.
    pub async fn teardown_all(&self) -> usize {
        let drained: Vec<(ChannelKey, ChannelHandle<R>)> = self.handles.lock().await.drain().collect();
        let count = drained.len();
        for (key, handle) in drained {
            if let Err(e) = handle.resource.close().await {
                log::warn!("{key}: close failed during teardown: {e}");
            }
        }
        if count > 0 {
            log::info!("tore down {count} channel(s)");
        }
        count
    }

    pub async fn ref_count(&self, key: &ChannelKey) -> usize {
        self.handles.lock().await.get(key).map_or(0, |h| h.ref_count)
    }

    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handles.lock().await.is_empty()
    }
}

impl<R: ManagedChannel> Default for ChannelRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct FakeChannel {
        closes: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl ManagedChannel for FakeChannel {
        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(RealtimeError::Transport("socket gone".into()))
            } else {
                Ok(())
            }
        }
    }

    fn fake(closes: &Arc<AtomicUsize>, fail: bool) -> impl FnOnce() -> std::future::Ready<Result<FakeChannel>> {
        let closes = closes.clone();
        move || std::future::ready(Ok(FakeChannel { closes, fail }))
    }

    fn key() -> ChannelKey {
        ChannelKey::new(Uuid::new_v4(), ChannelPurpose::Presence)
    }

    #[tokio::test]
    async fn test_second_subscriber_shares() {
        let registry = ChannelRegistry::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let opens = AtomicUsize::new(0);
        let k = key();

        let a = registry
            .subscribe(k, || {
                opens.fetch_add(1, Ordering::SeqCst);
                fake(&closes, false)()
            })
            .await
            .unwrap();
        let b = registry
            .subscribe(k, || {
                opens.fetch_add(1, Ordering::SeqCst);
                fake(&closes, false)()
            })
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(registry.ref_count(&k).await, 2);
    }

    #[tokio::test]
    async fn test_closes_on_last_unsubscribe() {
        let registry = ChannelRegistry::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let k = key();
        registry.subscribe(k, fake(&closes, false)).await.unwrap();
        registry.subscribe(k, fake(&closes, false)).await.unwrap();

        registry.unsubscribe(&k).await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        registry.unsubscribe(&k).await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_key() {
        let registry: ChannelRegistry<FakeChannel> = ChannelRegistry::new();
        let err = registry.unsubscribe(&key()).await.unwrap_err();
        assert!(matches!(err, RealtimeError::UnknownChannel(_)));
    }

    #[tokio::test]
    async fn test_failed_open_registers_nothing() {
        let registry: ChannelRegistry<FakeChannel> = ChannelRegistry::new();
        let k = key();
        let res = registry
            .subscribe(k, || async { Err(RealtimeError::Transport("refused".into())) })
            .await;
        assert!(res.is_err());
        assert_eq!(registry.ref_count(&k).await, 0);
    }

    #[tokio::test]
    async fn test_teardown_continues_past_failures() {
        let registry = ChannelRegistry::new();
        let closes = Arc::new(AtomicUsize::new(0));
        registry.subscribe(key(), fake(&closes, true)).await.unwrap();
        registry.subscribe(key(), fake(&closes, false)).await.unwrap();
        registry.subscribe(key(), fake(&closes, true)).await.unwrap();

        assert_eq!(registry.teardown_all().await, 3);
        assert_eq!(closes.load(Ordering::SeqCst), 3);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_failed_close_still_removes() {
        let registry = ChannelRegistry::new();
        let closes = Arc::new(AtomicUsize::new(0));
        let k = key();
        registry.subscribe(k, fake(&closes, true)).await.unwrap();
        assert!(registry.unsubscribe(&k).await.is_ok());
        assert_eq!(registry.ref_count(&k).await, 0);
    }
}
