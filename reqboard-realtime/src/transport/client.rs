//! WebSocket client side of the relay: a [`BroadcastRelay`] backed by a
//! [`RelayServer`](super::RelayServer) connection.
//!
//! One connection carries every channel. A writer task drains the outgoing
//! queue into the socket; a reader task routes incoming broadcasts to the
//! per-channel tokio broadcast senders handed out by `open_channel`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{EnvelopeKind, RelayEnvelope};
use crate::error::{RealtimeError, Result};
use crate::relay::{BroadcastRelay, RelayFrame};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

type ChannelMap = Arc<Mutex<HashMap<String, broadcast::Sender<Arc<RelayFrame>>>>>;

/// Relay client over one WebSocket connection.
pub struct WsRelay {
    url: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing: mpsc::Sender<Vec<u8>>,
    channels: ChannelMap,
    pongs: Arc<AtomicU64>,
    capacity: usize,
    tasks: Vec<JoinHandle<()>>,
}

impl WsRelay {
    /// Connect to a relay server, e.g. `ws://127.0.0.1:9090`.
    pub async fn connect(url: impl Into<String>) -> Result<Self> {
        Self::connect_with_capacity(url, 256).await
    }

    /// `capacity` is the per-channel buffer of frames not yet consumed.
    pub async fn connect_with_capacity(url: impl Into<String>, capacity: usize) -> Result<Self> {
        let url = url.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        log::info!("connected to relay {url}");

        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let channels: ChannelMap = Arc::new(Mutex::new(HashMap::new()));
        let pongs = Arc::new(AtomicU64::new(0));

        let (outgoing, mut out_rx) = mpsc::channel::<Vec<u8>>(capacity.max(1));
        let writer_state = state.clone();
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(Message::Binary(data.into())).await {
                    log::error!("relay write failed: {e}");
                    break;
                }
            }
            *writer_state.write().await = ConnectionState::Disconnected;
            let _ = ws_writer.close().await;
        });

        let reader_state = state.clone();
        let reader_channels = channels.clone();
        let reader_pongs = pongs.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let envelope = match RelayEnvelope::decode(&bytes) {
                            Ok(env) => env,
                            Err(e) => {
                                log::warn!("dropping undecodable relay message: {e}");
                                continue;
                            }
                        };
                        match envelope.kind {
                            EnvelopeKind::Broadcast => {
                                let channels = reader_channels.lock().await;
                                if let Some(tx) = channels.get(&envelope.channel) {
                                    // no local receivers is fine
                                    let _ = tx.send(Arc::new(envelope.into_frame()));
                                }
                            }
                            EnvelopeKind::Pong => {
                                reader_pongs.fetch_add(1, Ordering::Relaxed);
                            }
                            EnvelopeKind::Rejected => {
                                log::warn!("relay rejected {}: {}", envelope.channel, envelope.event);
                                // closes the receivers handed out for it
                                reader_channels.lock().await.remove(&envelope.channel);
                            }
                            other => log::debug!("unexpected {other:?} from relay"),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        log::error!("relay read failed: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            *reader_state.write().await = ConnectionState::Disconnected;
            // closes every open receiver
            reader_channels.lock().await.clear();
            log::info!("relay connection closed");
        });

        Ok(Self {
            url,
            state,
            outgoing,
            channels,
            pongs,
            capacity,
            tasks: vec![writer, reader],
        })
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send an application-level ping; the reply is counted by
    /// [`pongs_received`](Self::pongs_received).
    pub async fn ping(&self) -> Result<()> {
        self.push(RelayEnvelope::ping()).await
    }

    pub fn pongs_received(&self) -> u64 {
        self.pongs.load(Ordering::Relaxed)
    }

    async fn push(&self, envelope: RelayEnvelope) -> Result<()> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(RealtimeError::Transport(format!("not connected to {}", self.url)));
        }
        let bytes = envelope.encode()?;
        self.outgoing
            .send(bytes)
            .await
            .map_err(|_| RealtimeError::Transport("relay writer stopped".into()))
    }
}

#[async_trait]
impl BroadcastRelay for WsRelay {
    async fn open_channel(&self, name: &str) -> Result<broadcast::Receiver<Arc<RelayFrame>>> {
        let mut channels = self.channels.lock().await;
        if let Some(tx) = channels.get(name) {
            return Ok(tx.subscribe());
        }
        self.push(RelayEnvelope::subscribe(name)).await?;
        let (tx, rx) = broadcast::channel(self.capacity.max(1));
        channels.insert(name.to_string(), tx);
        Ok(rx)
    }

    async fn send(&self, channel: &str, event: &str, payload: Vec<u8>) -> Result<()> {
        if !self.channels.lock().await.contains_key(channel) {
            return Err(RealtimeError::ChannelClosed(channel.to_string()));
        }
        self.push(RelayEnvelope::broadcast(channel, event, payload)).await
    }

    async fn close_channel(&self, name: &str) -> Result<()> {
        if self.channels.lock().await.remove(name).is_none() {
            return Err(RealtimeError::ChannelClosed(name.to_string()));
        }
        self.push(RelayEnvelope::unsubscribe(name)).await
    }
}

impl Drop for WsRelay {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
