//! WebSocket broadcast relay server.
//!
//! ```text
//! Client A ──┐                         ┌──► Client A
//!            ├── RelayHub("doc:x:…") ──┼──► Client B
//! Client B ──┘                         └──► Client C
//! ```
//!
//! Each connection may subscribe to any number of channels. A broadcast is
//! stamped with the channel's next sequence number and fanned out to every
//! subscriber, the sender included. The server never looks inside payloads.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{EnvelopeKind, RelayEnvelope};
use crate::broadcast::RelayHub;
use crate::error::Result;
use crate::relay::RelayFrame;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per subscriber before it lags
    pub channel_capacity: usize,
    /// Subscriptions allowed per connection
    pub max_channels_per_connection: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel_capacity: 256,
            max_channels_per_connection: 64,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_in: u64,
    pub bytes_in: u64,
    pub active_channels: usize,
}

/// The relay server.
pub struct RelayServer {
    config: RelayServerConfig,
    hub: Arc<RelayHub>,
    stats: Arc<RwLock<RelayServerStats>>,
}

impl RelayServer {
    pub fn new(config: RelayServerConfig) -> Self {
        let hub = Arc::new(RelayHub::new(config.channel_capacity));
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(RelayServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayServerConfig::default())
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections forever.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats, config).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Bind, then serve.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<RelayHub>,
        stats: Arc<RwLock<RelayServerStats>>,
        config: RelayServerConfig,
    ) -> Result<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // forwarders push encoded frames here; the loop below owns the sink
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(config.channel_capacity.max(1));
        let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

        let outcome: Result<()> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                {
                                    let mut s = stats.write().await;
                                    s.frames_in += 1;
                                    s.bytes_in += bytes.len() as u64;
                                }
                                let envelope = match RelayEnvelope::decode(&bytes) {
                                    Ok(env) => env,
                                    Err(e) => {
                                        log::warn!("failed to decode envelope from {addr}: {e}");
                                        continue;
                                    }
                                };
                                match envelope.kind {
                                    EnvelopeKind::Subscribe => {
                                        if forwarders.contains_key(&envelope.channel) {
                                            continue;
                                        }
                                        if forwarders.len() >= config.max_channels_per_connection {
                                            log::warn!("{addr}: subscription limit reached, rejecting {}", envelope.channel);
                                            let reply = RelayEnvelope::rejected(&envelope.channel, "subscription limit reached");
                                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                            continue;
                                        }
                                        let group = hub.get_or_create(&envelope.channel).await;
                                        let task = tokio::spawn(forward(group.subscribe(), out_tx.clone()));
                                        log::debug!("{addr} subscribed to {}", envelope.channel);
                                        forwarders.insert(envelope.channel, task);
                                    }
                                    EnvelopeKind::Unsubscribe => {
                                        if let Some(task) = forwarders.remove(&envelope.channel) {
                                            task.abort();
                                            let _ = task.await;
                                            hub.remove_if_unused(&envelope.channel).await;
                                            log::debug!("{addr} unsubscribed from {}", envelope.channel);
                                        }
                                    }
                                    EnvelopeKind::Broadcast => {
                                        if !forwarders.contains_key(&envelope.channel) {
                                            log::debug!("{addr}: broadcast on unsubscribed {}, dropped", envelope.channel);
                                            continue;
                                        }
                                        let group = hub.get_or_create(&envelope.channel).await;
                                        group.publish(&envelope.event, envelope.payload);
                                    }
                                    EnvelopeKind::Ping => {
                                        let pong = RelayEnvelope::pong().encode()?;
                                        ws_sender.send(Message::Binary(pong.into())).await?;
                                    }
                                    EnvelopeKind::Pong | EnvelopeKind::Rejected => {}
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    Some(bytes) = out_rx.recv() => {
                        ws_sender.send(Message::Binary(bytes.into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        for (channel, task) in forwarders {
            task.abort();
            // the aborted forwarder may still hold its receiver for a moment
            let _ = task.await;
            hub.remove_if_unused(&channel).await;
        }

        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_channels = hub.channel_count().await;
        outcome
    }

    pub async fn stats(&self) -> RelayServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_channels = self.hub.channel_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }
}

/// Copy one channel's frames into a connection's outgoing queue.
async fn forward(mut frames: broadcast::Receiver<Arc<RelayFrame>>, out: mpsc::Sender<Vec<u8>>) {
    loop {
        match frames.recv().await {
            Ok(frame) => {
                let bytes = match RelayEnvelope::from_frame(&frame).encode() {
                    Ok(b) => b,
                    Err(e) => {
                        log::error!("{}: failed to encode frame: {e}", frame.channel);
                        continue;
                    }
                };
                if out.send(bytes).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(n)) => log::warn!("subscriber lagged by {n} frames"),
            Err(RecvError::Closed) => break,
        }
    }
}
