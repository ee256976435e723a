//! WebSocket endpoint for live viewers.
//!
//! ```text
//! Viewer A ──┐                          ┌── Broadcaster (ChangeLogReader)
//!             ├── ViewerServer ── BroadcastGroup
//! Viewer B ──┘   (text frames)          └── PushFrame {channel, payload}
//! ```
//!
//! Viewers never send application data. Each connection subscribes to the
//! shared [`BroadcastGroup`] and forwards every frame as one text message
//! until the socket closes. Frames missed while lagging are dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{BroadcastGroup, ViewerInfo};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per viewer before it starts lagging
    pub broadcast_capacity: usize,
    /// Connections beyond this are closed right after the handshake
    pub max_viewers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_viewers: 10_000,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub frames_forwarded: u64,
    pub bytes_forwarded: u64,
    /// Frames skipped because a viewer lagged
    pub frames_dropped: u64,
}

/// The viewer server.
pub struct ViewerServer {
    config: ServerConfig,
    group: Arc<BroadcastGroup>,
    stats: Arc<RwLock<ServerStats>>,
}

impl ViewerServer {
    pub fn new(config: ServerConfig, group: Arc<BroadcastGroup>) -> Self {
        Self {
            config,
            group,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind `bind_addr` and accept viewers forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Viewer server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept viewers on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let group = self.group.clone();
            let stats = self.stats.clone();
            let max_viewers = self.config.max_viewers;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, group, stats, max_viewers).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        group: Arc<BroadcastGroup>,
        stats: Arc<RwLock<ServerStats>>,
        max_viewers: usize,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        if group.viewer_count().await >= max_viewers {
            log::warn!("Rejecting viewer {addr}: {max_viewers} viewers already connected");
            stats.write().await.rejected_connections += 1;
            ws_sender.send(Message::Close(None)).await?;
            return Ok(());
        }

        let info = ViewerInfo::new(Some(addr));
        let viewer_id = info.viewer_id;
        let mut rx = group.add_viewer(info).await;
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("Viewer {viewer_id} connected from {addr}");

        let result = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Viewer {viewer_id} closed the connection");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        Some(Ok(_)) => {
                            log::trace!("Ignoring inbound message from viewer {viewer_id}");
                        }
                    }
                }

                frame = rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            let text = match frame.encode() {
                                Ok(text) => text,
                                Err(e) => {
                                    log::error!("Dropping unencodable frame: {e}");
                                    continue;
                                }
                            };
                            let len = text.len() as u64;
                            if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                                break Err(e);
                            }
                            let mut s = stats.write().await;
                            s.frames_forwarded += 1;
                            s.bytes_forwarded += len;
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Viewer {viewer_id} lagged by {n} frames");
                            stats.write().await.frames_dropped += n;
                        }
                        Err(RecvError::Closed) => break Ok(()),
                    }
                }
            }
        };

        group.remove_viewer(&viewer_id).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Viewer {viewer_id} disconnected");
        result
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn group(&self) -> &Arc<BroadcastGroup> {
        &self.group
    }
}
