//! Live viewer client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Decoding of `"Changes"` frames into [`PixelUpdate`]s
//! - A [`ReplayBuffer`] that reconciles live updates with a full-board refresh
//!
//! A viewer fetches the board blob (tagged with the first sequence number not
//! yet folded into it), then replays every buffered update at or after that
//! sequence. Updates are last-write-wins per pixel, so a duplicate is harmless.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use place_core::{decode_changes, ApplyReport, Board, PixelUpdate};

use crate::protocol::{ProtocolError, PushFrame};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the viewer client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerEvent {
    Connected,
    /// One decoded `"Changes"` frame, in log order
    Pixels(Vec<PixelUpdate>),
    Disconnected,
}

/// Live updates retained between full-board refreshes.
pub struct ReplayBuffer {
    updates: VecDeque<PixelUpdate>,
    max_len: usize,
}

impl ReplayBuffer {
    pub fn new(max_len: usize) -> Self {
        Self {
            updates: VecDeque::with_capacity(max_len.min(1024)),
            max_len,
        }
    }

    /// Retain updates, evicting the oldest beyond `max_len`.
    pub fn record(&mut self, updates: impl IntoIterator<Item = PixelUpdate>) {
        for update in updates {
            if self.updates.len() >= self.max_len {
                self.updates.pop_front();
            }
            self.updates.push_back(update);
        }
    }

    /// Reconcile with a board fetched at `board_sequence`.
    ///
    /// Drops updates already folded into the board and applies the rest in
    /// order. The remaining updates stay buffered for the next refresh.
    pub fn rebase(&mut self, board: &mut Board, board_sequence: u64) -> ApplyReport {
        self.updates
            .retain(|u| u.sequence_number >= board_sequence);
        board.apply_all(self.updates.iter().map(|u| &u.pixel))
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn clear(&mut self) {
        self.updates.clear();
    }

    /// Highest sequence number seen, if any.
    pub fn latest_sequence(&self) -> Option<u64> {
        self.updates.iter().map(|u| u.sequence_number).max()
    }
}

/// The viewer client.
pub struct ViewerClient {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    event_rx: Option<mpsc::Receiver<ViewerEvent>>,
    event_tx: mpsc::Sender<ViewerEvent>,
    reader: Option<JoinHandle<()>>,
}

impl ViewerClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            event_rx: Some(event_rx),
            event_tx,
            reader: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ViewerEvent>> {
        self.event_rx.take()
    }

    /// Connect and spawn the frame reader task.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ViewerEvent::Connected).await;

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        self.reader = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some(updates) = decode_frame(text.as_str()) {
                            if event_tx.send(ViewerEvent::Pixels(updates)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        if ws_writer.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ViewerEvent::Disconnected).await;
        }));

        Ok(())
    }

    /// Stop reading frames.
    pub async fn disconnect(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

/// Decode a text frame; `None` for other channels or malformed payloads.
fn decode_frame(text: &str) -> Option<Vec<PixelUpdate>> {
    let frame = match PushFrame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Ignoring malformed frame: {e}");
            return None;
        }
    };
    if !frame.is_changes() {
        log::debug!("Ignoring frame on channel {}", frame.channel);
        return None;
    }
    match decode_changes(&frame.payload) {
        Ok(updates) => Some(updates),
        Err(e) => {
            log::warn!("Ignoring undecodable change payload: {e}");
            None
        }
    }
}
