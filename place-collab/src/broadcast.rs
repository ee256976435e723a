//! Fan-out of change-log batches to every connected viewer.
//!
//! ```text
//!  ChangeLogReader ──► Broadcaster ──► PushTransport (BroadcastGroup)
//!                        │                  │ tokio broadcast, O(1) send
//!                        │ JSON, "Changes"  ├──► viewer rx
//!                        ▼                  ├──► viewer rx
//!                 [{items, sequenceNumber}] └──► viewer rx
//! ```
//!
//! Delivery is fire-and-forget. A viewer that falls more than `capacity`
//! frames behind loses the oldest frames and heals on its next full-board
//! refresh.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use place_core::{encode_changes, ChangeLogEntry};

use crate::protocol::{ProtocolError, PushFrame, CHANGES_CHANNEL};

/// One-to-many push primitive consumed by the [`Broadcaster`].
///
/// No delivery confirmation: implementations must not block on slow viewers.
pub trait PushTransport: Send + Sync {
    fn broadcast_all(&self, channel: &str, payload: Arc<str>);
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Frames sent while no viewer was subscribed
    pub messages_unheard: u64,
    pub active_viewers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_unheard: AtomicU64,
}

/// A connected viewer.
#[derive(Debug, Clone)]
pub struct ViewerInfo {
    pub viewer_id: Uuid,
    pub remote_addr: Option<SocketAddr>,
    pub connected_at: Instant,
}

impl ViewerInfo {
    pub fn new(remote_addr: Option<SocketAddr>) -> Self {
        Self {
            viewer_id: Uuid::new_v4(),
            remote_addr,
            connected_at: Instant::now(),
        }
    }
}

/// Every live viewer shares one tokio broadcast channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<PushFrame>>,
    viewers: Arc<RwLock<HashMap<Uuid, ViewerInfo>>>,
    /// Frames buffered per viewer before it starts lagging
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            viewers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_unheard: AtomicU64::new(0),
            }),
        }
    }

    /// Register a viewer and return its frame receiver.
    pub async fn add_viewer(&self, info: ViewerInfo) -> broadcast::Receiver<Arc<PushFrame>> {
        let mut viewers = self.viewers.write().await;
        viewers.insert(info.viewer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_viewer(&self, viewer_id: &Uuid) -> Option<ViewerInfo> {
        self.viewers.write().await.remove(viewer_id)
    }

    /// Send a frame to every subscriber. Returns how many receivers got it.
    pub fn send(&self, frame: PushFrame) -> usize {
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(Arc::new(frame)) {
            Ok(count) => count,
            Err(_) => {
                self.atomic_stats
                    .messages_unheard
                    .fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub async fn viewer_count(&self) -> usize {
        self.viewers.read().await.len()
    }

    pub async fn has_viewer(&self, viewer_id: &Uuid) -> bool {
        self.viewers.read().await.contains_key(viewer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_unheard: self.atomic_stats.messages_unheard.load(Ordering::Relaxed),
            active_viewers: self.viewers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw receiver without viewer bookkeeping.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PushFrame>> {
        self.sender.subscribe()
    }
}

impl PushTransport for BroadcastGroup {
    fn broadcast_all(&self, channel: &str, payload: Arc<str>) {
        let receivers = self.send(PushFrame::new(channel, payload));
        log::trace!("Pushed frame on {channel} to {receivers} viewers");
    }
}

/// Turns change-log entries into a single push message.
pub struct Broadcaster {
    transport: Arc<dyn PushTransport>,
    /// Largest payload a viewer connection accepts
    max_payload_bytes: Option<usize>,
    published_entries: AtomicU64,
}

impl Broadcaster {
    pub fn new(transport: Arc<dyn PushTransport>) -> Self {
        Self {
            transport,
            max_payload_bytes: None,
            published_entries: AtomicU64::new(0),
        }
    }

    /// Refuse to send payloads larger than `limit` bytes.
    pub fn with_max_payload(mut self, limit: usize) -> Self {
        self.max_payload_bytes = Some(limit);
        self
    }

    /// Push `entries` as one `[{items, sequenceNumber}]` message on the
    /// `"Changes"` channel, keeping their order.
    ///
    /// Returns `Ok(false)` without sending when `entries` is empty. Nothing
    /// is sent when the payload exceeds the configured maximum.
    pub fn publish(&self, entries: &[ChangeLogEntry]) -> Result<bool, ProtocolError> {
        if entries.is_empty() {
            return Ok(false);
        }
        let payload =
            encode_changes(entries).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if let Some(limit) = self.max_payload_bytes {
            if payload.len() > limit {
                return Err(ProtocolError::PayloadTooLarge {
                    size: payload.len(),
                    limit,
                });
            }
        }
        self.transport
            .broadcast_all(CHANGES_CHANNEL, Arc::from(payload));
        self.published_entries
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        Ok(true)
    }

    /// Total entries published since creation.
    pub fn published_entries(&self) -> u64 {
        self.published_entries.load(Ordering::Relaxed)
    }
}
