//! # place-collab: Change log, fan-out and persistence for the shared canvas
//!
//! Accepts pixel writes, records them in an ordered change log, folds the log
//! into the packed board snapshot and pushes every new entry to live viewers.
//!
//! ## Architecture
//!
//! ```text
//!  api::update_pixel ──► WriteCoordinator ──append──► ChangeLog (PlaceStore)
//!                          │ UserLocks                    │         │
//!                          ▼                              │         │ fetch_page
//!                        UserStore                        │         ▼
//!                                                         │   ChangeLogReader
//!  api::board ◄── BlobStore ◄── Compactor ◄──fetch_page───┘         │
//!                                                                   ▼
//!  ViewerClient ◄──WebSocket── ViewerServer ◄── BroadcastGroup ◄── Broadcaster
//! ```
//!
//! ## Modules
//!
//! - [`changelog`] — Log client abstraction and the polling reader
//! - [`broadcast`] — Fan-out to connected viewers
//! - [`coordinator`] — Admission and chunked append of submissions
//! - [`compactor`] — Folding the log into the board blob
//! - [`storage`] — RocksDB and in-memory backends
//! - [`tweets`] — Moderated tweets for the front page
//! - [`server`] / [`client`] — WebSocket viewer endpoint and client
//! - [`api`] — Transport-agnostic request handlers
//! - [`config`] — `PLACE_*` environment configuration

pub mod api;
pub mod broadcast;
pub mod changelog;
pub mod client;
pub mod compactor;
pub mod config;
pub mod coordinator;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod tweets;
pub mod users;

// Re-exports for convenience
pub use api::{ApiResponse, RequestHeaders, ResponseBody};
pub use broadcast::{
    BroadcastGroup, BroadcastStats, Broadcaster, PushTransport, ViewerInfo,
};
pub use changelog::{
    ChangeLog, ChangeLogReader, ContinuationToken, CursorStore, FeedPage, LogError,
    LogErrorKind, PageSize, ReaderConfig, ReaderExit, ReaderState, ReaderStats, StartFrom,
};
pub use client::{ConnectionState, ReplayBuffer, ViewerClient, ViewerEvent};
pub use compactor::{BlobStore, CompactionError, CompactionReport, Compactor, CompactorConfig};
pub use config::{ConfigError, Endpoints, ServiceConfig};
pub use coordinator::{
    CoordinatorConfig, PartialAppend, SubmitError, SubmitOutcome, WriteCoordinator,
};
pub use protocol::{ProtocolError, PushFrame, CHANGES_CHANNEL};
pub use server::{ServerConfig, ServerStats, ViewerServer};
pub use storage::{MemoryStore, PlaceStore, StoreConfig, StoreError};
pub use tweets::{Tweet, TweetStore, TOP_TWEETS_LIMIT};
pub use users::{UserLocks, UserStore};
