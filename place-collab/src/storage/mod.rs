//! Persistent and in-memory backends for the canvas service.
//!
//! ```text
//! ┌──────────────────┐               ┌─────────────────────────────────────┐
//! │ WriteCoordinator │──append────►  │ CF "changes" — seq (BE) → entry     │
//! │ ChangeLogReader  │◄─fetch_page── │                                     │
//! │ Compactor        │──blobs──────► │ CF "blobs"   — container/name (LZ4) │
//! │                  │──cursors────► │ CF "cursors" — name → token         │
//! │ UserLocks        │──users──────► │ CF "users"   — id → UserState       │
//! └──────────────────┘               └─────────────────────────────────────┘
//!                                       PlaceStore (RocksDB) / MemoryStore
//! ```

pub mod memory;
pub mod rocks;

use thiserror::Error;

pub use memory::MemoryStore;
pub use rocks::{PlaceStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    /// A lock guarding in-process state was poisoned by a panic
    #[error("store lock poisoned: {0}")]
    Poisoned(&'static str),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Key for a blob in the `blobs` column family.
pub(crate) fn blob_key(container: &str, name: &str) -> String {
    format!("{container}/{name}")
}
