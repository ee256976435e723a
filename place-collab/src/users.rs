//! Per-user throttle state storage and serialization.
//!
//! Every admission check is load → evaluate → save. [`UserLocks`] hands out
//! one async mutex per user id so two concurrent submissions from the same
//! user cannot both see an expired cooldown.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use place_core::UserState;

use crate::storage::StoreError;

/// Durable per-user state.
pub trait UserStore: Send + Sync {
    fn load_user(&self, id: &str) -> Result<Option<UserState>, StoreError>;
    fn save_user(&self, user: &UserState) -> Result<(), StoreError>;
}

/// Map entries above this count trigger a sweep of idle locks.
const PRUNE_THRESHOLD: usize = 4096;

/// Per-user async mutexes.
#[derive(Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `user_id`. Held until the guard drops.
    pub async fn acquire(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            if locks.len() >= PRUNE_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop locks nobody holds or waits on. Returns how many were removed.
    pub async fn prune(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locks.lock().await.is_empty()
    }
}
