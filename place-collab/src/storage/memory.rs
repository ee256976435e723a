//! In-memory store for tests and ephemeral runs (no `PLACE_STORAGE_PATH`).
//!
//! Mirrors [`super::PlaceStore`] token semantics and can be scripted to fail
//! the next fetches, appends or user saves, which is how the retry and error
//! paths are exercised.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use place_core::{ChangeLogEntry, Pixel, UserState};

use super::rocks::{parse_token, token_for};
use super::{blob_key, StoreError};
use crate::changelog::{ChangeLog, ContinuationToken, CursorStore, FeedPage, LogError, PageSize};
use crate::compactor::BlobStore;
use crate::tweets::{Tweet, TweetStore};
use crate::users::UserStore;

/// Page length used for an unbounded hint.
const DEFAULT_PAGE: usize = 1000;

#[derive(Default)]
struct Inner {
    entries: Vec<ChangeLogEntry>,
    users: HashMap<String, UserState>,
    blobs: HashMap<String, Vec<u8>>,
    cursors: HashMap<String, ContinuationToken>,
    tweets: HashMap<String, Tweet>,
    fetch_faults: VecDeque<LogError>,
    append_faults: VecDeque<LogError>,
    user_save_faults: VecDeque<StoreError>,
    append_calls: usize,
}

/// Everything in one mutex. Not durable.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next fetch with `error` (queued in order).
    pub fn fail_next_fetch(&self, error: LogError) {
        self.lock().fetch_faults.push_back(error);
    }

    /// Fail the next append with `error` (queued in order).
    pub fn fail_next_append(&self, error: LogError) {
        self.lock().append_faults.push_back(error);
    }

    /// Fail the next user save with `error` (queued in order).
    pub fn fail_next_user_save(&self, error: StoreError) {
        self.lock().user_save_faults.push_back(error);
    }

    /// Every entry appended so far.
    pub fn entries(&self) -> Vec<ChangeLogEntry> {
        self.lock().entries.clone()
    }

    /// Append attempts, including failed ones.
    pub fn append_calls(&self) -> usize {
        self.lock().append_calls
    }
}

impl ChangeLog for MemoryStore {
    async fn fetch_page(
        &self,
        from: Option<ContinuationToken>,
        page_size: PageSize,
    ) -> Result<FeedPage, LogError> {
        let mut inner = self.lock();
        if let Some(fault) = inner.fetch_faults.pop_front() {
            return Err(fault);
        }
        let start = match &from {
            Some(token) => parse_token(token)?,
            None => 1,
        };
        let limit = page_size
            .limit()
            .map_or(DEFAULT_PAGE, |n| n.max(1) as usize);
        let entries: Vec<ChangeLogEntry> = inner
            .entries
            .iter()
            .filter(|e| e.sequence_number >= start)
            .take(limit)
            .cloned()
            .collect();
        let next = entries.last().map_or(start, |e| e.sequence_number + 1);
        Ok(FeedPage {
            entries,
            continuation: token_for(next),
        })
    }

    async fn append_batch(&self, items: Vec<Pixel>) -> Result<u64, LogError> {
        let mut inner = self.lock();
        inner.append_calls += 1;
        if let Some(fault) = inner.append_faults.pop_front() {
            return Err(fault);
        }
        let seq = inner.entries.len() as u64 + 1;
        inner.entries.push(ChangeLogEntry {
            sequence_number: seq,
            items,
        });
        Ok(seq)
    }

    async fn tail(&self) -> Result<ContinuationToken, LogError> {
        Ok(token_for(self.lock().entries.len() as u64 + 1))
    }
}

impl UserStore for MemoryStore {
    fn load_user(&self, id: &str) -> Result<Option<UserState>, StoreError> {
        Ok(self.lock().users.get(id).cloned())
    }

    fn save_user(&self, user: &UserState) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(fault) = inner.user_save_faults.pop_front() {
            return Err(fault);
        }
        inner.users.insert(user.id.clone(), user.clone());
        Ok(())
    }
}

impl BlobStore for MemoryStore {
    fn read_blob(&self, container: &str, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock().blobs.get(&blob_key(container, name)).cloned())
    }

    fn write_blob(&self, container: &str, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.lock()
            .blobs
            .insert(blob_key(container, name), bytes.to_vec());
        Ok(())
    }
}

impl TweetStore for MemoryStore {
    fn save_tweet(&self, tweet: &Tweet) -> Result<(), StoreError> {
        self.lock().tweets.insert(tweet.id.clone(), tweet.clone());
        Ok(())
    }

    fn top_tweets(&self, limit: usize) -> Result<Vec<Tweet>, StoreError> {
        let mut approved: Vec<Tweet> = self
            .lock()
            .tweets
            .values()
            .filter(|t| t.approved)
            .cloned()
            .collect();
        approved.sort_by(|a, b| b.created_ms.cmp(&a.created_ms).then_with(|| b.id.cmp(&a.id)));
        approved.truncate(limit);
        Ok(approved)
    }
}

impl CursorStore for MemoryStore {
    fn load_cursor(&self, name: &str) -> Result<Option<ContinuationToken>, StoreError> {
        Ok(self.lock().cursors.get(name).cloned())
    }

    fn save_cursor(&self, name: &str, token: &ContinuationToken) -> Result<(), StoreError> {
        self.lock().cursors.insert(name.to_string(), token.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::LogErrorKind;

    #[tokio::test]
    async fn test_tokens_match_rocks_semantics() {
        let store = MemoryStore::new();
        assert_eq!(store.tail().await.unwrap(), ContinuationToken::new("1"));
        store.append_batch(vec![Pixel::new(0, 0, 1)]).await.unwrap();
        store.append_batch(vec![Pixel::new(1, 0, 2)]).await.unwrap();

        let page = store.fetch_page(None, PageSize::Limit(1)).await.unwrap();
        assert_eq!(page.entries[0].sequence_number, 1);
        assert_eq!(page.continuation, ContinuationToken::new("2"));

        let rest = store
            .fetch_page(Some(page.continuation), PageSize::Unbounded)
            .await
            .unwrap();
        assert_eq!(rest.entries[0].sequence_number, 2);
        assert_eq!(rest.continuation, store.tail().await.unwrap());
    }

    #[tokio::test]
    async fn test_scripted_faults_fire_once() {
        let store = MemoryStore::new();
        store.fail_next_fetch(LogError::new(LogErrorKind::Gone, "moved"));
        store.fail_next_append(LogError::new(LogErrorKind::TooManyRequests, "busy"));

        assert!(store.fetch_page(None, PageSize::Unbounded).await.is_err());
        assert!(store.fetch_page(None, PageSize::Unbounded).await.is_ok());

        assert!(store.append_batch(Vec::new()).await.is_err());
        assert_eq!(store.append_batch(Vec::new()).await.unwrap(), 1);
        assert_eq!(store.append_calls(), 2);
    }

    #[test]
    fn test_user_save_fault_leaves_user_unsaved() {
        let store = MemoryStore::new();
        store.fail_next_user_save(StoreError::Database("disk full".to_string()));

        let user = UserState::new("alice", 0);
        assert_eq!(
            store.save_user(&user),
            Err(StoreError::Database("disk full".to_string()))
        );
        assert_eq!(store.load_user("alice").unwrap(), None);

        store.save_user(&user).unwrap();
        assert_eq!(store.load_user("alice").unwrap(), Some(user));
    }

    #[test]
    fn test_top_tweets_is_limited_and_ordered() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store
                .save_tweet(&Tweet::new(format!("t{i:02}"), format!("https://t/{i}"), i).approved())
                .unwrap();
        }
        store.save_tweet(&Tweet::new("pending", "https://t/p", 100)).unwrap();

        let top = store.top_tweets(20).unwrap();
        assert_eq!(top.len(), 20);
        assert_eq!(top[0].id, "t24");
        assert_eq!(top[19].id, "t05");
    }
}
