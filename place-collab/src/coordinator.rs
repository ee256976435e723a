//! Admission and durable append of pixel submissions.
//!
//! ```text
//!  submit_batch ─► validate ─► UserLocks[user] ─┬─ load/create UserState
//!                                               ├─ evaluate (throttle)
//!                                               └─ save last_insert_ms
//!                               (lock released) ─► append in chunks ─► ChangeLog
//! ```
//!
//! Blocked users receive the same accepted outcome as everyone else and
//! nothing is appended.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use place_core::{
    evaluate, is_admin_idp, validate_batch, BoardGeometry, Pixel, PixelWrite, ThrottleReason,
    TimestampMs, UserState, ValidationError, DEFAULT_ADMIN_IDP, DEFAULT_THROTTLE_SECONDS,
};

use crate::changelog::{ChangeLog, LogError};
use crate::storage::StoreError;
use crate::users::{UserLocks, UserStore};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub geometry: BoardGeometry,
    /// Cooldown between accepted writes of a regular user
    pub throttle_seconds: u64,
    /// Identity provider whose users are admins
    pub admin_idp: String,
    /// Pixels per log append
    pub chunk_size: usize,
    /// Extra attempts per chunk on transient log errors
    pub append_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            geometry: BoardGeometry::default(),
            throttle_seconds: DEFAULT_THROTTLE_SECONDS,
            admin_idp: DEFAULT_ADMIN_IDP.to_string(),
            chunk_size: 300,
            append_retries: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

impl CoordinatorConfig {
    /// Small board, millisecond backoff.
    pub fn for_testing() -> Self {
        Self {
            geometry: BoardGeometry::square(16),
            retry_backoff: Duration::from_millis(1),
            ..Self::default()
        }
    }
}

/// Result of an admitted or throttled submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub accepted: bool,
    /// Time the submission was evaluated at
    pub timestamp_ms: TimestampMs,
    pub reason: ThrottleReason,
    /// Next eligible time when rate limited
    pub retry_at_ms: Option<TimestampMs>,
    /// Log sequence numbers of the appended chunks, empty for silent drops
    pub sequence_numbers: Vec<u64>,
}

/// A chunked append that stopped partway. Earlier chunks stay committed.
#[derive(Debug, Clone, Error)]
#[error("append failed after {committed_chunks} of {total_chunks} chunks: {source}")]
pub struct PartialAppend {
    pub committed_chunks: usize,
    pub total_chunks: usize,
    pub sequence_numbers: Vec<u64>,
    pub source: LogError,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid submission: {0}")]
    Validation(#[from] ValidationError),
    #[error("user store failure: {0}")]
    UserStore(#[from] StoreError),
    #[error(transparent)]
    Append(#[from] PartialAppend),
}

/// Validates, throttles and appends pixel batches.
pub struct WriteCoordinator<L> {
    log: Arc<L>,
    users: Arc<dyn UserStore>,
    locks: UserLocks,
    config: CoordinatorConfig,
}

impl<L: ChangeLog> WriteCoordinator<L> {
    pub fn new(log: Arc<L>, users: Arc<dyn UserStore>, config: CoordinatorConfig) -> Self {
        Self {
            log,
            users,
            locks: UserLocks::new(),
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Admit a batch of pixel writes for `user_id` at `now`.
    ///
    /// Throttle rejections come back as `Ok` with `accepted == false`.
    pub async fn submit_batch(
        &self,
        user_id: &str,
        idp: &str,
        writes: &[PixelWrite],
        now: TimestampMs,
    ) -> Result<SubmitOutcome, SubmitError> {
        let pixels = validate_batch(writes, self.config.geometry)?;

        let guard = self.locks.acquire(user_id).await;
        let mut user = self.load_or_create(user_id, idp, now)?;
        let decision = evaluate(&user, pixels.len(), now, self.config.throttle_seconds);

        let mut outcome = SubmitOutcome {
            accepted: decision.allow,
            timestamp_ms: now,
            reason: decision.reason,
            retry_at_ms: decision.retry_at_ms,
            sequence_numbers: Vec::new(),
        };
        match decision.reason {
            ThrottleReason::Ok => {}
            ThrottleReason::Blocked => {
                log::info!("Dropping {} pixels from blocked user {user_id}", pixels.len());
                outcome.accepted = true;
                return Ok(outcome);
            }
            reason => {
                log::debug!("Rejected submission from {user_id}: {reason:?}");
                return Ok(outcome);
            }
        }

        user.record_insert(now);
        self.users.save_user(&user)?;
        drop(guard);

        let pixels: Vec<Pixel> = pixels
            .into_iter()
            .map(|p| p.authored(user_id, now))
            .collect();
        outcome.sequence_numbers = self.append_chunked(pixels).await?;
        log::debug!(
            "Accepted submission from {user_id} at sequence {:?}",
            outcome.sequence_numbers
        );
        Ok(outcome)
    }

    /// Get-or-create the user record, refreshing the admin flag from `idp`.
    pub async fn user_info(
        &self,
        user_id: &str,
        idp: &str,
        now: TimestampMs,
    ) -> Result<UserState, StoreError> {
        let _guard = self.locks.acquire(user_id).await;
        self.load_or_create(user_id, idp, now)
    }

    /// Block or unblock a user. Creates the record when missing.
    pub async fn set_blocked(
        &self,
        user_id: &str,
        blocked: bool,
        now: TimestampMs,
    ) -> Result<UserState, StoreError> {
        let _guard = self.locks.acquire(user_id).await;
        let mut user = self
            .users
            .load_user(user_id)?
            .unwrap_or_else(|| UserState::new(user_id, now));
        user.is_blocked = blocked;
        self.users.save_user(&user)?;
        log::info!("User {user_id} blocked={blocked}");
        Ok(user)
    }

    /// Caller must hold the user's lock.
    fn load_or_create(
        &self,
        user_id: &str,
        idp: &str,
        now: TimestampMs,
    ) -> Result<UserState, StoreError> {
        let is_admin = is_admin_idp(idp, &self.config.admin_idp);
        match self.users.load_user(user_id)? {
            Some(mut user) => {
                if user.is_admin != is_admin {
                    user.is_admin = is_admin;
                    self.users.save_user(&user)?;
                }
                Ok(user)
            }
            None => {
                let mut user = UserState::new(user_id, now);
                user.is_admin = is_admin;
                self.users.save_user(&user)?;
                log::debug!("Created user {user_id} (admin={is_admin})");
                Ok(user)
            }
        }
    }

    async fn append_chunked(&self, pixels: Vec<Pixel>) -> Result<Vec<u64>, PartialAppend> {
        let chunks: Vec<Vec<Pixel>> = pixels
            .chunks(self.config.chunk_size.max(1))
            .map(<[Pixel]>::to_vec)
            .collect();
        let total_chunks = chunks.len();
        let mut sequence_numbers = Vec::with_capacity(total_chunks);

        for chunk in chunks {
            match self.append_with_retry(chunk).await {
                Ok(seq) => sequence_numbers.push(seq),
                Err(source) => {
                    log::error!(
                        "Append failed after {} of {total_chunks} chunks: {source}",
                        sequence_numbers.len()
                    );
                    return Err(PartialAppend {
                        committed_chunks: sequence_numbers.len(),
                        total_chunks,
                        sequence_numbers,
                        source,
                    });
                }
            }
        }
        Ok(sequence_numbers)
    }

    async fn append_with_retry(&self, chunk: Vec<Pixel>) -> Result<u64, LogError> {
        let mut attempt = 0;
        loop {
            match self.log.append_batch(chunk.clone()).await {
                Ok(seq) => return Ok(seq),
                Err(e) if e.is_transient() && attempt < self.config.append_retries => {
                    attempt += 1;
                    let wait = e.retry_after.unwrap_or(self.config.retry_backoff);
                    log::warn!("Retriable append error (attempt {attempt}): {e}; retrying in {wait:?}");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::LogErrorKind;
    use crate::storage::MemoryStore;

    const T0: TimestampMs = 1_700_000_000_000;

    fn coordinator(store: &Arc<MemoryStore>) -> WriteCoordinator<MemoryStore> {
        WriteCoordinator::new(store.clone(), store.clone(), CoordinatorConfig::for_testing())
    }

    fn one(x: i64, y: i64, color: i64) -> Vec<PixelWrite> {
        vec![PixelWrite::new(x, y, color)]
    }

    #[tokio::test]
    async fn test_first_submission_is_appended_and_tagged() {
        let store = Arc::new(MemoryStore::new());
        let outcome = coordinator(&store)
            .submit_batch("alice", "github", &one(3, 4, 7), T0)
            .await
            .unwrap();

        assert!(outcome.accepted);
        assert_eq!(outcome.reason, ThrottleReason::Ok);
        assert_eq!(outcome.timestamp_ms, T0);
        assert_eq!(outcome.sequence_numbers, vec![1]);

        let entries = store.entries();
        let pixel = &entries[0].items[0];
        assert_eq!((pixel.x, pixel.y, pixel.color), (3, 4, 7));
        assert_eq!(pixel.user_id, "alice");
        assert_eq!(pixel.last_updated, T0);
        assert_eq!(store.load_user("alice").unwrap().unwrap().last_insert_ms, T0);
    }

    #[tokio::test]
    async fn test_cooldown_scenario() {
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(&store);

        assert!(coord.submit_batch("u", "github", &one(0, 0, 1), T0).await.unwrap().accepted);

        let early = coord
            .submit_batch("u", "github", &one(0, 0, 1), T0 + 15_000)
            .await
            .unwrap();
        assert!(!early.accepted);
        assert_eq!(early.reason, ThrottleReason::RateLimited);
        assert_eq!(early.retry_at_ms, Some(T0 + 30_000));

        let later = coord
            .submit_batch("u", "github", &one(0, 0, 1), T0 + 31_000)
            .await
            .unwrap();
        assert!(later.accepted);
        assert_eq!(store.entries().len(), 2);
    }

    #[tokio::test]
    async fn test_blocked_user_gets_success_without_append() {
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(&store);
        coord.set_blocked("mallory", true, T0).await.unwrap();

        let outcome = coord
            .submit_batch("mallory", "github", &one(1, 1, 2), T0)
            .await
            .unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.reason, ThrottleReason::Blocked);
        assert!(outcome.sequence_numbers.is_empty());
        assert_eq!(store.append_calls(), 0);
    }

    #[tokio::test]
    async fn test_batch_too_large_for_regular_user() {
        let store = Arc::new(MemoryStore::new());
        let writes = vec![PixelWrite::new(0, 0, 1), PixelWrite::new(1, 0, 1)];
        let outcome = coordinator(&store)
            .submit_batch("bob", "github", &writes, T0)
            .await
            .unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.reason, ThrottleReason::BatchTooLarge);
        assert_eq!(store.append_calls(), 0);
    }

    #[tokio::test]
    async fn test_admin_batches_are_chunked() {
        let store = Arc::new(MemoryStore::new());
        let config = CoordinatorConfig {
            chunk_size: 2,
            ..CoordinatorConfig::for_testing()
        };
        let coord = WriteCoordinator::new(store.clone(), store.clone(), config);
        let writes: Vec<PixelWrite> = (0..5).map(|x| PixelWrite::new(x, 0, 3)).collect();

        let first = coord.submit_batch("root", "aad", &writes, T0).await.unwrap();
        let again = coord.submit_batch("root", "aad", &writes, T0 + 1).await.unwrap();

        assert_eq!(first.sequence_numbers, vec![1, 2, 3]);
        assert_eq!(again.sequence_numbers, vec![4, 5, 6]);
        assert_eq!(store.entries()[2].items.len(), 1);
    }

    #[tokio::test]
    async fn test_validation_precedes_throttle() {
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(&store);

        let err = coord
            .submit_batch("u", "github", &one(16, 0, 1), T0)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Validation(ValidationError::OutOfBounds { .. })));
        let err = coord.submit_batch("u", "github", &[], T0).await.unwrap_err();
        assert!(matches!(err, SubmitError::Validation(ValidationError::EmptyBatch)));
        assert_eq!(store.load_user("u").unwrap(), None);
    }

    #[tokio::test]
    async fn test_transient_append_is_retried() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_append(LogError::new(LogErrorKind::TooManyRequests, "busy"));
        store.fail_next_append(LogError::new(LogErrorKind::ServiceUnavailable, "down"));

        let outcome = coordinator(&store)
            .submit_batch("u", "github", &one(0, 0, 1), T0)
            .await
            .unwrap();
        assert_eq!(outcome.sequence_numbers, vec![1]);
        assert_eq!(store.append_calls(), 3);
    }

    #[tokio::test]
    async fn test_partial_append_reports_committed_chunks() {
        let store = Arc::new(MemoryStore::new());
        let config = CoordinatorConfig {
            chunk_size: 1,
            append_retries: 0,
            ..CoordinatorConfig::for_testing()
        };
        let coord = WriteCoordinator::new(store.clone(), store.clone(), config);
        let writes: Vec<PixelWrite> = (0..3).map(|x| PixelWrite::new(x, 0, 3)).collect();

        coord.submit_batch("root", "aad", &one(0, 0, 0), T0).await.unwrap();
        store.fail_next_append(LogError::new(LogErrorKind::Other, "disk full"));

        // Fault fires on the first chunk of the second submission
        let err = coord.submit_batch("root", "aad", &writes, T0).await.unwrap_err();
        match err {
            SubmitError::Append(partial) => {
                assert_eq!(partial.committed_chunks, 0);
                assert_eq!(partial.total_chunks, 3);
                assert!(partial.sequence_numbers.is_empty());
                assert_eq!(partial.source.kind, LogErrorKind::Other);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_same_user_admits_one() {
        let store = Arc::new(MemoryStore::new());
        let coord = Arc::new(coordinator(&store));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let coord = coord.clone();
                tokio::spawn(async move {
                    coord
                        .submit_batch("racer", "github", &one(i, 0, 1), T0)
                        .await
                        .unwrap()
                        .accepted
                })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(store.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_user_info_tracks_idp() {
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(&store);

        let user = coord.user_info("dana", "aad", T0).await.unwrap();
        assert!(user.is_admin);
        let user = coord.user_info("dana", "github", T0).await.unwrap();
        assert!(!user.is_admin);
        assert!(!store.load_user("dana").unwrap().unwrap().is_admin);
    }

    #[tokio::test]
    async fn test_user_store_failure_appends_nothing() {
        let store = Arc::new(MemoryStore::new());
        let coord = coordinator(&store);
        coord.user_info("alice", "github", T0).await.unwrap();

        store.fail_next_user_save(StoreError::Database("disk full".to_string()));
        let err = coord
            .submit_batch("alice", "github", &one(1, 1, 1), T0)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::UserStore(_)));
        assert!(store.entries().is_empty());

        // The failed save recorded no cooldown
        let retry = coord
            .submit_batch("alice", "github", &one(1, 1, 1), T0)
            .await
            .unwrap();
        assert!(retry.accepted);
        assert_eq!(store.entries().len(), 1);
    }
}
