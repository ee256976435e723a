//! The ordered, paginated append log that every accepted pixel batch lands in.
//!
//! ```text
//!  WriteCoordinator ──append_batch──► ┌──────────────────────┐
//!                                     │ seq 1 │ seq 2 │ ...  │
//!  ChangeLogReader  ◄──fetch_page──── └──────────────────────┘
//!  Compactor        ◄──fetch_page────        ▲ ContinuationToken
//! ```
//!
//! Consumers own their cursor. A [`CursorStore`] makes a cursor survive
//! restarts; the log itself never tracks who has read what.

pub mod reader;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use place_core::{ChangeLogEntry, Pixel};

use crate::storage::StoreError;

pub use reader::{ChangeLogReader, ReaderConfig, ReaderExit, ReaderState, ReaderStats, StartFrom};

/// Opaque position in the log. `None` in a fetch means "from the beginning".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Page-size hint sent with every fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageSize {
    /// Let the log choose
    #[default]
    Unbounded,
    Limit(u32),
}

impl PageSize {
    /// The limit an unbounded hint drops to on its first reduction.
    pub const FIRST_LIMIT: u32 = 100;

    /// Next smaller hint after a "page too large" failure.
    ///
    /// `Unbounded` becomes 100, limits are halved. `None` once the hint is
    /// already 1.
    pub fn halve(self) -> Option<PageSize> {
        match self {
            PageSize::Unbounded => Some(PageSize::Limit(Self::FIRST_LIMIT)),
            PageSize::Limit(n) if n <= 1 => None,
            PageSize::Limit(n) => Some(PageSize::Limit(n / 2)),
        }
    }

    pub fn limit(self) -> Option<u32> {
        match self {
            PageSize::Unbounded => None,
            PageSize::Limit(n) => Some(n),
        }
    }
}

/// One page of the log plus the cursor to resume after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPage {
    pub entries: Vec<ChangeLogEntry>,
    pub continuation: ContinuationToken,
}

/// How a log call failed. Drives the reader's recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogErrorKind {
    /// The collection is gone, unless `stale_read` marks a replica that has
    /// not caught up with the session yet
    NotFound { stale_read: bool },
    /// The partition moved
    Gone,
    TooManyRequests,
    ServiceUnavailable,
    /// The requested page exceeds the response size limit
    PageTooLarge,
    /// The cursor cannot be parsed by this log
    InvalidContinuation,
    Other,
}

impl fmt::Display for LogErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogErrorKind::NotFound { stale_read: false } => write!(f, "not found"),
            LogErrorKind::NotFound { stale_read: true } => write!(f, "not found (stale read)"),
            LogErrorKind::Gone => write!(f, "gone"),
            LogErrorKind::TooManyRequests => write!(f, "too many requests"),
            LogErrorKind::ServiceUnavailable => write!(f, "service unavailable"),
            LogErrorKind::PageTooLarge => write!(f, "page too large"),
            LogErrorKind::InvalidContinuation => write!(f, "invalid continuation"),
            LogErrorKind::Other => write!(f, "log error"),
        }
    }
}

/// A failed change-log call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct LogError {
    pub kind: LogErrorKind,
    /// Server-suggested wait before retrying
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl LogError {
    pub fn new(kind: LogErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retry_after: None,
            message: message.into(),
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            LogErrorKind::NotFound { stale_read: true }
                | LogErrorKind::Gone
                | LogErrorKind::TooManyRequests
                | LogErrorKind::ServiceUnavailable
        )
    }
}

impl From<StoreError> for LogError {
    fn from(e: StoreError) -> Self {
        LogError::new(LogErrorKind::Other, e.to_string())
    }
}

/// Ordered append log client.
///
/// Sequence numbers are strictly increasing in append order, and a page never
/// exposes entry N+1 before entry N is readable.
pub trait ChangeLog: Send + Sync {
    /// Read the next page after `from`.
    fn fetch_page(
        &self,
        from: Option<ContinuationToken>,
        page_size: PageSize,
    ) -> impl Future<Output = Result<FeedPage, LogError>> + Send;

    /// Append `items` as one entry and return its sequence number.
    fn append_batch(
        &self,
        items: Vec<Pixel>,
    ) -> impl Future<Output = Result<u64, LogError>> + Send;

    /// A cursor positioned after the newest entry.
    fn tail(&self) -> impl Future<Output = Result<ContinuationToken, LogError>> + Send;
}

/// Durable named cursors.
pub trait CursorStore: Send + Sync {
    fn load_cursor(&self, name: &str) -> Result<Option<ContinuationToken>, StoreError>;
    fn save_cursor(&self, name: &str, token: &ContinuationToken) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halve_from_unbounded() {
        assert_eq!(PageSize::Unbounded.halve(), Some(PageSize::Limit(100)));
        assert_eq!(PageSize::Limit(100).halve(), Some(PageSize::Limit(50)));
    }

    #[test]
    fn test_halve_down_to_minimum() {
        let mut size = PageSize::Limit(5);
        let mut steps = Vec::new();
        while let Some(next) = size.halve() {
            steps.push(next);
            size = next;
        }
        assert_eq!(steps, vec![PageSize::Limit(2), PageSize::Limit(1)]);
        assert_eq!(PageSize::Limit(1).halve(), None);
        assert_eq!(PageSize::Limit(0).halve(), None);
    }

    #[test]
    fn test_transient_classification() {
        let transient = [
            LogErrorKind::NotFound { stale_read: true },
            LogErrorKind::Gone,
            LogErrorKind::TooManyRequests,
            LogErrorKind::ServiceUnavailable,
        ];
        for kind in transient {
            assert!(LogError::new(kind, "x").is_transient(), "{kind}");
        }
        let permanent = [
            LogErrorKind::NotFound { stale_read: false },
            LogErrorKind::PageTooLarge,
            LogErrorKind::InvalidContinuation,
            LogErrorKind::Other,
        ];
        for kind in permanent {
            assert!(!LogError::new(kind, "x").is_transient(), "{kind}");
        }
    }

    #[test]
    fn test_log_error_display() {
        let err = LogError::new(LogErrorKind::TooManyRequests, "slow down")
            .with_retry_after(Duration::from_millis(250));
        assert_eq!(err.to_string(), "too many requests: slow down");
        assert_eq!(err.retry_after, Some(Duration::from_millis(250)));
    }
}
