//! Folds the change log into the packed board snapshot that viewers fetch.
//!
//! ```text
//!   blob (or generated) ──► Board ◄── apply_all ◄── fetch_page × N (from cursor "compactor")
//!                             │
//!                             └──► write_blob ──► save_cursor
//! ```
//!
//! Single writer: every pass holds an exclusive async mutex. The blob is
//! written before the cursor, so a crash between the two re-applies the same
//! entries on the next pass, which is idempotent.
//!
//! Fetches follow the reader's recovery policy: "page too large" halves the
//! page size (kept for later passes), transient errors are retried in place
//! a bounded number of times.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use place_core::{Board, BoardError, BoardGeometry, FillMode};

use crate::changelog::{
    ChangeLog, ContinuationToken, CursorStore, FeedPage, LogError, LogErrorKind, PageSize,
};
use crate::storage::StoreError;

/// Blob storage for the packed board.
pub trait BlobStore: Send + Sync {
    fn read_blob(&self, container: &str, name: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn write_blob(&self, container: &str, name: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

/// Compactor configuration.
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    pub geometry: BoardGeometry,
    pub container: String,
    pub blob_name: String,
    pub cursor_name: String,
    /// Initial page size; shrinks after "page too large"
    pub page_size: PageSize,
    /// Fill for a board that has never been written
    pub background: u8,
    /// In-place retries of a transient fetch failure per page
    pub fetch_retries: u32,
    /// Wait between those retries when the log suggests none
    pub retry_delay: Duration,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            geometry: BoardGeometry::default(),
            container: "dev".to_string(),
            blob_name: "board1".to_string(),
            cursor_name: "compactor".to_string(),
            page_size: PageSize::Limit(500),
            background: 0x3,
            fetch_retries: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub entries: u64,
    pub pixels_applied: u64,
    /// Out-of-bounds pixels that were skipped
    pub pixels_skipped: u64,
    pub last_sequence: Option<u64>,
    /// Whether the blob was (re)written
    pub wrote_blob: bool,
    pub page_size_reductions: u64,
    pub fetch_retries: u64,
}

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
    #[error("change log failure: {0}")]
    Log(#[from] LogError),
    #[error("stored board is unusable: {0}")]
    Board(#[from] BoardError),
}

pub struct Compactor<L> {
    log: Arc<L>,
    blobs: Arc<dyn BlobStore>,
    cursors: Arc<dyn CursorStore>,
    config: CompactorConfig,
    /// Held for the whole pass; guards the current page size
    writer: Mutex<PageSize>,
    stop_tx: watch::Sender<bool>,
}

impl<L: ChangeLog> Compactor<L> {
    pub fn new(
        log: Arc<L>,
        blobs: Arc<dyn BlobStore>,
        cursors: Arc<dyn CursorStore>,
        config: CompactorConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let page_size = config.page_size;
        Self {
            log,
            blobs,
            cursors,
            config,
            writer: Mutex::new(page_size),
            stop_tx,
        }
    }

    pub fn config(&self) -> &CompactorConfig {
        &self.config
    }

    /// Fold every entry after the saved cursor into the stored board.
    pub async fn compact_once(&self) -> Result<CompactionReport, CompactionError> {
        let mut page_size = self.writer.lock().await;
        let cfg = &self.config;
        let mut report = CompactionReport::default();

        let stored = self.blobs.read_blob(&cfg.container, &cfg.blob_name)?;
        let created = stored.is_none();
        let mut board = match stored {
            Some(bytes) => Board::from_bytes(cfg.geometry, bytes)?,
            None => {
                log::info!(
                    "No board at {}/{}, generating a blank one",
                    cfg.container,
                    cfg.blob_name
                );
                Board::generate(cfg.geometry, &FillMode::Solid(cfg.background))
            }
        };

        let mut cursor = self.cursors.load_cursor(&cfg.cursor_name)?;
        loop {
            let page = self
                .fetch_page(cursor.clone(), &mut *page_size, &mut report)
                .await?;
            cursor = Some(page.continuation);
            if page.entries.is_empty() {
                break;
            }
            for entry in &page.entries {
                let applied = board.apply_all(&entry.items);
                report.entries += 1;
                report.pixels_applied += applied.applied as u64;
                report.pixels_skipped += applied.skipped as u64;
                report.last_sequence = Some(entry.sequence_number);
            }
        }

        if report.entries > 0 || created {
            self.blobs
                .write_blob(&cfg.container, &cfg.blob_name, board.as_bytes())?;
            report.wrote_blob = true;
        }
        if report.entries > 0 {
            if let Some(cursor) = &cursor {
                self.cursors.save_cursor(&cfg.cursor_name, cursor)?;
            }
            log::info!(
                "Compacted {} entries ({} pixels, {} skipped) up to sequence {:?}",
                report.entries,
                report.pixels_applied,
                report.pixels_skipped,
                report.last_sequence
            );
        }
        Ok(report)
    }

    /// Fetch one page, shrinking `page_size` on "page too large" and retrying
    /// transient failures up to `fetch_retries` times.
    async fn fetch_page(
        &self,
        cursor: Option<ContinuationToken>,
        page_size: &mut PageSize,
        report: &mut CompactionReport,
    ) -> Result<FeedPage, LogError> {
        let mut retries = 0;
        loop {
            let err = match self.log.fetch_page(cursor.clone(), *page_size).await {
                Ok(page) => return Ok(page),
                Err(err) => err,
            };
            if err.kind == LogErrorKind::PageTooLarge {
                let Some(smaller) = page_size.halve() else {
                    log::error!("Compaction page too large even at the minimum size: {err}");
                    return Err(err);
                };
                log::warn!("Compaction page too large at {page_size:?}, retrying with {smaller:?}");
                *page_size = smaller;
                report.page_size_reductions += 1;
            } else if err.is_transient() && retries < self.config.fetch_retries {
                retries += 1;
                report.fetch_retries += 1;
                let wait = err.retry_after.unwrap_or(self.config.retry_delay);
                log::warn!("Compaction fetch failed, retry {retries} in {wait:?}: {err}");
                tokio::time::sleep(wait).await;
            } else {
                return Err(err);
            }
        }
    }

    /// The page size the next pass starts with.
    pub async fn page_size(&self) -> PageSize {
        *self.writer.lock().await
    }

    /// Replace the board with a freshly generated one and skip everything
    /// already in the log.
    pub async fn reset(&self, fill: &FillMode) -> Result<ContinuationToken, CompactionError> {
        let _writer = self.writer.lock().await;
        let cfg = &self.config;
        log::info!("Resetting board {}/{}", cfg.container, cfg.blob_name);

        let board = Board::generate(cfg.geometry, fill);
        let tail = self.log.tail().await?;
        self.blobs
            .write_blob(&cfg.container, &cfg.blob_name, board.as_bytes())?;
        self.cursors.save_cursor(&cfg.cursor_name, &tail)?;
        Ok(tail)
    }

    /// Compact every `interval` until [`Compactor::stop`] is called.
    ///
    /// Returns at once if `stop` was called earlier and not cleared by
    /// [`Compactor::start_periodic`]. Failed passes are logged and retried on
    /// the next tick. A malformed stored board is reported the same way; it
    /// needs operator action.
    pub async fn run_periodic(&self, interval: Duration) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        log::info!("Compactor running every {interval:?}");

        loop {
            let stopped = tokio::select! {
                _ = ticker.tick() => false,
                changed = stop_rx.changed() => changed.is_err(),
            };
            if stopped || *stop_rx.borrow() {
                break;
            }
            match self.compact_once().await {
                Ok(report) => log::trace!("Compaction pass: {report:?}"),
                Err(CompactionError::Board(e)) => {
                    log::error!("Compaction aborted, stored board is malformed: {e}")
                }
                Err(e) => log::warn!("Compaction pass failed: {e}"),
            }
        }
        log::info!("Compactor stopped");
    }

    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

impl<L: ChangeLog + 'static> Compactor<L> {
    /// Clear any earlier stop and spawn [`Compactor::run_periodic`].
    ///
    /// The flag is cleared before the task is spawned, so a `stop` issued
    /// right after this call is never lost.
    pub fn start_periodic(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        self.stop_tx.send_replace(false);
        let compactor = self.clone();
        tokio::spawn(async move { compactor.run_periodic(interval).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use place_core::Pixel;

    fn small_config() -> CompactorConfig {
        CompactorConfig {
            geometry: BoardGeometry::new(4, 4),
            page_size: PageSize::Limit(2),
            background: 0,
            retry_delay: Duration::from_millis(1),
            ..CompactorConfig::default()
        }
    }

    /// Rejects any page hint above `max` entries, like a log with a
    /// response size cap.
    struct CappedLog {
        inner: MemoryStore,
        max: u32,
    }

    impl ChangeLog for CappedLog {
        async fn fetch_page(
            &self,
            from: Option<ContinuationToken>,
            page_size: PageSize,
        ) -> Result<FeedPage, LogError> {
            if page_size.limit().map_or(true, |n| n > self.max) {
                return Err(LogError::new(LogErrorKind::PageTooLarge, "response too large"));
            }
            self.inner.fetch_page(from, page_size).await
        }

        async fn append_batch(&self, items: Vec<Pixel>) -> Result<u64, LogError> {
            self.inner.append_batch(items).await
        }

        async fn tail(&self) -> Result<ContinuationToken, LogError> {
            self.inner.tail().await
        }
    }

    fn capped(
        max: u32,
        config: CompactorConfig,
    ) -> (Arc<CappedLog>, Arc<MemoryStore>, Compactor<CappedLog>) {
        let log = Arc::new(CappedLog {
            inner: MemoryStore::new(),
            max,
        });
        let store = Arc::new(MemoryStore::new());
        let compactor = Compactor::new(log.clone(), store.clone(), store.clone(), config);
        (log, store, compactor)
    }

    fn compactor(store: &Arc<MemoryStore>) -> Compactor<MemoryStore> {
        Compactor::new(store.clone(), store.clone(), store.clone(), small_config())
    }

    fn stored_board(store: &MemoryStore) -> Board {
        let bytes = store.read_blob("dev", "board1").unwrap().unwrap();
        Board::from_bytes(BoardGeometry::new(4, 4), bytes).unwrap()
    }

    #[tokio::test]
    async fn test_first_pass_creates_blank_board() {
        let store = Arc::new(MemoryStore::new());
        let report = compactor(&store).compact_once().await.unwrap();
        assert!(report.wrote_blob);
        assert_eq!(report.entries, 0);
        assert_eq!(stored_board(&store).as_bytes(), &[0u8; 8]);
    }

    #[tokio::test]
    async fn test_folds_all_pages_last_write_wins() {
        let store = Arc::new(MemoryStore::new());
        store.append_batch(vec![Pixel::new(1, 0, 5)]).await.unwrap();
        store.append_batch(vec![Pixel::new(0, 0, 9)]).await.unwrap();
        store.append_batch(vec![Pixel::new(3, 3, 1)]).await.unwrap();
        store.append_batch(vec![Pixel::new(3, 3, 7)]).await.unwrap();
        store.append_batch(vec![Pixel::new(9, 9, 7)]).await.unwrap();

        let report = compactor(&store).compact_once().await.unwrap();
        assert_eq!(report.entries, 5);
        assert_eq!(report.pixels_applied, 4);
        assert_eq!(report.pixels_skipped, 1);
        assert_eq!(report.last_sequence, Some(5));

        let board = stored_board(&store);
        assert_eq!(board.as_bytes()[0], 0x95);
        assert_eq!(board.color_at(3, 3).unwrap(), 7);
        assert_eq!(
            store.load_cursor("compactor").unwrap(),
            Some(ContinuationToken::new("6"))
        );
    }

    #[tokio::test]
    async fn test_incremental_pass_only_reads_new_entries() {
        let store = Arc::new(MemoryStore::new());
        let compactor = compactor(&store);
        store.append_batch(vec![Pixel::new(0, 0, 1)]).await.unwrap();
        compactor.compact_once().await.unwrap();

        store.append_batch(vec![Pixel::new(1, 0, 2)]).await.unwrap();
        let report = compactor.compact_once().await.unwrap();
        assert_eq!(report.entries, 1);
        assert_eq!(stored_board(&store).as_bytes()[0], 0x12);

        let idle = compactor.compact_once().await.unwrap();
        assert_eq!(idle, CompactionReport::default());
    }

    #[tokio::test]
    async fn test_malformed_blob_aborts() {
        let store = Arc::new(MemoryStore::new());
        store.write_blob("dev", "board1", &[0u8; 3]).unwrap();
        store.append_batch(vec![Pixel::new(0, 0, 1)]).await.unwrap();

        let err = compactor(&store).compact_once().await.unwrap_err();
        assert!(matches!(err, CompactionError::Board(_)));
        assert_eq!(store.load_cursor("compactor").unwrap(), None);
    }

    #[tokio::test]
    async fn test_reset_skips_existing_log() {
        let store = Arc::new(MemoryStore::new());
        let compactor = compactor(&store);
        store.append_batch(vec![Pixel::new(0, 0, 1)]).await.unwrap();

        let tail = compactor.reset(&FillMode::Solid(4)).await.unwrap();
        assert_eq!(tail, ContinuationToken::new("2"));
        assert_eq!(stored_board(&store).as_bytes(), &[0x44u8; 8]);

        let report = compactor.compact_once().await.unwrap();
        assert_eq!(report.entries, 0);
        assert_eq!(stored_board(&store).color_at(0, 0).unwrap(), 4);
    }

    #[tokio::test]
    async fn test_periodic_runs_until_stopped() {
        let store = Arc::new(MemoryStore::new());
        let compactor = Arc::new(compactor(&store));
        store.append_batch(vec![Pixel::new(2, 2, 3)]).await.unwrap();

        let runner = {
            let compactor = compactor.clone();
            tokio::spawn(async move { compactor.run_periodic(Duration::from_millis(5)).await })
        };
        for _ in 0..200 {
            if store.load_cursor("compactor").unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        compactor.stop();
        tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_board(&store).color_at(2, 2).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_page_too_large_shrinks_and_is_remembered() {
        let config = CompactorConfig {
            page_size: PageSize::Limit(500),
            ..small_config()
        };
        let (log, store, compactor) = capped(2, config);
        for x in 0..4 {
            log.append_batch(vec![Pixel::new(x, 0, 5)]).await.unwrap();
        }

        let report = compactor.compact_once().await.unwrap();
        // 500 → 250 → 125 → 62 → 31 → 15 → 7 → 3 → 1
        assert_eq!(report.page_size_reductions, 8);
        assert_eq!(report.entries, 4);
        assert_eq!(compactor.page_size().await, PageSize::Limit(1));
        assert_eq!(stored_board(&store).as_bytes()[..2], [0x55u8, 0x55]);

        log.append_batch(vec![Pixel::new(0, 1, 6)]).await.unwrap();
        let next = compactor.compact_once().await.unwrap();
        assert_eq!(next.page_size_reductions, 0);
        assert_eq!(next.entries, 1);
        assert_eq!(stored_board(&store).color_at(0, 1).unwrap(), 6);
    }

    #[tokio::test]
    async fn test_page_too_large_at_minimum_fails_without_writing() {
        let (log, store, compactor) = capped(0, small_config());
        log.append_batch(vec![Pixel::new(0, 0, 1)]).await.unwrap();

        let err = compactor.compact_once().await.unwrap_err();
        assert!(
            matches!(err, CompactionError::Log(ref e) if e.kind == LogErrorKind::PageTooLarge)
        );
        assert_eq!(store.read_blob("dev", "board1").unwrap(), None);
        assert_eq!(store.load_cursor("compactor").unwrap(), None);
    }

    #[tokio::test]
    async fn test_transient_fetch_errors_are_retried() {
        let store = Arc::new(MemoryStore::new());
        store.append_batch(vec![Pixel::new(0, 0, 2)]).await.unwrap();
        store.fail_next_fetch(
            LogError::new(LogErrorKind::TooManyRequests, "busy")
                .with_retry_after(Duration::from_millis(1)),
        );
        store.fail_next_fetch(LogError::new(LogErrorKind::Gone, "moved"));

        let report = compactor(&store).compact_once().await.unwrap();
        assert_eq!(report.fetch_retries, 2);
        assert_eq!(report.entries, 1);
        assert_eq!(stored_board(&store).color_at(0, 0).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let store = Arc::new(MemoryStore::new());
        for _ in 0..4 {
            store.fail_next_fetch(LogError::new(LogErrorKind::ServiceUnavailable, "down"));
        }
        let err = compactor(&store).compact_once().await.unwrap_err();
        assert!(
            matches!(err, CompactionError::Log(ref e) if e.kind == LogErrorKind::ServiceUnavailable)
        );
    }

    #[tokio::test]
    async fn test_stop_before_first_poll_is_kept() {
        let store = Arc::new(MemoryStore::new());
        let compactor = Arc::new(compactor(&store));
        store.append_batch(vec![Pixel::new(1, 1, 1)]).await.unwrap();

        compactor.stop();
        let runner = {
            let compactor = compactor.clone();
            tokio::spawn(async move { compactor.run_periodic(Duration::from_millis(5)).await })
        };
        tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.load_cursor("compactor").unwrap(), None);
    }

    #[tokio::test]
    async fn test_start_periodic_clears_earlier_stop() {
        let store = Arc::new(MemoryStore::new());
        let compactor = Arc::new(compactor(&store));
        store.append_batch(vec![Pixel::new(1, 1, 4)]).await.unwrap();

        compactor.stop();
        let runner = compactor.start_periodic(Duration::from_millis(5));
        for _ in 0..200 {
            if store.load_cursor("compactor").unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        compactor.stop();
        tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_board(&store).color_at(1, 1).unwrap(), 4);
    }
}
