//! Continuous poll loop from the change log to the [`Broadcaster`].
//!
//! ```text
//!            ┌──────── entries ≥ 1: publish, save cursor, loop now ─────┐
//!            ▼                                                          │
//!   Stopped ──start──► Running ──fetch_page(cursor, size)──► Ok ────────┤
//!      ▲                  │                                 └ empty: sleep(poll_delay)
//!      │                  └──► Err ── NotFound ─────────────────────► Fatal
//!      │                           ├─ Gone ─────────── retry (retry_after only)
//!      │                           ├─ 429 / 503 ────── sleep(retry_after | poll_delay)
//!      │                           ├─ PageTooLarge ─── halve size, retry now; at 1: Fatal
//!      │                           └─ other ────────── sleep(retry_after | poll_delay)
//!      └──── stop() observed at the next iteration or during a sleep
//! ```
//!
//! Delivery is at-least-once: the cursor is saved after the page is
//! published, so a crash in between replays that page on restart. Viewers
//! fold updates with last-write-wins, which makes replays harmless.
//!
//! A page that cannot be published keeps the cursor where it was. A payload
//! over the frame limit is refetched in smaller pages; a single entry that
//! alone exceeds the limit is skipped, since no viewer could receive it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{ChangeLog, ContinuationToken, CursorStore, LogError, LogErrorKind, PageSize};
use crate::broadcast::Broadcaster;
use crate::protocol::ProtocolError;

/// Where a reader without a saved cursor begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFrom {
    #[default]
    Beginning,
    Now,
}

/// Reader configuration.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Sleep after an empty page, and the default wait after a failure
    pub poll_delay: Duration,
    /// Used only when no cursor has been saved under `cursor_name`
    pub start_from: StartFrom,
    pub cursor_name: String,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            poll_delay: Duration::from_secs(5),
            start_from: StartFrom::Beginning,
            cursor_name: "live-feed".to_string(),
        }
    }
}

impl ReaderConfig {
    pub fn for_testing() -> Self {
        Self {
            poll_delay: Duration::from_millis(10),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Stopped,
    Running,
}

/// Why the loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    Stopped,
    Fatal(LogError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub pages: u64,
    pub empty_pages: u64,
    pub entries: u64,
    pub errors: u64,
    pub page_size_reductions: u64,
}

#[derive(Default)]
struct AtomicReaderStats {
    pages: AtomicU64,
    empty_pages: AtomicU64,
    entries: AtomicU64,
    errors: AtomicU64,
    page_size_reductions: AtomicU64,
}

/// Drains the change log into the broadcaster. One instance per cursor.
pub struct ChangeLogReader<L> {
    core: Arc<ReaderCore<L>>,
}

struct ReaderCore<L> {
    log: Arc<L>,
    broadcaster: Arc<Broadcaster>,
    cursors: Option<Arc<dyn CursorStore>>,
    config: ReaderConfig,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    /// 0 = unbounded
    page_size: AtomicU32,
    stats: AtomicReaderStats,
}

impl<L: ChangeLog + 'static> ChangeLogReader<L> {
    /// A reader whose cursor lives only as long as the process.
    pub fn new(log: Arc<L>, broadcaster: Arc<Broadcaster>, config: ReaderConfig) -> Self {
        Self::build(log, broadcaster, None, config)
    }

    /// A reader that resumes from, and saves after every published page,
    /// the cursor named `config.cursor_name` in `cursors`.
    pub fn with_cursors(
        log: Arc<L>,
        broadcaster: Arc<Broadcaster>,
        cursors: Arc<dyn CursorStore>,
        config: ReaderConfig,
    ) -> Self {
        Self::build(log, broadcaster, Some(cursors), config)
    }

    fn build(
        log: Arc<L>,
        broadcaster: Arc<Broadcaster>,
        cursors: Option<Arc<dyn CursorStore>>,
        config: ReaderConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            core: Arc::new(ReaderCore {
                log,
                broadcaster,
                cursors,
                config,
                running: AtomicBool::new(false),
                stop_tx,
                page_size: AtomicU32::new(0),
                stats: AtomicReaderStats::default(),
            }),
        }
    }

    /// Whether the cursor survives restarts.
    pub fn is_durable(&self) -> bool {
        self.core.cursors.is_some()
    }

    /// Spawn the loop on the tokio runtime.
    ///
    /// Returns `None` if a loop is already running.
    pub fn start(&self) -> Option<JoinHandle<ReaderExit>> {
        if !self.core.try_enter() {
            log::debug!("Change log reader already running");
            return None;
        }
        let core = self.core.clone();
        Some(tokio::spawn(async move { core.run_entered().await }))
    }

    /// Drive the loop on the current task until stopped or fatal.
    pub async fn run(&self) -> ReaderExit {
        if !self.core.try_enter() {
            log::warn!("Change log reader already running; run() returns immediately");
            return ReaderExit::Stopped;
        }
        self.core.run_entered().await
    }

    /// Ask the loop to stop. An in-flight fetch completes first.
    pub fn stop(&self) {
        self.core.stop_tx.send_replace(true);
    }

    pub fn state(&self) -> ReaderState {
        if self.core.running.load(Ordering::SeqCst) {
            ReaderState::Running
        } else {
            ReaderState::Stopped
        }
    }

    pub fn page_size(&self) -> PageSize {
        self.core.page_size()
    }

    pub fn stats(&self) -> ReaderStats {
        let s = &self.core.stats;
        ReaderStats {
            pages: s.pages.load(Ordering::Relaxed),
            empty_pages: s.empty_pages.load(Ordering::Relaxed),
            entries: s.entries.load(Ordering::Relaxed),
            errors: s.errors.load(Ordering::Relaxed),
            page_size_reductions: s.page_size_reductions.load(Ordering::Relaxed),
        }
    }
}

impl<L: ChangeLog + 'static> ReaderCore<L> {
    fn try_enter(&self) -> bool {
        let entered = self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if entered {
            self.stop_tx.send_replace(false);
        }
        entered
    }

    async fn run_entered(&self) -> ReaderExit {
        log::info!("Change log reader '{}' started", self.config.cursor_name);
        let exit = self.drive().await;
        self.running.store(false, Ordering::SeqCst);
        match &exit {
            ReaderExit::Stopped => {
                log::info!("Change log reader '{}' stopped", self.config.cursor_name)
            }
            ReaderExit::Fatal(e) => {
                log::error!("Change log reader '{}' halted: {e}", self.config.cursor_name)
            }
        }
        exit
    }

    fn page_size(&self) -> PageSize {
        match self.page_size.load(Ordering::Relaxed) {
            0 => PageSize::Unbounded,
            n => PageSize::Limit(n),
        }
    }

    fn set_page_size(&self, size: PageSize) {
        self.page_size
            .store(size.limit().unwrap_or(0), Ordering::Relaxed);
    }

    async fn drive(&self) -> ReaderExit {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut cursor = match self.initial_cursor(&mut stop_rx).await {
            Some(cursor) => cursor,
            None => return ReaderExit::Stopped,
        };

        loop {
            if *stop_rx.borrow() {
                return ReaderExit::Stopped;
            }

            let page_size = self.page_size();
            let err = match self.log.fetch_page(cursor.clone(), page_size).await {
                Ok(page) => {
                    self.stats.pages.fetch_add(1, Ordering::Relaxed);

                    if page.entries.is_empty() {
                        cursor = Some(page.continuation);
                        self.stats.empty_pages.fetch_add(1, Ordering::Relaxed);
                        if self.pause(self.config.poll_delay, &mut stop_rx).await {
                            return ReaderExit::Stopped;
                        }
                        continue;
                    }

                    log::debug!(
                        "Publishing {} change log entries (up to {})",
                        page.entries.len(),
                        page.continuation
                    );
                    match self.broadcaster.publish(&page.entries) {
                        Ok(_) => {
                            self.stats
                                .entries
                                .fetch_add(page.entries.len() as u64, Ordering::Relaxed);
                        }
                        Err(ProtocolError::PayloadTooLarge { size, limit })
                            if page.entries.len() > 1 =>
                        {
                            let smaller = PageSize::Limit((page.entries.len() / 2) as u32);
                            log::warn!(
                                "Page of {} entries is {size} bytes (limit {limit}), refetching with {smaller:?}",
                                page.entries.len()
                            );
                            self.set_page_size(smaller);
                            self.stats
                                .page_size_reductions
                                .fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        Err(ProtocolError::PayloadTooLarge { size, limit }) => {
                            self.stats.errors.fetch_add(1, Ordering::Relaxed);
                            log::error!(
                                "Entry {} alone is {size} bytes (limit {limit}); skipping it",
                                page.entries[0].sequence_number
                            );
                        }
                        Err(e) => {
                            self.stats.errors.fetch_add(1, Ordering::Relaxed);
                            log::error!(
                                "Failed to publish {} entries, retrying: {e}",
                                page.entries.len()
                            );
                            if self.pause(self.config.poll_delay, &mut stop_rx).await {
                                return ReaderExit::Stopped;
                            }
                            continue;
                        }
                    }
                    self.save_cursor(&page.continuation);
                    cursor = Some(page.continuation);
                    continue;
                }
                Err(err) => err,
            };

            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            let wait = err.retry_after.unwrap_or(self.config.poll_delay);
            match err.kind {
                LogErrorKind::NotFound { stale_read: false } => {
                    log::error!("Change log collection not found: {err}");
                    return ReaderExit::Fatal(err);
                }
                LogErrorKind::InvalidContinuation => {
                    log::error!("Change log rejected cursor {cursor:?}: {err}");
                    return ReaderExit::Fatal(err);
                }
                LogErrorKind::Gone => {
                    log::warn!("Change log partition moved, retrying: {err}");
                    if let Some(retry_after) = err.retry_after {
                        if self.pause(retry_after, &mut stop_rx).await {
                            return ReaderExit::Stopped;
                        }
                    }
                }
                LogErrorKind::TooManyRequests | LogErrorKind::ServiceUnavailable => {
                    log::warn!("Retriable change log error, waiting {wait:?}: {err}");
                    if self.pause(wait, &mut stop_rx).await {
                        return ReaderExit::Stopped;
                    }
                }
                LogErrorKind::PageTooLarge => match page_size.halve() {
                    Some(smaller) => {
                        log::warn!("Page too large at {page_size:?}, retrying with {smaller:?}");
                        self.set_page_size(smaller);
                        self.stats
                            .page_size_reductions
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        log::error!("Page too large even at the minimum size: {err}");
                        return ReaderExit::Fatal(err);
                    }
                },
                LogErrorKind::NotFound { stale_read: true } | LogErrorKind::Other => {
                    log::error!("Change log read failed, waiting {wait:?}: {err}");
                    if self.pause(wait, &mut stop_rx).await {
                        return ReaderExit::Stopped;
                    }
                }
            }
        }
    }

    /// Saved cursor, else `start_from`. `None` means stop was requested while
    /// resolving it.
    async fn initial_cursor(
        &self,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Option<Option<ContinuationToken>> {
        if let Some(cursors) = &self.cursors {
            match cursors.load_cursor(&self.config.cursor_name) {
                Ok(Some(token)) => {
                    log::info!("Resuming '{}' from {token}", self.config.cursor_name);
                    return Some(Some(token));
                }
                Ok(None) => {}
                Err(e) => log::warn!(
                    "Could not load cursor '{}', using {:?}: {e}",
                    self.config.cursor_name,
                    self.config.start_from
                ),
            }
        }

        match self.config.start_from {
            StartFrom::Beginning => Some(None),
            StartFrom::Now => loop {
                match self.log.tail().await {
                    Ok(token) => return Some(Some(token)),
                    Err(e) => {
                        log::warn!("Could not locate change log tail: {e}");
                        let wait = e.retry_after.unwrap_or(self.config.poll_delay);
                        if self.pause(wait, stop_rx).await {
                            return None;
                        }
                    }
                }
            },
        }
    }

    fn save_cursor(&self, token: &ContinuationToken) {
        if let Some(cursors) = &self.cursors {
            if let Err(e) = cursors.save_cursor(&self.config.cursor_name, token) {
                log::warn!("Failed to save cursor '{}': {e}", self.config.cursor_name);
            }
        }
    }

    /// Sleep for `duration` unless stopped first. Returns true when stopped.
    async fn pause(&self, duration: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
        if *stop_rx.borrow() {
            return true;
        }
        let closed = tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            changed = stop_rx.changed() => changed.is_err(),
        };
        closed || *stop_rx.borrow()
    }
}
