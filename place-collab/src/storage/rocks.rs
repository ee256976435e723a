//! RocksDB-backed store for the change log, users, board blobs and cursors.
//!
//! Column families:
//! - `changes` — change-log entries, keyed by sequence number (8 bytes BE), bincode
//! - `users`   — per-user throttle state, keyed by user id, bincode
//! - `blobs`   — board snapshots, keyed `container/name`, LZ4 compressed
//! - `cursors` — named continuation tokens (UTF-8)
//! - `tweets`  — moderated tweets, keyed by tweet id, bincode
//!
//! Continuation tokens are the decimal sequence number of the next entry to
//! read. Appends are serialized, so entry N is always durable before N+1
//! becomes visible to a reader.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use place_core::{ChangeLogEntry, Pixel, UserState};

use super::{blob_key, StoreError};
use crate::changelog::{
    ChangeLog, ContinuationToken, CursorStore, FeedPage, LogError, LogErrorKind, PageSize,
};
use crate::compactor::BlobStore;
use crate::tweets::{Tweet, TweetStore};
use crate::users::UserStore;

const CF_CHANGES: &str = "changes";
const CF_USERS: &str = "users";
const CF_BLOBS: &str = "blobs";
const CF_CURSORS: &str = "cursors";
const CF_TWEETS: &str = "tweets";

const COLUMN_FAMILIES: &[&str] = &[CF_CHANGES, CF_USERS, CF_BLOBS, CF_CURSORS, CF_TWEETS];

/// First sequence number handed out by an empty log.
const FIRST_SEQUENCE: u64 = 1;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes, shared by all column families
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
    /// Page length used for an unbounded page-size hint
    pub max_page_entries: u32,
    /// Encoded size above which a page fails with `PageTooLarge`
    pub max_page_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("place_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
            max_page_entries: 1000,
            max_page_bytes: 4 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            ..Self::default()
        }
    }
}

/// RocksDB-backed store implementing every persistence seam of the service.
pub struct PlaceStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next sequence number; the lock is held across the append write
    next_sequence: Mutex<u64>,
}

impl PlaceStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let next = Self::recover_next_sequence(&db)?;
        log::info!(
            "Opened place store at {} (next sequence {next})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            next_sequence: Mutex::new(next),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        let cache_mb = (config.block_cache_size / (1024 * 1024)).max(1) as u64;
        match name {
            CF_CHANGES => {
                // Append-only, scanned in key order
                opts.set_max_write_buffer_number(4);
            }
            CF_BLOBS => {
                // Values are LZ4 already
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_USERS | CF_CURSORS | CF_TWEETS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(cache_mb);
            }
            _ => {}
        }

        opts
    }

    fn recover_next_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_CHANGES)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_CHANGES}' not found")))?;
        let mut iter = db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(sequence_from_key(&key)? + 1)
            }
            None => Ok(FIRST_SEQUENCE),
        }
    }

    // ─── Change Log ───────────────────────────────────────────────────

    /// Append one entry and return its sequence number.
    pub fn append_entry(&self, items: Vec<Pixel>) -> Result<u64, StoreError> {
        let cf = self.cf(CF_CHANGES)?;
        let mut next = self.lock_sequence()?;
        let seq = *next;

        let entry = ChangeLogEntry {
            sequence_number: seq,
            items,
        };
        let value = encode(&entry)?;
        self.db
            .put_cf_opt(cf, seq.to_be_bytes(), value, &self.write_options())?;

        *next = seq + 1;
        Ok(seq)
    }

    /// Read up to one page starting at `from`.
    pub fn read_page(
        &self,
        from: Option<&ContinuationToken>,
        page_size: PageSize,
    ) -> Result<FeedPage, LogError> {
        let start = match from {
            Some(token) => parse_token(token)?,
            None => FIRST_SEQUENCE,
        };
        let limit = page_size
            .limit()
            .unwrap_or(self.config.max_page_entries)
            .min(self.config.max_page_entries)
            .max(1) as usize;

        let cf = self.cf(CF_CHANGES)?;
        let start_key = start.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));

        let mut entries = Vec::new();
        let mut page_bytes = 0usize;
        for item in iter {
            if entries.len() >= limit {
                break;
            }
            let (_, value) = item.map_err(StoreError::from)?;
            page_bytes += value.len();
            if page_bytes > self.config.max_page_bytes {
                return Err(LogError::new(
                    LogErrorKind::PageTooLarge,
                    format!(
                        "page of {} entries exceeds {} bytes",
                        entries.len() + 1,
                        self.config.max_page_bytes
                    ),
                ));
            }
            entries.push(decode::<ChangeLogEntry>(&value)?);
        }

        let next = entries
            .last()
            .map_or(start, |entry| entry.sequence_number + 1);
        Ok(FeedPage {
            entries,
            continuation: token_for(next),
        })
    }

    /// Cursor after the newest entry.
    pub fn tail_token(&self) -> Result<ContinuationToken, StoreError> {
        Ok(token_for(*self.lock_sequence()?))
    }

    /// Sequence number of the newest entry, if any.
    pub fn latest_sequence(&self) -> Result<Option<u64>, StoreError> {
        let next = *self.lock_sequence()?;
        Ok((next > FIRST_SEQUENCE).then(|| next - 1))
    }

    // ─── Users ────────────────────────────────────────────────────────

    pub fn get_user(&self, id: &str) -> Result<Option<UserState>, StoreError> {
        let cf = self.cf(CF_USERS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn put_user(&self, user: &UserState) -> Result<(), StoreError> {
        let cf = self.cf(CF_USERS)?;
        self.db
            .put_cf_opt(cf, user.id.as_bytes(), encode(user)?, &self.write_options())?;
        Ok(())
    }

    // ─── Blobs ────────────────────────────────────────────────────────

    /// Load a blob (LZ4 decompressed).
    pub fn get_blob(&self, container: &str, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_BLOBS)?;
        match self.db.get_cf(cf, blob_key(container, name).as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn put_blob(&self, container: &str, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_BLOBS)?;
        let compressed = lz4_flex::compress_prepend_size(bytes);
        log::debug!(
            "Writing blob {container}/{name}: {} bytes ({} compressed)",
            bytes.len(),
            compressed.len()
        );
        self.db.put_cf_opt(
            cf,
            blob_key(container, name).as_bytes(),
            compressed,
            &self.write_options(),
        )?;
        Ok(())
    }

    // ─── Cursors ──────────────────────────────────────────────────────

    pub fn get_cursor(&self, name: &str) -> Result<Option<ContinuationToken>, StoreError> {
        let cf = self.cf(CF_CURSORS)?;
        match self.db.get_cf(cf, name.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes)
                .map(|s| Some(ContinuationToken::new(s)))
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn put_cursor(&self, name: &str, token: &ContinuationToken) -> Result<(), StoreError> {
        let cf = self.cf(CF_CURSORS)?;
        self.db.put_cf_opt(
            cf,
            name.as_bytes(),
            token.as_str().as_bytes(),
            &self.write_options(),
        )?;
        Ok(())
    }

    // ─── Tweets ───────────────────────────────────────────────────────

    pub fn put_tweet(&self, tweet: &Tweet) -> Result<(), StoreError> {
        let cf = self.cf(CF_TWEETS)?;
        self.db
            .put_cf_opt(cf, tweet.id.as_bytes(), encode(tweet)?, &self.write_options())?;
        Ok(())
    }

    /// Scan every tweet and keep the newest approved ones.
    pub fn newest_approved_tweets(&self, limit: usize) -> Result<Vec<Tweet>, StoreError> {
        let cf = self.cf(CF_TWEETS)?;
        let mut approved = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let tweet: Tweet = decode(&value)?;
            if tweet.approved {
                approved.push(tweet);
            }
        }
        approved.sort_by(|a, b| b.created_ms.cmp(&a.created_ms).then_with(|| b.id.cmp(&a.id)));
        approved.truncate(limit);
        Ok(approved)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn lock_sequence(&self) -> Result<MutexGuard<'_, u64>, StoreError> {
        self.next_sequence
            .lock()
            .map_err(|_| StoreError::Poisoned("sequence"))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl ChangeLog for PlaceStore {
    async fn fetch_page(
        &self,
        from: Option<ContinuationToken>,
        page_size: PageSize,
    ) -> Result<FeedPage, LogError> {
        self.read_page(from.as_ref(), page_size)
    }

    async fn append_batch(&self, items: Vec<Pixel>) -> Result<u64, LogError> {
        Ok(self.append_entry(items)?)
    }

    async fn tail(&self) -> Result<ContinuationToken, LogError> {
        Ok(self.tail_token()?)
    }
}

impl UserStore for PlaceStore {
    fn load_user(&self, id: &str) -> Result<Option<UserState>, StoreError> {
        self.get_user(id)
    }

    fn save_user(&self, user: &UserState) -> Result<(), StoreError> {
        self.put_user(user)
    }
}

impl BlobStore for PlaceStore {
    fn read_blob(&self, container: &str, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_blob(container, name)
    }

    fn write_blob(&self, container: &str, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.put_blob(container, name, bytes)
    }
}

impl TweetStore for PlaceStore {
    fn save_tweet(&self, tweet: &Tweet) -> Result<(), StoreError> {
        self.put_tweet(tweet)
    }

    fn top_tweets(&self, limit: usize) -> Result<Vec<Tweet>, StoreError> {
        self.newest_approved_tweets(limit)
    }
}

impl CursorStore for PlaceStore {
    fn load_cursor(&self, name: &str) -> Result<Option<ContinuationToken>, StoreError> {
        self.get_cursor(name)
    }

    fn save_cursor(&self, name: &str, token: &ContinuationToken) -> Result<(), StoreError> {
        self.put_cursor(name, token)
    }
}

pub(crate) fn token_for(sequence: u64) -> ContinuationToken {
    ContinuationToken::new(sequence.to_string())
}

pub(crate) fn parse_token(token: &ContinuationToken) -> Result<u64, LogError> {
    token.as_str().parse().map_err(|_| {
        LogError::new(
            LogErrorKind::InvalidContinuation,
            format!("not a sequence cursor: {token:?}"),
        )
    })
}

fn sequence_from_key(key: &[u8]) -> Result<u64, StoreError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| StoreError::Deserialization(format!("bad change key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
