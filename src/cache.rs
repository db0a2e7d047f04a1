//! Content-addressed cache for generated responses.
//!
//! Rows are append-only: a miss produces a new row, nothing is updated in
//! place, and duplicate hashes are allowed. Freshness is decided at read time
//! against the caller's TTL; physical deletion only happens through
//! [`SqliteResponseCache::prune`].

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// Lookup key for a rendered prompt sent to a specific model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseCacheKey {
    pub model: String,
    pub prompt_hash: String,
    pub request_hash: String,
}

impl ResponseCacheKey {
    pub fn new(prompt_text: &str, model: &str) -> Self {
        Self {
            model: model.to_string(),
            prompt_hash: hash_text(prompt_text),
            request_hash: request_hash(prompt_text, model),
        }
    }
}

/// `blake3(prompt_text ":" model)` as lowercase hex.
pub fn request_hash(prompt_text: &str, model: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(prompt_text.as_bytes());
    hasher.update(b":");
    hasher.update(model.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// One persisted request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub request_hash: String,
    pub prompt_text: String,
    pub model: String,
    pub response_text: String,
    pub reasoning_trace: Option<String>,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CacheRecord {
    pub fn new(
        key: &ResponseCacheKey,
        prompt_text: impl Into<String>,
        response_text: impl Into<String>,
        reasoning_trace: Option<String>,
        owner: Option<&str>,
    ) -> Self {
        Self {
            request_hash: key.request_hash.clone(),
            prompt_text: prompt_text.into(),
            model: key.model.clone(),
            response_text: response_text.into(),
            reasoning_trace,
            owner: owner.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    /// Override the creation timestamp (clock-explicit writes).
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Whether this record is still valid at `now` for a TTL in minutes.
    pub fn is_fresh(&self, ttl_minutes: i64, now: DateTime<Utc>) -> bool {
        ttl_minutes > 0 && now - self.created_at <= ttl_window(ttl_minutes)
    }
}

/// Longest TTL honoured; larger values are clamped.
const MAX_TTL_MINUTES: i64 = 100 * 365 * 24 * 60;

fn ttl_window(ttl_minutes: i64) -> Duration {
    Duration::minutes(ttl_minutes.clamp(0, MAX_TTL_MINUTES))
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cache file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache connection poisoned by a panicked writer")]
    Poisoned,
    #[error("blocking cache task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("encoding cache row: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt cache row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Newest record for `request_hash` whose age at `now` is within the TTL.
    async fn get_at(
        &self,
        request_hash: &str,
        ttl_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheRecord>, CacheError>;

    /// Append a record. Existing rows with the same hash are left alone.
    async fn put(&self, record: &CacheRecord) -> Result<(), CacheError>;

    async fn get(
        &self,
        request_hash: &str,
        ttl_minutes: i64,
    ) -> Result<Option<CacheRecord>, CacheError> {
        self.get_at(request_hash, ttl_minutes, Utc::now()).await
    }
}

// =============================================================================
// SQLite backend
// =============================================================================

#[derive(Clone)]
pub struct SqliteResponseCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteResponseCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; \
             PRAGMA synchronous=NORMAL; \
             CREATE TABLE IF NOT EXISTS response_cache ( \
               id INTEGER PRIMARY KEY AUTOINCREMENT, \
               request_hash TEXT NOT NULL, \
               prompt_text TEXT NOT NULL, \
               model TEXT NOT NULL, \
               response_text TEXT NOT NULL, \
               reasoning_trace TEXT, \
               owner TEXT, \
               created_at_ms INTEGER NOT NULL \
             ); \
             CREATE INDEX IF NOT EXISTS idx_response_cache_hash_created \
               ON response_cache (request_hash, created_at_ms);",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("PLANWRIGHT_CACHE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".planwright_cache.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::acquire(&self.path)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<R, F>(&self, f: F) -> Result<R, CacheError>
    where
        R: Send + 'static,
        F: FnOnce(&Connection) -> Result<R, CacheError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| CacheError::Poisoned)?;
            f(&guard)
        })
        .await?
    }

    /// Dump every row, newest first, one JSON object per line.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, CacheError> {
        let path = path.as_ref().to_path_buf();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM response_cache ORDER BY created_at_ms DESC, id DESC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut out = BufWriter::new(std::fs::File::create(path)?);
            let mut written = 0usize;
            while let Some(row) = rows.next()? {
                serde_json::to_writer(&mut out, &row_to_record(row)?)?;
                out.write_all(b"\n")?;
                written += 1;
            }
            out.flush()?;
            Ok(written)
        })
        .await
    }

    /// Physically delete rows older than `max_age_minutes` and/or beyond the
    /// newest `max_rows`. Reads never delete; this is the only eviction.
    pub async fn prune(
        &self,
        max_age_minutes: Option<i64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        self.prune_at(max_age_minutes, max_rows, Utc::now()).await
    }

    pub async fn prune_at(
        &self,
        max_age_minutes: Option<i64>,
        max_rows: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<CachePruneStats, CacheError> {
        self.run(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let by_age = match max_age_minutes {
                Some(minutes) => tx.execute(
                    "DELETE FROM response_cache WHERE created_at_ms < ?1",
                    params![(now - ttl_window(minutes)).timestamp_millis()],
                )?,
                None => 0,
            };
            let by_count = match max_rows {
                Some(keep) => tx.execute(
                    "DELETE FROM response_cache WHERE id NOT IN ( \
                        SELECT id FROM response_cache \
                        ORDER BY created_at_ms DESC, id DESC LIMIT ?1 \
                     )",
                    params![i64::try_from(keep).unwrap_or(i64::MAX)],
                )?,
                None => 0,
            };
            let remaining: i64 =
                tx.query_row("SELECT COUNT(*) FROM response_cache", [], |row| row.get(0))?;
            tx.commit()?;
            Ok(CachePruneStats {
                deleted: by_age + by_count,
                remaining: usize::try_from(remaining).unwrap_or(0),
            })
        })
        .await
    }

    /// Rows stored for a hash, fresh or not.
    pub async fn count_for(&self, request_hash: &str) -> Result<usize, CacheError> {
        let request_hash = request_hash.to_string();
        self.run(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM response_cache WHERE request_hash = ?1",
                params![request_hash],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }
}

const RECORD_COLUMNS: &str =
    "request_hash, prompt_text, model, response_text, reasoning_trace, owner, created_at_ms";

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<CacheRecord, CacheError> {
    let created_at_ms: i64 = row.get(6)?;
    Ok(CacheRecord {
        request_hash: row.get(0)?,
        prompt_text: row.get(1)?,
        model: row.get(2)?,
        response_text: row.get(3)?,
        reasoning_trace: row.get(4)?,
        owner: row.get(5)?,
        created_at: from_millis(created_at_ms)?,
    })
}

#[async_trait]
impl ResponseCache for SqliteResponseCache {
    async fn get_at(
        &self,
        request_hash: &str,
        ttl_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheRecord>, CacheError> {
        if ttl_minutes <= 0 {
            return Ok(None);
        }
        let request_hash = request_hash.to_string();
        let cutoff_ms = (now - ttl_window(ttl_minutes)).timestamp_millis();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {RECORD_COLUMNS} FROM response_cache \
                 WHERE request_hash = ?1 AND created_at_ms >= ?2 \
                 ORDER BY created_at_ms DESC, id DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query(params![request_hash, cutoff_ms])?;
            rows.next()?.map(row_to_record).transpose()
        })
        .await
    }

    async fn put(&self, record: &CacheRecord) -> Result<(), CacheError> {
        let r = record.clone();
        self.run(move |conn| {
            conn.prepare_cached(&format!(
                "INSERT INTO response_cache ({RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ))?
            .execute(params![
                r.request_hash,
                r.prompt_text,
                r.model,
                r.response_text,
                r.reasoning_trace,
                r.owner,
                r.created_at.timestamp_millis(),
            ])?;
            Ok(())
        })
        .await
    }
}

/// Advisory lock held next to the database for maintenance commands.
/// Released on drop.
#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn acquire(db_path: &Path) -> Result<Self, CacheError> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(db_path.with_extension("lock"))?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

// =============================================================================
// In-memory backend
// =============================================================================

/// Process-local cache with the same read semantics as the SQLite backend.
#[derive(Debug, Default, Clone)]
pub struct MemoryResponseCache {
    rows: Arc<Mutex<Vec<CacheRecord>>>,
}

impl MemoryResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResponseCache for MemoryResponseCache {
    async fn get_at(
        &self,
        request_hash: &str,
        ttl_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheRecord>, CacheError> {
        let rows = self.rows.lock().map_err(|_| CacheError::Poisoned)?;
        // Later pushes win ties, matching insertion order in SQLite.
        let hit = rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.request_hash == request_hash && r.is_fresh(ttl_minutes, now))
            .max_by_key(|(idx, r)| (r.created_at, *idx))
            .map(|(_, r)| r.clone());
        Ok(hit)
    }

    async fn put(&self, record: &CacheRecord) -> Result<(), CacheError> {
        let mut rows = self.rows.lock().map_err(|_| CacheError::Poisoned)?;
        rows.push(record.clone());
        Ok(())
    }
}

fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, CacheError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| CacheError::Corrupt(format!("created_at_ms out of range: {ms}")))
}
