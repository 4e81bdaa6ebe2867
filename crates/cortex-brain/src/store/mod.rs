//! Brain store implementation using SQLite.
//!
//! One file holds every subsystem: messaging, short-term memory, working
//! memory, the causal knowledge graph, the embedding index and the FTS5
//! shadow tables used by unified search.
//!
//! # Handles
//!
//! A [`Brain`] owns exactly one connection. Any number of handles, in any
//! number of threads or processes, may be open on the same file; WAL mode
//! keeps readers from blocking and every write is a `BEGIN IMMEDIATE`
//! transaction retried on contention (see `retry.rs`).

mod atom_ops;
mod embedding_ops;
mod message_ops;
mod pin_ops;
mod provenance;
pub mod query;
mod retry;
pub mod schema;
mod search;
mod stm_ops;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use cortex_config::{BrainConfig, CortexConfig, EmbeddingConfig, SearchConfig};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::embedding::SharedEmbedder;
use crate::error::{BrainError, Result};
use crate::links::{LinkPolicy, policy_from_config};
use crate::types::{SourceKind, format_timestamp};
use crate::vector::init_vector_extension;

pub use query::{AtomStats, DailyActivity, EmbeddingCoverage, StoreStats};
pub use schema::SCHEMA_VERSION;

pub(crate) use retry::RetryPolicy;

/// Longest window [`Brain::daily_activity`] reports, about ten years.
pub const MAX_ACTIVITY_DAYS: u32 = 3660;

// ─────────────────────────────────────────────────────────────────────────────
// Brain
// ─────────────────────────────────────────────────────────────────────────────

/// Handle on a brain store backed by SQLite.
pub struct Brain {
    /// The SQLite connection; `parking_lot` so a panicking caller cannot poison it.
    pub(crate) conn: Mutex<Connection>,
    pub(crate) settings: BrainConfig,
    pub(crate) search_config: SearchConfig,
    pub(crate) embedding_config: EmbeddingConfig,
    pub(crate) retry: RetryPolicy,
    pub(crate) embedder: Option<SharedEmbedder>,
    pub(crate) link_policy: Arc<dyn LinkPolicy>,
    pub(crate) read_only: bool,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Brain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Brain")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("embedder", &self.embedder.as_ref().map(|e| e.name().to_string()))
            .field("link_policy", &self.link_policy.name())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Initialization
// ─────────────────────────────────────────────────────────────────────────────

impl Brain {
    /// Open or create a store at the given path with default configuration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, &CortexConfig::default())
    }

    /// Open or create a store at the given path.
    ///
    /// Creates the parent directory, the file and any missing schema objects.
    /// Safe to call concurrently from many threads and processes.
    pub fn open_with_config(path: impl AsRef<Path>, config: &CortexConfig) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }

        init_vector_extension();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .map_err(|e| BrainError::StoreOpen(format!("{}: {}", path.display(), e)))?;

        let mut brain = Self::from_connection(conn, config, false, Some(path.to_path_buf()));
        brain.initialize()?;

        info!("Brain opened at {:?}", path);
        Ok(brain)
    }

    /// Create an in-memory store (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_config(&CortexConfig::default())
    }

    /// Create an in-memory store with explicit configuration.
    pub fn open_in_memory_with_config(config: &CortexConfig) -> Result<Self> {
        init_vector_extension();
        let conn = Connection::open_in_memory()?;
        let mut brain = Self::from_connection(conn, config, false, None);
        brain.initialize()?;

        debug!("In-memory brain created");
        Ok(brain)
    }

    /// Open an existing store without write access.
    ///
    /// Intended for monitoring collaborators; every write method returns
    /// [`BrainError::ReadOnly`]. Fails if the store does not exist or was
    /// never initialized.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(BrainError::StoreOpen(format!(
                "{}: no such store",
                path.display()
            )));
        }

        init_vector_extension();
        let config = CortexConfig::default();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .map_err(|e| BrainError::StoreOpen(format!("{}: {}", path.display(), e)))?;
        conn.busy_timeout(Duration::from_millis(config.brain().busy_timeout_ms))?;

        let version = schema::check_compatibility(&conn)?;
        if version == 0 {
            return Err(BrainError::StoreOpen(format!(
                "{}: store is not initialized",
                path.display()
            )));
        }
        if version < SCHEMA_VERSION {
            return Err(BrainError::StoreOpen(format!(
                "{}: schema version {} needs upgrading; open it read-write once",
                path.display(),
                version
            )));
        }

        info!("Brain opened read-only at {:?}", path);
        Ok(Self::from_connection(
            conn,
            &config,
            true,
            Some(path.to_path_buf()),
        ))
    }

    fn from_connection(
        conn: Connection,
        config: &CortexConfig,
        read_only: bool,
        path: Option<PathBuf>,
    ) -> Self {
        let settings = config.brain();
        let retry = RetryPolicy {
            attempts: settings.write_retries,
            initial_backoff: Duration::from_millis(settings.retry_backoff_ms),
        };
        Self {
            conn: Mutex::new(conn),
            retry,
            search_config: config.search(),
            embedding_config: config.embedding(),
            link_policy: policy_from_config(&config.links()),
            embedder: None,
            read_only,
            path,
            settings,
        }
    }

    /// Apply pragmas, reject incompatible files and create the schema.
    fn initialize(&mut self) -> Result<()> {
        let busy_timeout = Duration::from_millis(self.settings.busy_timeout_ms);
        let retry = self.retry;
        let conn = self.conn.get_mut();

        conn.busy_timeout(busy_timeout)?;
        schema::check_compatibility(conn)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        retry.run(conn, |tx| {
            let version = schema::read_user_version(tx)?;
            schema::create_schema(tx, version)
        })
    }

    /// Attach an embedding collaborator to this handle.
    pub fn with_embedder(mut self, embedder: SharedEmbedder) -> Self {
        if embedder.dimensions() != self.embedding_config.dimensions {
            warn!(
                "Embedder '{}' produces {} dimensions but {} are configured; vectors of other sizes are ignored by search",
                embedder.name(),
                embedder.dimensions(),
                self.embedding_config.dimensions
            );
        }
        if let Ok(Some(stored)) = self.get_meta("embedding.dimensions")
            && stored != embedder.dimensions().to_string()
        {
            warn!(
                "Store holds {}-dimension vectors; embedder '{}' produces {}. Run embed_pending after clearing stale vectors to re-index",
                stored,
                embedder.name(),
                embedder.dimensions()
            );
        }
        self.embedder = Some(embedder);
        self
    }

    /// Replace the causal-link policy chosen by configuration.
    pub fn with_link_policy(mut self, policy: Arc<dyn LinkPolicy>) -> Self {
        self.link_policy = policy;
        self
    }

    /// Path of the store file (`None` for in-memory stores).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether an embedder is attached.
    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Utility Operations
// ─────────────────────────────────────────────────────────────────────────────

impl Brain {
    /// Get a metadata value.
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Set a metadata value.
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
    }

    /// Get database statistics.
    pub fn stats(&self) -> Result<StoreStats> {
        let pending_embeddings = self.pending_embeddings()?;
        let conn = self.conn.lock();

        let count = |table: &str| -> Result<usize> {
            let n: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?;
            Ok(n as usize)
        };

        let embedding_model: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'embedding.model'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let embedding_dimensions: Option<usize> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'embedding.dimensions'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .and_then(|s| s.parse().ok());

        Ok(StoreStats {
            message_count: count("messages")?,
            thread_count: count("threads")?,
            stm_count: count("stm")?,
            atom_count: count("atoms")?,
            link_count: count("atom_links")?,
            embedding_count: count("embeddings")?,
            field_embedding_count: count("atom_field_embeddings")?,
            pin_count: count("working_memory")?,
            pending_embeddings,
            schema_version: SCHEMA_VERSION,
            embedding_model,
            embedding_dimensions,
        })
    }

    /// Records created per UTC day over the last `days` days, oldest first.
    ///
    /// Days without activity are included with zero counts. Windows longer
    /// than [`MAX_ACTIVITY_DAYS`] are clamped to it.
    pub fn daily_activity(&self, days: u32) -> Result<Vec<DailyActivity>> {
        if days == 0 {
            return Ok(Vec::new());
        }
        if days > MAX_ACTIVITY_DAYS {
            debug!("daily_activity window of {} days clamped to {}", days, MAX_ACTIVITY_DAYS);
        }
        let days = days.min(MAX_ACTIVITY_DAYS);
        let today = Utc::now().date_naive();
        let first = today
            .checked_sub_days(chrono::Days::new(u64::from(days - 1)))
            .unwrap_or(today);
        let cutoff = first.format("%Y-%m-%d").to_string();

        let mut activity: Vec<DailyActivity> = first
            .iter_days()
            .take(days as usize)
            .map(|date| DailyActivity {
                date,
                messages: 0,
                stm_entries: 0,
                atoms: 0,
            })
            .collect();

        let conn = self.conn.lock();
        for kind in SourceKind::ALL {
            let mut stmt = conn.prepare(&format!(
                "SELECT substr(created_at, 1, 10) AS day, COUNT(*) FROM {} \
                 WHERE created_at >= ?1 GROUP BY day",
                kind.table()
            ))?;
            let rows = stmt.query_map(params![cutoff], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (day, n) = row?;
                let Ok(date) = NaiveDate::parse_from_str(&day, "%Y-%m-%d") else {
                    continue;
                };
                let Some(slot) = activity.iter_mut().find(|a| a.date == date) else {
                    continue;
                };
                match kind {
                    SourceKind::Message => slot.messages = n as usize,
                    SourceKind::Stm => slot.stm_entries = n as usize,
                    SourceKind::Atom => slot.atoms = n as usize,
                }
            }
        }
        Ok(activity)
    }

    /// Share of each record kind that has a unified embedding.
    pub fn embedding_coverage(&self) -> Result<Vec<EmbeddingCoverage>> {
        let conn = self.conn.lock();
        let mut coverage = Vec::with_capacity(SourceKind::ALL.len());
        for kind in SourceKind::ALL {
            let (total, embedded): (i64, i64) = conn.query_row(
                &format!(
                    "SELECT COUNT(*), \
                            COALESCE(SUM(EXISTS (SELECT 1 FROM embeddings e \
                                 WHERE e.source_type = ?1 AND e.source_id = t.id)), 0) \
                     FROM {} t",
                    kind.table()
                ),
                params![kind.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let percent = if total == 0 {
                100.0
            } else {
                embedded as f64 * 100.0 / total as f64
            };
            coverage.push(EmbeddingCoverage {
                kind,
                total: total as usize,
                embedded: embedded as usize,
                percent,
            });
        }
        Ok(coverage)
    }

    /// Configured preview length for search results and chains.
    pub(crate) fn preview(&self, text: &str) -> String {
        crate::types::truncate_chars(text, self.settings.preview_chars)
    }

    pub(crate) fn now_timestamp() -> String {
        format_timestamp(&Utc::now())
    }
}
