//! On-disk store and connection management
//!
//! The store owns a single SQLite database in the cache directory:
//! - `policies`: one row per (namespace, policy_name), shared by all cultures
//! - `policy_i18n`: one row per (policy, culture)
//! - `policy_fts`: contentless FTS5 index over n-gram token streams
//! - `policy_fts_map`: FTS rowid -> (policy, culture), since the index has no readable columns
//! - `meta`: key/value rows (source root, per-culture content signatures, schema hash)
//! - `file_usage`: last-access timestamps per source file
//!
//! Schema creation is idempotent. Structural changes run in explicit
//! transactions; maintenance primitives are single pragmas or FTS commands.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Database file name within the cache directory
pub const DB_FILE: &str = "policies.db";

/// Meta key recording the build-time schema hash
pub const SCHEMA_HASH_KEY: &str = "schema_hash";

/// Hash of the cache-critical sources, computed by build.rs
pub const SCHEMA_HASH: &str = env!("CACHE_SCHEMA_HASH");

/// Tables the rest of the crate relies on
const REQUIRED_TABLES: &[&str] = &[
    "policies",
    "policy_i18n",
    "policy_fts",
    "policy_fts_map",
    "meta",
    "file_usage",
];

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS policies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ns TEXT NOT NULL,
        policy_name TEXT NOT NULL,
        category_key TEXT,
        hive TEXT NOT NULL,
        reg_key TEXT NOT NULL,
        reg_value TEXT,
        value_type TEXT NOT NULL,
        product_hint TEXT,
        UNIQUE (ns, policy_name)
    );

    CREATE INDEX IF NOT EXISTS idx_policies_name ON policies(policy_name COLLATE NOCASE);
    CREATE INDEX IF NOT EXISTS idx_policies_reg_key ON policies(reg_key COLLATE NOCASE);

    CREATE TABLE IF NOT EXISTS policy_i18n (
        policy_id INTEGER NOT NULL,
        culture TEXT NOT NULL,
        display_name TEXT NOT NULL,
        explain_text TEXT NOT NULL DEFAULT '',
        category_path TEXT NOT NULL DEFAULT '',
        presentation_blob TEXT,
        PRIMARY KEY (policy_id, culture),
        FOREIGN KEY (policy_id) REFERENCES policies(id) ON DELETE CASCADE
    );

    CREATE INDEX IF NOT EXISTS idx_i18n_culture ON policy_i18n(culture);

    CREATE VIRTUAL TABLE IF NOT EXISTS policy_fts USING fts5(
        title_norm,
        desc_norm,
        title_loose,
        desc_loose,
        registry_path,
        tags,
        content = '',
        contentless_delete = 1,
        tokenize = 'unicode61 remove_diacritics 0'
    );

    CREATE TABLE IF NOT EXISTS policy_fts_map (
        rowid INTEGER PRIMARY KEY,
        policy_id INTEGER NOT NULL,
        culture TEXT NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_fts_map_policy ON policy_fts_map(policy_id, culture);
    CREATE INDEX IF NOT EXISTS idx_fts_map_culture ON policy_fts_map(culture);

    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS file_usage (
        file_path TEXT PRIMARY KEY,
        last_access_utc INTEGER NOT NULL,
        kind INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_file_usage_access ON file_usage(last_access_utc);
";

const DROP_SQL: &str = "
    DROP TABLE IF EXISTS policy_fts;
    DROP TABLE IF EXISTS policy_fts_map;
    DROP TABLE IF EXISTS policy_i18n;
    DROP TABLE IF EXISTS policies;
    DROP TABLE IF EXISTS meta;
    DROP TABLE IF EXISTS file_usage;
";

/// Handle to the cache database
///
/// Cheap to clone; every operation opens its own connection so readers and
/// writers in different tasks never share one.
#[derive(Debug, Clone)]
pub struct Store {
    db_path: PathBuf,
    busy_timeout: Duration,
}

/// Row counts and size information
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub policies: usize,
    pub localizations: usize,
    pub index_entries: usize,
    pub tracked_files: usize,
    pub localizations_by_culture: BTreeMap<String, usize>,
    pub page_count: u64,
    pub freelist_count: u64,
    pub size_bytes: u64,
}

impl Store {
    pub fn new(db_path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            db_path: db_path.into(),
            busy_timeout,
        }
    }

    /// Path of the database file
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Check if the database file exists
    pub fn exists(&self) -> bool {
        self.db_path.exists()
    }

    /// Open a connection with WAL, foreign keys and the busy timeout applied
    pub fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory {}", parent.display()))?;
        }

        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("Failed to open {}", self.db_path.display()))?;

        conn.busy_timeout(self.busy_timeout)?;
        // auto_vacuum only takes effect before the first table exists
        conn.pragma_update(None, "auto_vacuum", "INCREMENTAL")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Ok(conn)
    }

    /// Create any missing tables; recreate everything if the recorded schema
    /// hash differs from this build's
    ///
    /// Returns true if an existing cache was discarded.
    pub fn ensure_schema(&self) -> Result<bool> {
        let mut conn = self.open()?;

        let stored_hash: Option<String> = if table_exists(&conn, "meta")? {
            conn.query_row(
                "SELECT value FROM meta WHERE key = ?1",
                [SCHEMA_HASH_KEY],
                |row| row.get(0),
            )
            .optional()?
        } else {
            None
        };

        let has_policies = table_exists(&conn, "policies")?;
        let reset = has_policies && stored_hash.as_deref() != Some(SCHEMA_HASH);

        let tx = conn.transaction()?;
        if reset {
            log::warn!(
                "Cache schema changed (stored {:?}, current {}); rebuilding cache tables",
                stored_hash,
                SCHEMA_HASH
            );
            tx.execute_batch(DROP_SQL).context("Failed to drop outdated cache tables")?;
        }
        tx.execute_batch(SCHEMA_SQL).context("Failed to create cache schema")?;
        tx.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [SCHEMA_HASH_KEY, SCHEMA_HASH],
        )?;
        tx.commit()?;

        log::debug!("Cache schema ready at {}", self.db_path.display());
        Ok(reset)
    }

    /// Verify the database opens and every required table is present
    pub fn validate(&self) -> Result<()> {
        if !self.exists() {
            anyhow::bail!("Database file missing: {}", self.db_path.display());
        }

        let conn = self
            .open()
            .context("Failed to open database - it may be corrupted")?;

        for table in REQUIRED_TABLES {
            if !table_exists(&conn, table)? {
                anyhow::bail!("Required table '{}' missing from database schema", table);
            }
        }

        let integrity: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .context("Failed to run integrity check")?;
        if integrity != "ok" {
            anyhow::bail!("Database integrity check failed: {}", integrity);
        }

        log::debug!("Cache validation passed");
        Ok(())
    }

    /// Flush the WAL into the main database file
    ///
    /// `TRUNCATE` also resets the WAL file; `PASSIVE` never waits on readers.
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<()> {
        if !self.exists() {
            return Ok(());
        }

        let conn = self.open()?;
        let sql = format!("PRAGMA wal_checkpoint({})", mode.as_sql());
        conn.query_row(&sql, [], |row| {
            let busy: i64 = row.get(0)?;
            let log_pages: i64 = row.get(1)?;
            let checkpointed: i64 = row.get(2)?;
            log::debug!(
                "WAL checkpoint ({}): busy={}, log_pages={}, checkpointed_pages={}",
                mode.as_sql(),
                busy,
                log_pages,
                checkpointed
            );
            Ok(())
        })
        .context("Failed to execute WAL checkpoint")?;

        Ok(())
    }

    /// Merge FTS segments into one b-tree
    pub fn optimize_index(&self) -> Result<()> {
        let conn = self.open()?;
        conn.execute("INSERT INTO policy_fts(policy_fts) VALUES('optimize')", [])
            .context("Failed to optimize full-text index")?;
        conn.execute_batch("PRAGMA optimize;")
            .context("Failed to run PRAGMA optimize")?;
        Ok(())
    }

    /// Return up to `pages` free pages to the file system
    pub fn incremental_vacuum(&self, pages: u64) -> Result<()> {
        if pages == 0 {
            return Ok(());
        }
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!("PRAGMA incremental_vacuum({})", pages))?;
        // The pragma does its work while rows are stepped
        let mut rows = stmt.query([])?;
        while rows.next()?.is_some() {}
        Ok(())
    }

    /// Rewrite the whole database file
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.open()?;
        conn.execute_batch("VACUUM;").context("Failed to vacuum database")?;
        log::info!("Vacuumed {}", self.db_path.display());
        Ok(())
    }

    /// (page_count, freelist_count)
    pub fn page_counts(&self) -> Result<(u64, u64)> {
        let conn = self.open()?;
        let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let free: i64 = conn.query_row("PRAGMA freelist_count", [], |row| row.get(0))?;
        Ok((pages.max(0) as u64, free.max(0) as u64))
    }

    /// Distinct cultures that currently have localization rows
    pub fn cultures(&self) -> Result<Vec<String>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT DISTINCT culture FROM policy_i18n ORDER BY culture")?;
        let cultures = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(cultures)
    }

    /// Get statistics about the current cache
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.open()?;

        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n.max(0) as usize)
        };

        let policies = count("SELECT COUNT(*) FROM policies")?;
        let localizations = count("SELECT COUNT(*) FROM policy_i18n")?;
        let index_entries = count("SELECT COUNT(*) FROM policy_fts_map")?;
        let tracked_files = count("SELECT COUNT(*) FROM file_usage")?;

        let mut localizations_by_culture = BTreeMap::new();
        let mut stmt = conn.prepare("SELECT culture, COUNT(*) FROM policy_i18n GROUP BY culture")?;
        let rows = stmt.query_map([], |row| {
            let culture: String = row.get(0)?;
            let n: i64 = row.get(1)?;
            Ok((culture, n.max(0) as usize))
        })?;
        for row in rows {
            let (culture, n) = row?;
            localizations_by_culture.insert(culture, n);
        }

        let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let free: i64 = conn.query_row("PRAGMA freelist_count", [], |row| row.get(0))?;

        let size_bytes = ["", "-wal", "-shm"]
            .iter()
            .filter_map(|suffix| {
                let mut name = self.db_path.as_os_str().to_owned();
                name.push(suffix);
                std::fs::metadata(PathBuf::from(name)).ok()
            })
            .map(|m| m.len())
            .sum();

        Ok(StoreStats {
            policies,
            localizations,
            index_entries,
            tracked_files,
            localizations_by_culture,
            page_count: pages.max(0) as u64,
            freelist_count: free.max(0) as u64,
            size_bytes,
        })
    }

    /// Delete the database and its WAL side files
    pub fn clear(&self) -> Result<()> {
        log::warn!("Clearing cache database at {}", self.db_path.display());

        for suffix in ["", "-wal", "-shm"] {
            let mut name = self.db_path.as_os_str().to_owned();
            name.push(suffix);
            let path = PathBuf::from(name);
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        Ok(())
    }
}

/// WAL checkpoint flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    Passive,
    Truncate,
}

impl CheckpointMode {
    fn as_sql(&self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PASSIVE",
            CheckpointMode::Truncate => "TRUNCATE",
        }
    }
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}
