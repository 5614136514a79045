//! Last-access tracking for source files
//!
//! Each scan stamps every definition and localization file it looked at. An
//! external collaborator can then purge rows that have not been touched for a
//! while and evict the corresponding source trees.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::params;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileKind {
    Definition,
    Localization,
}

impl FileKind {
    fn as_i64(self) -> i64 {
        match self {
            FileKind::Definition => 0,
            FileKind::Localization => 1,
        }
    }

    fn from_i64(value: i64) -> Self {
        if value == 1 {
            FileKind::Localization
        } else {
            FileKind::Definition
        }
    }
}

/// One tracked file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileUsage {
    pub file_path: String,
    pub last_access: DateTime<Utc>,
    pub kind: FileKind,
}

#[derive(Debug, Clone)]
pub struct FileUsageTracker {
    store: Store,
}

impl FileUsageTracker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Stamp `paths` with the current time
    pub fn touch<P: AsRef<Path>>(&self, paths: &[P], kind: FileKind) -> Result<usize> {
        self.touch_at(paths, kind, Utc::now())
    }

    /// Stamp `paths` with an explicit time
    pub fn touch_at<P: AsRef<Path>>(
        &self,
        paths: &[P],
        kind: FileKind,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        if paths.is_empty() {
            return Ok(0);
        }

        let mut conn = self.store.open()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO file_usage (file_path, last_access_utc, kind) VALUES (?1, ?2, ?3)
                 ON CONFLICT(file_path) DO UPDATE SET
                     last_access_utc = MAX(last_access_utc, excluded.last_access_utc),
                     kind = excluded.kind",
            )?;
            for path in paths {
                stmt.execute(params![
                    path.as_ref().to_string_lossy(),
                    at.timestamp_millis(),
                    kind.as_i64()
                ])?;
            }
        }
        tx.commit().context("Failed to commit file usage update")?;

        log::debug!("Touched {} {:?} file(s)", paths.len(), kind);
        Ok(paths.len())
    }

    /// Delete rows whose last access is older than `older_than` ago
    pub fn purge(&self, older_than: Duration) -> Result<usize> {
        let cutoff = ChronoDuration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.purge_before(cutoff)
    }

    /// Delete rows last accessed at or before `cutoff`
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.store.open()?;
        let removed = conn
            .execute(
                "DELETE FROM file_usage WHERE last_access_utc <= ?1",
                [cutoff.timestamp_millis()],
            )
            .context("Failed to purge file usage rows")?;
        log::info!("Purged {} stale file usage row(s)", removed);
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.store.open()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM file_usage", [], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }

    pub fn get(&self, path: &Path) -> Result<Option<FileUsage>> {
        let conn = self.store.open()?;
        let mut stmt = conn.prepare(
            "SELECT file_path, last_access_utc, kind FROM file_usage WHERE file_path = ?1",
        )?;
        let mut rows = stmt.query([path.to_string_lossy()])?;
        match rows.next()? {
            Some(row) => Ok(Some(usage_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> Result<Vec<FileUsage>> {
        let conn = self.store.open()?;
        let mut stmt = conn.prepare(
            "SELECT file_path, last_access_utc, kind FROM file_usage ORDER BY file_path",
        )?;
        let rows = stmt.query_map([], |row| usage_from_row(row))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn usage_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileUsage> {
    let millis: i64 = row.get(1)?;
    let kind: i64 = row.get(2)?;
    Ok(FileUsage {
        file_path: row.get(0)?,
        last_access: DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MIN_UTC),
        kind: FileKind::from_i64(kind),
    })
}
