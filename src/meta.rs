//! Key/value metadata: indexed source root and per-culture content signatures

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use std::path::{Component, Path, PathBuf};

use crate::store::Store;

/// Meta key holding the source root of the last global rebuild
pub const SOURCE_ROOT_KEY: &str = "source_root";

/// Prefix of per-culture signature keys (`sig:en-US`)
const SIGNATURE_PREFIX: &str = "sig:";

#[derive(Debug, Clone)]
pub struct MetaStore {
    store: Store,
}

impl MetaStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.store.open()?;
        let value = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| row.get(0))
            .optional()
            .with_context(|| format!("Failed to read meta key '{}'", key))?;
        Ok(value)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.store.open()?;
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .with_context(|| format!("Failed to write meta key '{}'", key))?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let conn = self.store.open()?;
        conn.execute("DELETE FROM meta WHERE key = ?1", [key])?;
        Ok(())
    }

    /// True if `current_root` differs from the recorded root, or nothing is recorded
    ///
    /// Any error reading the store counts as "rebuild needed".
    pub fn needs_global_rebuild(&self, current_root: &Path) -> bool {
        match self.get(SOURCE_ROOT_KEY) {
            Ok(Some(previous)) => {
                let current = normalize_root(current_root);
                let differs = !roots_equal(&previous, &current);
                if differs {
                    log::info!("Source root changed from '{}' to '{}'", previous, current);
                }
                differs
            }
            Ok(None) => {
                log::debug!("No source root recorded yet");
                true
            }
            Err(e) => {
                log::warn!("Failed to read recorded source root, forcing rebuild: {:#}", e);
                true
            }
        }
    }

    pub fn source_root(&self) -> Result<Option<String>> {
        self.get(SOURCE_ROOT_KEY)
    }

    pub fn set_source_root(&self, root: &Path) -> Result<()> {
        self.set(SOURCE_ROOT_KEY, &normalize_root(root))
    }

    pub fn signature(&self, culture: &str) -> Result<Option<String>> {
        self.get(&signature_key(culture))
    }

    pub fn set_signature(&self, culture: &str, signature: &str) -> Result<()> {
        self.set(&signature_key(culture), signature)
    }

    pub fn delete_signature(&self, culture: &str) -> Result<()> {
        self.delete(&signature_key(culture))
    }

    /// Remove every stored culture signature
    pub fn clear_signatures(&self) -> Result<usize> {
        let conn = self.store.open()?;
        let removed = conn.execute(
            "DELETE FROM meta WHERE key LIKE ?1",
            [format!("{}%", SIGNATURE_PREFIX)],
        )?;
        Ok(removed)
    }
}

fn signature_key(culture: &str) -> String {
    format!("{}{}", SIGNATURE_PREFIX, culture)
}

/// Absolute, lexically cleaned form of a source root with `/` separators
///
/// Symlinks are resolved when the path exists; otherwise `.` and `..` are
/// folded lexically.
pub fn normalize_root(root: &Path) -> String {
    let absolute = match std::fs::canonicalize(root) {
        Ok(resolved) => resolved,
        Err(_) => {
            let joined = if root.is_absolute() {
                root.to_path_buf()
            } else {
                std::env::current_dir()
                    .map(|cwd| cwd.join(root))
                    .unwrap_or_else(|_| root.to_path_buf())
            };
            clean_lexically(&joined)
        }
    };

    let text = absolute.to_string_lossy().replace('\\', "/");
    let trimmed = text.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn clean_lexically(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

/// Case-insensitive comparison of two normalized roots
pub fn roots_equal(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}
