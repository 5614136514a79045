//! Cross-process writer serialization
//!
//! Every mutation of the full-text index goes through a `WriterGate`. The file
//! based gate takes an advisory exclusive lock on `<cache_dir>/writer.lock`,
//! so separate processes sharing a cache directory never write concurrently.
//!
//! Acquisition is bounded: each attempt polls for up to `timeout`, and after
//! `attempts` failed attempts (separated by `backoff`) the gate reports busy
//! by returning `Ok(None)`. Callers skip the mutation in that case.

use anyhow::{Context, Result};
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::{CacheConfig, WriterLockConfig};

/// Lock file name within the cache directory
pub const LOCK_FILE: &str = "writer.lock";

/// Interval between lock polls within one attempt
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Held while mutating; releases the lock when dropped
#[derive(Debug)]
pub struct WriterToken {
    file: Option<File>,
}

impl WriterToken {
    /// Token that guards nothing (fast mode)
    pub fn unlocked() -> Self {
        Self { file: None }
    }

    /// True if this token holds a real file lock
    pub fn is_locked(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for WriterToken {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
    }
}

#[async_trait]
pub trait WriterGate: Send + Sync {
    /// Try to become the single writer
    ///
    /// Returns `Ok(None)` when the gate stayed busy for the whole retry budget.
    async fn acquire(&self) -> Result<Option<WriterToken>>;
}

/// Advisory file lock shared by every process using the same cache directory
#[derive(Debug, Clone)]
pub struct FileWriterGate {
    lock_path: PathBuf,
    policy: WriterLockConfig,
}

impl FileWriterGate {
    pub fn new(lock_path: impl Into<PathBuf>, policy: WriterLockConfig) -> Self {
        Self {
            lock_path: lock_path.into(),
            policy,
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn open_lock_file(&self) -> Result<File> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open lock file {}", self.lock_path.display()))
    }

    /// One non-blocking lock attempt
    fn try_lock(&self) -> Result<Option<WriterToken>> {
        let file = self.open_lock_file()?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(WriterToken { file: Some(file) })),
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to lock {}", self.lock_path.display())),
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || (err.raw_os_error().is_some()
            && err.raw_os_error() == fs2::lock_contended_error().raw_os_error())
}

#[async_trait]
impl WriterGate for FileWriterGate {
    async fn acquire(&self) -> Result<Option<WriterToken>> {
        let attempts = self.policy.attempts.max(1);

        for attempt in 1..=attempts {
            let deadline = Instant::now() + self.policy.timeout();
            loop {
                if let Some(token) = self.try_lock()? {
                    log::debug!("Writer gate acquired on attempt {}", attempt);
                    return Ok(Some(token));
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
            }

            log::debug!("Writer gate busy (attempt {}/{})", attempt, attempts);
            if attempt < attempts {
                tokio::time::sleep(self.policy.backoff()).await;
            }
        }

        log::warn!(
            "Writer gate {} still busy after {} attempts",
            self.lock_path.display(),
            attempts
        );
        Ok(None)
    }
}

/// Gate that always succeeds immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWriterGate;

#[async_trait]
impl WriterGate for NoopWriterGate {
    async fn acquire(&self) -> Result<Option<WriterToken>> {
        Ok(Some(WriterToken::unlocked()))
    }
}

/// Gate matching the configuration: no-op in fast mode, file lock otherwise
pub fn gate_for(config: &CacheConfig) -> std::sync::Arc<dyn WriterGate> {
    if config.fast_mode {
        log::debug!("Fast mode: writer gate disabled");
        std::sync::Arc::new(NoopWriterGate)
    } else {
        std::sync::Arc::new(FileWriterGate::new(
            config.lock_path(),
            config.writer_lock.clone(),
        ))
    }
}
