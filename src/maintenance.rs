//! Opportunistic store maintenance
//!
//! Small databases only get a passive WAL checkpoint. Once the page count
//! passes `maintenance_min_pages`, a run also merges the full-text segments,
//! runs `PRAGMA optimize`, truncates the WAL and returns a bounded share of
//! the free pages to the file system.
//!
//! Maintenance never fails the caller: errors are logged and reported.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::store::{CheckpointMode, Store};
use crate::writer_gate::WriterGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MaintenanceKind {
    /// Optimize, truncating checkpoint and incremental vacuum
    Full,
    /// Below the size threshold
    PassiveCheckpoint,
    /// Writer gate stayed busy
    SkippedBusy,
    /// A step failed; see the log
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub kind: MaintenanceKind,
    pub page_count: u64,
    pub freelist_pages: u64,
    pub vacuumed_pages: u64,
}

impl MaintenanceReport {
    fn new(kind: MaintenanceKind) -> Self {
        Self {
            kind,
            page_count: 0,
            freelist_pages: 0,
            vacuumed_pages: 0,
        }
    }
}

pub struct MaintenanceScheduler {
    store: Store,
    gate: Arc<dyn WriterGate>,
    min_pages: u64,
    max_compaction_ratio: f64,
}

impl MaintenanceScheduler {
    pub fn new(store: Store, gate: Arc<dyn WriterGate>, config: &CacheConfig) -> Self {
        Self {
            store,
            gate,
            min_pages: config.maintenance_min_pages,
            max_compaction_ratio: config.max_compaction_ratio.clamp(0.0, 1.0),
        }
    }

    /// Run whatever maintenance the current store size calls for
    pub async fn run(&self) -> MaintenanceReport {
        let token = match self.gate.acquire().await {
            Ok(Some(token)) => token,
            Ok(None) => {
                log::warn!("Writer gate busy, skipping maintenance");
                return MaintenanceReport::new(MaintenanceKind::SkippedBusy);
            }
            Err(e) => {
                log::warn!("Maintenance could not acquire writer gate: {:#}", e);
                return MaintenanceReport::new(MaintenanceKind::Failed);
            }
        };

        let report = match self.run_locked() {
            Ok(report) => report,
            Err(e) => {
                log::warn!("Maintenance failed: {:#}", e);
                MaintenanceReport::new(MaintenanceKind::Failed)
            }
        };
        drop(token);
        report
    }

    fn run_locked(&self) -> Result<MaintenanceReport> {
        let (page_count, freelist_pages) = self.store.page_counts()?;

        if page_count <= self.min_pages {
            self.store.checkpoint(CheckpointMode::Passive)?;
            log::debug!(
                "Store has {} pages (threshold {}), passive checkpoint only",
                page_count,
                self.min_pages
            );
            return Ok(MaintenanceReport {
                kind: MaintenanceKind::PassiveCheckpoint,
                page_count,
                freelist_pages,
                vacuumed_pages: 0,
            });
        }

        self.store.optimize_index()?;
        self.store.checkpoint(CheckpointMode::Truncate)?;

        let budget = compaction_budget(page_count, freelist_pages, self.max_compaction_ratio);
        self.store.incremental_vacuum(budget)?;

        log::info!(
            "Maintenance: {} pages, {} free, reclaimed up to {}",
            page_count,
            freelist_pages,
            budget
        );
        Ok(MaintenanceReport {
            kind: MaintenanceKind::Full,
            page_count,
            freelist_pages,
            vacuumed_pages: budget,
        })
    }

    /// Full `VACUUM` plus WAL truncation; `Ok(false)` if the gate was busy
    pub async fn compact(&self) -> Result<bool> {
        let Some(_token) = self.gate.acquire().await? else {
            log::warn!("Writer gate busy, skipping compaction");
            return Ok(false);
        };
        self.store.optimize_index()?;
        self.store.vacuum()?;
        self.store.checkpoint(CheckpointMode::Truncate)?;
        Ok(true)
    }
}

/// Free pages to release in one run: never more than `ratio` of the database
pub fn compaction_budget(page_count: u64, freelist_pages: u64, ratio: f64) -> u64 {
    let cap = (page_count as f64 * ratio).floor() as u64;
    freelist_pages.min(cap)
}
