//! Diff & apply: make the store match a freshly loaded bundle for one culture
//!
//! Two phases run while the writer gate is held:
//!
//! 1. **Delete** (one transaction). A global rebuild wipes the full-text
//!    index with `delete-all` and removes every policy and localization row.
//!    Otherwise only the culture's rows go; the index is contentless, so its
//!    row ids are collected from `policy_fts_map` first and deleted one by one.
//! 2. **Upsert** (one transaction per batch). Each policy row is upserted;
//!    if the culture resolved a non-empty display name, its localization row,
//!    index entry and map row are written too. A failing batch rolls back and
//!    the remaining batches are abandoned. Earlier batches stay committed.
//!
//! Cancellation is checked before every batch and every row.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Statement, Transaction};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::CacheError;
use crate::loader::{LoadedPolicy, PolicyBundle};
use crate::models::unique_id;
use crate::normalize::{gram_tokens, loose, strict};
use crate::store::Store;
use crate::writer_gate::WriterGate;

/// Row counts for one apply or purge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    /// Localization rows removed by the delete phase
    pub removed: usize,
    /// Policy rows upserted
    pub policies: usize,
    /// Localization rows (and index entries) written
    pub localized: usize,
    /// Policies without a display name in this culture
    pub skipped_unnamed: usize,
    /// Committed upsert batches
    pub batches: usize,
}

impl ApplyStats {
    fn absorb(&mut self, batch: &ApplyStats) {
        self.policies += batch.policies;
        self.localized += batch.localized;
        self.skipped_unnamed += batch.skipped_unnamed;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ApplyOutcome {
    Applied(ApplyStats),
    /// The writer gate stayed busy; nothing was changed
    WriterBusy,
}

pub struct ApplyEngine {
    store: Store,
    gate: Arc<dyn WriterGate>,
    batch_size: usize,
}

impl ApplyEngine {
    pub fn new(store: Store, gate: Arc<dyn WriterGate>, batch_size: usize) -> Self {
        Self {
            store,
            gate,
            batch_size: batch_size.max(1),
        }
    }

    /// Replace the bundle culture's rows (or everything, on a global rebuild)
    pub async fn apply(
        &self,
        bundle: &PolicyBundle,
        global_rebuild: bool,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled.into());
        }

        let Some(_token) = self.gate.acquire().await? else {
            log::warn!("Writer gate busy, skipping update of {}", bundle.culture);
            return Ok(ApplyOutcome::WriterBusy);
        };

        let culture = bundle.culture.as_str();
        let mut conn = self.store.open()?;
        let mut stats = ApplyStats::default();

        stats.removed = if global_rebuild {
            log::info!("Global rebuild: wiping all cached policies");
            delete_everything(&mut conn)?
        } else {
            delete_culture(&mut conn, culture)?
        };
        log::debug!("Removed {} localization row(s) before applying {}", stats.removed, culture);

        for chunk in bundle.policies.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled.into());
            }

            let batch = upsert_batch(&mut conn, chunk, culture, cancel).with_context(|| {
                format!("Failed to apply batch {} for {}", stats.batches + 1, culture)
            })?;
            stats.absorb(&batch);
            stats.batches += 1;

            tokio::task::yield_now().await;
        }

        log::info!(
            "Applied {} policies for {} ({} localized, {} without display name, {} batch(es))",
            stats.policies,
            culture,
            stats.localized,
            stats.skipped_unnamed,
            stats.batches
        );
        Ok(ApplyOutcome::Applied(stats))
    }

    /// Remove every localization row and index entry of one culture
    pub async fn purge_culture(&self, culture: &str) -> Result<ApplyOutcome> {
        let Some(_token) = self.gate.acquire().await? else {
            log::warn!("Writer gate busy, skipping purge of {}", culture);
            return Ok(ApplyOutcome::WriterBusy);
        };

        let mut conn = self.store.open()?;
        let removed = delete_culture(&mut conn, culture)?;
        if removed > 0 {
            log::info!("Purged {} localization row(s) for {}", removed, culture);
        }
        Ok(ApplyOutcome::Applied(ApplyStats {
            removed,
            ..ApplyStats::default()
        }))
    }

    /// Remove every policy, localization row and index entry
    pub async fn purge_all(&self) -> Result<ApplyOutcome> {
        let Some(_token) = self.gate.acquire().await? else {
            log::warn!("Writer gate busy, skipping global purge");
            return Ok(ApplyOutcome::WriterBusy);
        };

        let mut conn = self.store.open()?;
        let removed = delete_everything(&mut conn)?;
        log::info!("Purged all cached policies ({} localization row(s))", removed);
        Ok(ApplyOutcome::Applied(ApplyStats {
            removed,
            ..ApplyStats::default()
        }))
    }
}

/// Wipe the index and all policy data in one transaction
fn delete_everything(conn: &mut Connection) -> Result<usize> {
    let tx = conn.transaction()?;
    let removed: i64 = tx.query_row("SELECT COUNT(*) FROM policy_i18n", [], |row| row.get(0))?;
    tx.execute("INSERT INTO policy_fts(policy_fts) VALUES('delete-all')", [])
        .context("Failed to wipe full-text index")?;
    tx.execute_batch(
        "DELETE FROM policy_fts_map;
         DELETE FROM policy_i18n;
         DELETE FROM policies;",
    )
    .context("Failed to delete policy rows")?;
    tx.commit().context("Failed to commit global delete")?;
    Ok(removed.max(0) as usize)
}

/// Delete one culture's index entries by row id, then its map and localization rows
fn delete_culture(conn: &mut Connection, culture: &str) -> Result<usize> {
    let tx = conn.transaction()?;

    let rowids: Vec<i64> = {
        let mut stmt = tx.prepare("SELECT rowid FROM policy_fts_map WHERE culture = ?1")?;
        let rows = stmt.query_map([culture], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    {
        let mut delete_fts = tx.prepare("DELETE FROM policy_fts WHERE rowid = ?1")?;
        for rowid in &rowids {
            delete_fts.execute([rowid])?;
        }
    }

    tx.execute("DELETE FROM policy_fts_map WHERE culture = ?1", [culture])?;
    let removed = tx.execute("DELETE FROM policy_i18n WHERE culture = ?1", [culture])?;
    tx.commit()
        .with_context(|| format!("Failed to commit delete for {}", culture))?;

    log::debug!("Deleted {} index entries for {}", rowids.len(), culture);
    Ok(removed)
}

/// Prepared statements shared by every row of one batch
struct UpsertStatements<'conn> {
    policy: Statement<'conn>,
    localization: Statement<'conn>,
    find_entry: Statement<'conn>,
    delete_entry: Statement<'conn>,
    delete_map: Statement<'conn>,
    insert_entry: Statement<'conn>,
    insert_map: Statement<'conn>,
}

impl<'conn> UpsertStatements<'conn> {
    fn prepare(tx: &'conn Transaction<'_>) -> Result<Self> {
        Ok(Self {
            policy: tx.prepare(
                "INSERT INTO policies
                     (ns, policy_name, category_key, hive, reg_key, reg_value, value_type, product_hint)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(ns, policy_name) DO UPDATE SET
                     category_key = excluded.category_key,
                     hive = excluded.hive,
                     reg_key = excluded.reg_key,
                     reg_value = excluded.reg_value,
                     value_type = excluded.value_type,
                     product_hint = excluded.product_hint
                 RETURNING id",
            )?,
            localization: tx.prepare(
                "INSERT INTO policy_i18n
                     (policy_id, culture, display_name, explain_text, category_path, presentation_blob)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(policy_id, culture) DO UPDATE SET
                     display_name = excluded.display_name,
                     explain_text = excluded.explain_text,
                     category_path = excluded.category_path,
                     presentation_blob = excluded.presentation_blob",
            )?,
            find_entry: tx.prepare(
                "SELECT rowid FROM policy_fts_map WHERE policy_id = ?1 AND culture = ?2",
            )?,
            delete_entry: tx.prepare("DELETE FROM policy_fts WHERE rowid = ?1")?,
            delete_map: tx.prepare("DELETE FROM policy_fts_map WHERE rowid = ?1")?,
            insert_entry: tx.prepare(
                "INSERT INTO policy_fts
                     (title_norm, desc_norm, title_loose, desc_loose, registry_path, tags)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?,
            insert_map: tx.prepare(
                "INSERT INTO policy_fts_map (rowid, policy_id, culture) VALUES (?1, ?2, ?3)",
            )?,
        })
    }
}

/// Token streams written to the full-text index for one localized policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub title_norm: String,
    pub desc_norm: String,
    pub title_loose: String,
    pub desc_loose: String,
    pub registry_path: String,
    pub tags: String,
}

impl IndexEntry {
    pub fn build(policy: &LoadedPolicy) -> Self {
        let registry_text = match &policy.registry_value {
            Some(value) => format!("{}\\{}", policy.registry_key, value),
            None => policy.registry_key.clone(),
        };

        let mut tags = vec![
            gram_tokens(&strict(&unique_id(&policy.namespace, &policy.name))),
            gram_tokens(&loose(&policy.name)),
            gram_tokens(&strict(&policy.value_type.to_string())),
        ];
        if let Some(hint) = &policy.product_hint {
            tags.push(gram_tokens(&strict(hint)));
        }
        tags.retain(|t| !t.is_empty());

        Self {
            title_norm: gram_tokens(&strict(&policy.display_name)),
            desc_norm: gram_tokens(&strict(&policy.explain_text)),
            title_loose: gram_tokens(&loose(&policy.display_name)),
            desc_loose: gram_tokens(&loose(&policy.explain_text)),
            registry_path: gram_tokens(&strict(&registry_text)),
            tags: tags.join(" "),
        }
    }
}

/// Write one policy; returns true if a localization row was written
fn upsert_one(stmts: &mut UpsertStatements<'_>, policy: &LoadedPolicy, culture: &str) -> Result<bool> {
    let policy_id: i64 = stmts
        .policy
        .query_row(
            params![
                policy.namespace,
                policy.name,
                policy.category_key,
                policy.hive.to_string(),
                policy.registry_key,
                policy.registry_value,
                policy.value_type.to_string(),
                policy.product_hint,
            ],
            |row| row.get(0),
        )
        .with_context(|| format!("Failed to upsert policy {}:{}", policy.namespace, policy.name))?;

    if policy.display_name.trim().is_empty() {
        return Ok(false);
    }

    stmts.localization.execute(params![
        policy_id,
        culture,
        policy.display_name,
        policy.explain_text,
        policy.category_path,
        policy.presentation,
    ])?;

    let existing: Option<i64> = stmts
        .find_entry
        .query_row(params![policy_id, culture], |row| row.get(0))
        .optional()?;
    if let Some(rowid) = existing {
        stmts.delete_entry.execute([rowid])?;
        stmts.delete_map.execute([rowid])?;
    }

    let entry = IndexEntry::build(policy);
    let rowid = stmts.insert_entry.insert(params![
        entry.title_norm,
        entry.desc_norm,
        entry.title_loose,
        entry.desc_loose,
        entry.registry_path,
        entry.tags,
    ])?;
    stmts.insert_map.execute(params![rowid, policy_id, culture])?;

    Ok(true)
}

/// One upsert transaction; dropping the transaction on error rolls it back
fn upsert_batch(
    conn: &mut Connection,
    policies: &[LoadedPolicy],
    culture: &str,
    cancel: &CancellationToken,
) -> Result<ApplyStats> {
    let tx = conn.transaction()?;
    let mut stats = ApplyStats::default();
    {
        let mut stmts = UpsertStatements::prepare(&tx)?;
        for policy in policies {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled.into());
            }
            stats.policies += 1;
            if upsert_one(&mut stmts, policy, culture)? {
                stats.localized += 1;
            } else {
                stats.skipped_unnamed += 1;
            }
        }
    }
    tx.commit()?;
    Ok(stats)
}
