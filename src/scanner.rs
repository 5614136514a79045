//! Scan orchestration
//!
//! Decides, per requested culture, whether the store needs a global rebuild,
//! a rebuild of that culture, a purge, or nothing at all, and drives the
//! loader and the apply engine accordingly.
//!
//! Rules:
//! - A changed (or never recorded) source root means a global rebuild. The
//!   culture list is then extended with every culture already in the store,
//!   and the first culture that reaches the reparse step performs the wipe.
//!   Signatures are not consulted while that rebuild is pending or done.
//! - A culture without a localization directory (or with no localization
//!   files in it) is purged; nothing from another culture is stored in its
//!   place.
//! - Otherwise a matching content signature skips the culture.
//! - A signature is stored only after its culture was applied.
//!
//! Failures of one culture are recorded in the report and do not stop the
//! loop. Cancellation does.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::apply::{ApplyEngine, ApplyOutcome};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::file_usage::{FileKind, FileUsageTracker};
use crate::loader::{DefinitionLoader, LoadRequest, PolicyBundle};
use crate::maintenance::{MaintenanceReport, MaintenanceScheduler};
use crate::meta::MetaStore;
use crate::models::dedupe_cultures;
use crate::signature::{SourceFilter, SourceSet};
use crate::store::Store;
use crate::writer_gate::WriterGate;

/// What happened to one culture during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CultureOutcome {
    Reparsed {
        policies: usize,
        localized: usize,
        skipped_unnamed: usize,
        failed_files: usize,
    },
    /// Content signature matched; only file timestamps were refreshed
    Unchanged,
    /// No localization source; the culture's rows were removed
    Purged { removed: usize },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CultureReport {
    pub culture: String,
    #[serde(flatten)]
    pub outcome: CultureOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub root: Option<PathBuf>,
    /// False if the source root did not exist
    pub scanned: bool,
    pub global_rebuild: bool,
    pub cultures: Vec<CultureReport>,
    pub maintenance: Option<MaintenanceReport>,
}

impl ScanReport {
    pub fn outcome(&self, culture: &str) -> Option<&CultureOutcome> {
        self.cultures
            .iter()
            .find(|c| c.culture == culture)
            .map(|c| &c.outcome)
    }
}

pub struct ScanOrchestrator {
    store: Store,
    meta: MetaStore,
    usage: FileUsageTracker,
    engine: ApplyEngine,
    loader: Arc<dyn DefinitionLoader>,
    maintenance: Option<MaintenanceScheduler>,
    filter: SourceFilter,
    localization_extension: String,
    max_policies: Option<usize>,
}

impl ScanOrchestrator {
    pub fn new(
        config: &CacheConfig,
        store: Store,
        gate: Arc<dyn WriterGate>,
        loader: Arc<dyn DefinitionLoader>,
    ) -> Result<Self> {
        let maintenance = config
            .maintenance_enabled
            .then(|| MaintenanceScheduler::new(store.clone(), gate.clone(), config));

        Ok(Self {
            meta: MetaStore::new(store.clone()),
            usage: FileUsageTracker::new(store.clone()),
            engine: ApplyEngine::new(store.clone(), gate, config.batch_size),
            store,
            loader,
            maintenance,
            filter: SourceFilter::from_config(config)?,
            localization_extension: config.localization_extension.clone(),
            max_policies: config.max_policies,
        })
    }

    /// Bring the store in line with `root` for the requested cultures
    pub async fn scan(
        &self,
        root: &Path,
        cultures: &[String],
        cancel: &CancellationToken,
    ) -> Result<ScanReport> {
        let mut report = ScanReport {
            root: Some(root.to_path_buf()),
            ..ScanReport::default()
        };

        if !root.is_dir() {
            log::info!("Source root {} does not exist, nothing to scan", root.display());
            return Ok(report);
        }
        report.scanned = true;

        let needs_global = self.meta.needs_global_rebuild(root);
        let mut effective = dedupe_cultures(cultures);
        if needs_global {
            match self.store.cultures() {
                Ok(existing) => {
                    for culture in existing {
                        if !effective.contains(&culture) {
                            effective.push(culture);
                        }
                    }
                }
                Err(e) => log::warn!("Could not list cached cultures: {:#}", e),
            }
        }
        log::info!(
            "Scanning {} for {:?}{}",
            root.display(),
            effective,
            if needs_global { " (global rebuild)" } else { "" }
        );

        let mut global_pending = needs_global;
        for culture in &effective {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled.into());
            }

            let outcome = match self.scan_culture(root, culture, global_pending, cancel).await {
                Ok(outcome) => outcome,
                Err(e) if CacheError::is_cancelled(&e) => return Err(e),
                Err(e) => {
                    log::warn!("Scan of {} failed: {:#}", culture, e);
                    CultureOutcome::Failed {
                        error: format!("{:#}", e),
                    }
                }
            };

            if global_pending && matches!(outcome, CultureOutcome::Reparsed { .. }) {
                global_pending = false;
            }
            log::debug!("{}: {:?}", culture, outcome);
            report.cultures.push(CultureReport {
                culture: culture.clone(),
                outcome,
            });
        }

        if needs_global {
            let rebuilt = if global_pending {
                // No culture reparsed; drop everything the previous root left behind
                matches!(self.engine.purge_all().await, Ok(ApplyOutcome::Applied(_)))
            } else {
                true
            };

            if rebuilt {
                report.global_rebuild = true;
                if let Err(e) = self.meta.set_source_root(root) {
                    log::warn!("Failed to record source root: {:#}", e);
                }
            }
        }

        if let Some(maintenance) = &self.maintenance {
            report.maintenance = Some(maintenance.run().await);
        }

        Ok(report)
    }

    async fn scan_culture(
        &self,
        root: &Path,
        culture: &str,
        global_pending: bool,
        cancel: &CancellationToken,
    ) -> Result<CultureOutcome> {
        let sources = SourceSet::discover(root, culture, &self.filter)?;

        if sources.has_no_localizations() {
            return self.purge_culture(culture, global_pending).await;
        }

        let signature = sources.signature(&self.filter)?;
        if !global_pending {
            let stored = self.meta.signature(culture).unwrap_or_else(|e| {
                log::warn!("Failed to read signature for {}: {:#}", culture, e);
                None
            });
            if stored.as_deref() == Some(signature.as_str()) {
                log::debug!("{} unchanged, skipping reparse", culture);
                self.touch_sources(&sources.definitions, &sources.localizations);
                return Ok(CultureOutcome::Unchanged);
            }
        }

        let bundle = self.load(root, culture, &sources).await?;
        self.touch_sources(&bundle.definition_files, &bundle.localization_files);

        match self.engine.apply(&bundle, global_pending, cancel).await? {
            ApplyOutcome::Applied(stats) => {
                if let Err(e) = self.meta.set_signature(culture, &signature) {
                    log::warn!("Failed to store signature for {}: {:#}", culture, e);
                }
                Ok(CultureOutcome::Reparsed {
                    policies: stats.policies,
                    localized: stats.localized,
                    skipped_unnamed: stats.skipped_unnamed,
                    failed_files: bundle.failed_files,
                })
            }
            ApplyOutcome::WriterBusy => Ok(CultureOutcome::Skipped {
                reason: "writer gate busy".to_string(),
            }),
        }
    }

    async fn purge_culture(&self, culture: &str, global_pending: bool) -> Result<CultureOutcome> {
        if let Err(e) = self.meta.delete_signature(culture) {
            log::warn!("Failed to delete signature for {}: {:#}", culture, e);
        }

        if global_pending {
            // The pending wipe removes this culture's rows anyway
            return Ok(CultureOutcome::Purged { removed: 0 });
        }

        log::info!("No localization files for {}, purging its rows", culture);
        match self.engine.purge_culture(culture).await? {
            ApplyOutcome::Applied(stats) => Ok(CultureOutcome::Purged {
                removed: stats.removed,
            }),
            ApplyOutcome::WriterBusy => Ok(CultureOutcome::Skipped {
                reason: "writer gate busy".to_string(),
            }),
        }
    }

    /// Run the loader off the async executor
    async fn load(&self, root: &Path, culture: &str, sources: &SourceSet) -> Result<PolicyBundle> {
        let request = LoadRequest {
            root: root.to_path_buf(),
            culture: culture.to_string(),
            definition_files: sources.definitions.clone(),
            localization_dir: sources.culture_dir.clone(),
            localization_extension: self.localization_extension.clone(),
            resolve_fallback: false,
            max_policies: self.max_policies,
        };

        let loader = Arc::clone(&self.loader);
        tokio::task::spawn_blocking(move || loader.load(&request))
            .await
            .context("Definition loader panicked")?
            .with_context(|| format!("Failed to load definitions for {}", culture))
    }

    /// Refresh usage timestamps; failures are only logged
    fn touch_sources(&self, definitions: &[PathBuf], localizations: &[PathBuf]) {
        if let Err(e) = self.usage.touch(definitions, FileKind::Definition) {
            log::warn!("Failed to record definition file usage: {:#}", e);
        }
        if let Err(e) = self.usage.touch(localizations, FileKind::Localization) {
            log::warn!("Failed to record localization file usage: {:#}", e);
        }
    }
}
