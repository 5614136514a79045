//! Policy cache facade
//!
//! `PolicyCache` wires the store, writer gate, scanner and search engine
//! together and exposes the operations the host application calls:
//!
//! ```text
//! initialize -> set_source_root -> scan_and_update -> search / get_by_*
//! ```
//!
//! Reads never touch the writer gate. Searches and lookups degrade to empty
//! results on store errors; only invalid arguments and cancellation reach
//! the caller as errors.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::file_usage::FileUsageTracker;
use crate::loader::{DefinitionLoader, JsonDefinitionLoader};
use crate::maintenance::MaintenanceScheduler;
use crate::models::{Hit, PolicyDetail};
use crate::scanner::{ScanOrchestrator, ScanReport};
use crate::search::{SearchEngine, SearchFields, SearchRequest};
use crate::store::{CheckpointMode, Store, StoreStats};
use crate::writer_gate::{gate_for, WriterGate};

pub struct PolicyCache {
    config: CacheConfig,
    store: Store,
    usage: FileUsageTracker,
    search: SearchEngine,
    scanner: ScanOrchestrator,
    maintenance: MaintenanceScheduler,
    source_root: RwLock<Option<PathBuf>>,
    initialized: AtomicBool,
}

impl PolicyCache {
    /// Cache using the JSON definition loader and the gate the config asks for
    pub fn new(config: CacheConfig) -> Result<Self> {
        let gate = gate_for(&config);
        Self::with_parts(config, gate, Arc::new(JsonDefinitionLoader::new()))
    }

    /// Cache with an explicit writer gate and definition loader
    pub fn with_parts(
        config: CacheConfig,
        gate: Arc<dyn WriterGate>,
        loader: Arc<dyn DefinitionLoader>,
    ) -> Result<Self> {
        let store = Store::new(config.db_path(), config.busy_timeout());
        let scanner = ScanOrchestrator::new(&config, store.clone(), gate.clone(), loader)?;

        Ok(Self {
            usage: FileUsageTracker::new(store.clone()),
            search: SearchEngine::new(store.clone()),
            maintenance: MaintenanceScheduler::new(store.clone(), gate, &config),
            scanner,
            store,
            config,
            source_root: RwLock::new(None),
            initialized: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Create the schema if needed and flush any WAL left by a previous run
    ///
    /// The only operation that surfaces store corruption.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled.into());
        }

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let reset = store.ensure_schema()?;
            if reset {
                log::info!("Cache schema was rebuilt; the next scan reindexes everything");
            }
            store.checkpoint(CheckpointMode::Truncate)?;
            store.validate()
        })
        .await
        .context("Cache initialization panicked")?
        .context("Failed to initialize policy cache")?;

        self.initialized.store(true, Ordering::SeqCst);
        log::info!("Policy cache ready at {}", self.store.path().display());
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Directory future scans read from
    pub fn set_source_root(&self, path: impl AsRef<Path>) {
        let mut root = self.source_root.write().unwrap_or_else(|e| e.into_inner());
        *root = Some(path.as_ref().to_path_buf());
    }

    pub fn source_root(&self) -> Option<PathBuf> {
        self.source_root
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Rescan the source root for `cultures`
    pub async fn scan_and_update(
        &self,
        cultures: &[String],
        cancel: &CancellationToken,
    ) -> Result<ScanReport> {
        if !self.is_initialized() {
            return Err(CacheError::NotInitialized.into());
        }
        let Some(root) = self.source_root() else {
            return Err(CacheError::InvalidArgument("no source root configured".to_string()).into());
        };
        if cultures.is_empty() {
            return Err(CacheError::InvalidArgument("at least one culture is required".to_string()).into());
        }

        self.scanner.scan(&root, cultures, cancel).await
    }

    /// Canonical search
    pub async fn search(&self, request: SearchRequest, cancel: &CancellationToken) -> Result<Vec<Hit>> {
        let engine = self.search.clone();
        let cancel = cancel.clone();
        let result = tokio::task::spawn_blocking(move || engine.search(&request, &cancel))
            .await
            .context("Search task panicked")
            .and_then(|r| r);
        degrade(result, Vec::new(), "Search")
    }

    /// Search a single culture
    pub async fn search_culture(
        &self,
        query: &str,
        culture: &str,
        fields: SearchFields,
        and_mode: bool,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Hit>> {
        let request = SearchRequest::new(query, vec![culture.to_string()])
            .fields(fields)
            .and_mode(and_mode)
            .limit(limit);
        self.search(request, cancel).await
    }

    /// Search the default fields, optionally including descriptions
    pub async fn search_with_description(
        &self,
        query: &str,
        cultures: &[String],
        include_description: bool,
        and_mode: bool,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Hit>> {
        let request = SearchRequest::new(query, cultures.to_vec())
            .fields(SearchFields::with_description(include_description))
            .and_mode(and_mode)
            .limit(limit);
        self.search(request, cancel).await
    }

    pub async fn get_by_policy_name(
        &self,
        namespace: &str,
        name: &str,
        cultures: &[String],
        cancel: &CancellationToken,
    ) -> Result<Option<PolicyDetail>> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled.into());
        }
        let engine = self.search.clone();
        let (namespace, name, cultures) = (namespace.to_string(), name.to_string(), cultures.to_vec());
        let result = tokio::task::spawn_blocking(move || engine.get_by_policy_name(&namespace, &name, &cultures))
            .await
            .context("Lookup task panicked")
            .and_then(|r| r);
        degrade(result, None, "Policy lookup")
    }

    pub async fn get_by_policy_name_in(
        &self,
        namespace: &str,
        name: &str,
        culture: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<PolicyDetail>> {
        self.get_by_policy_name(namespace, name, &[culture.to_string()], cancel)
            .await
    }

    pub async fn get_by_registry_path(
        &self,
        path: &str,
        cultures: &[String],
        cancel: &CancellationToken,
    ) -> Result<Option<PolicyDetail>> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled.into());
        }
        let engine = self.search.clone();
        let (path, cultures) = (path.to_string(), cultures.to_vec());
        let result = tokio::task::spawn_blocking(move || engine.get_by_registry_path(&path, &cultures))
            .await
            .context("Lookup task panicked")
            .and_then(|r| r);
        degrade(result, None, "Registry lookup")
    }

    pub async fn get_by_registry_path_in(
        &self,
        path: &str,
        culture: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<PolicyDetail>> {
        self.get_by_registry_path(path, &[culture.to_string()], cancel)
            .await
    }

    /// Drop usage rows not touched within `older_than`; returns the number removed
    pub async fn purge_stale_cache_entries(
        &self,
        older_than: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled.into());
        }
        let usage = self.usage.clone();
        let result = tokio::task::spawn_blocking(move || usage.purge(older_than))
            .await
            .context("Purge task panicked")
            .and_then(|r| r);
        degrade(result, 0, "Usage purge")
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    /// Full vacuum under the writer gate; `Ok(false)` if the gate was busy
    pub async fn compact(&self) -> Result<bool> {
        self.maintenance.compact().await
    }
}

/// Swallow store errors into `fallback`, keeping caller mistakes and cancellation
fn degrade<T>(result: Result<T>, fallback: T, what: &str) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(e) if CacheError::is_invalid_argument(&e) || CacheError::is_cancelled(&e) => Err(e),
        Err(e) => {
            log::warn!("{} failed, returning no results: {:#}", what, e);
            Ok(fallback)
        }
    }
}
