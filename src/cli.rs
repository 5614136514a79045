//! CLI argument parsing and command handlers

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::cache::PolicyCache;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::models::{Hit, PolicyDetail};
use crate::output;
use crate::scanner::{CultureOutcome, ScanReport};
use crate::search::{SearchFields, SearchRequest};

/// polcache: searchable cache of Windows policy definitions
#[derive(Parser, Debug)]
#[command(
    name = "polcache",
    version,
    about = "Index and search policy definitions across languages",
    long_about = "polcache turns a directory of policy definition files into a persisted, \
                  multi-language full-text index. Scans are incremental: cultures whose \
                  source files did not change are skipped."
)]
pub struct Cli {
    /// Enable verbose logging (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Cache directory (overrides config file and POLICY_CACHE_DIR)
    #[arg(long, value_name = "DIR", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Path to a config.toml with a [cache] table
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Bypass the cross-process writer lock
    #[arg(long, global = true)]
    pub fast: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan a definition directory and update the cache
    ///
    /// Examples:
    ///   polcache index C:\Windows\PolicyDefinitions -c en-US,de-DE
    ///   polcache index ./defs --json
    Index {
        /// Directory holding definition files and one subdirectory per culture
        #[arg(value_name = "ROOT")]
        root: PathBuf,

        /// Cultures to index, highest priority first
        #[arg(short, long, value_delimiter = ',', default_value = "en-US")]
        cultures: Vec<String>,

        /// Output format as JSON
        #[arg(long)]
        json: bool,

        /// Pretty-print JSON output (only with --json)
        #[arg(long)]
        pretty: bool,
    },

    /// Search cached policies
    ///
    /// Quote a multi-word query ("block pop") to search for it as a phrase.
    ///
    /// Examples:
    ///   polcache search "pop-up" -c de-DE,en-US
    ///   polcache search "smartscreen filter" --all --description
    Search {
        /// Search text
        query: String,

        /// Culture preference, highest priority first
        #[arg(short, long, value_delimiter = ',', default_value = "en-US")]
        cultures: Vec<String>,

        /// Fields to search: name, id, description, registry
        #[arg(short, long, value_delimiter = ',')]
        fields: Vec<String>,

        /// Also search explanation text (same as adding 'description' to --fields)
        #[arg(short, long)]
        description: bool,

        /// Require every word to match
        #[arg(short, long)]
        all: bool,

        /// Maximum number of results
        #[arg(short, long, default_value = "25")]
        limit: usize,

        /// Output format as JSON
        #[arg(long)]
        json: bool,

        /// Pretty-print JSON output (only with --json)
        #[arg(long)]
        pretty: bool,
    },

    /// Show one policy by `namespace:name` or bare name
    Show {
        /// Policy identifier
        id: String,

        /// Culture preference, highest priority first
        #[arg(short, long, value_delimiter = ',', default_value = "en-US")]
        cultures: Vec<String>,

        /// Output format as JSON
        #[arg(long)]
        json: bool,

        /// Pretty-print JSON output (only with --json)
        #[arg(long)]
        pretty: bool,
    },

    /// Show the policy that writes a registry key or value
    Reg {
        /// Registry path, e.g. HKLM\Software\Policies\Contoso\Browser\BlockPopups
        path: String,

        /// Culture preference, highest priority first
        #[arg(short, long, value_delimiter = ',', default_value = "en-US")]
        cultures: Vec<String>,

        /// Output format as JSON
        #[arg(long)]
        json: bool,

        /// Pretty-print JSON output (only with --json)
        #[arg(long)]
        pretty: bool,
    },

    /// Forget source files not scanned within the given number of days
    Purge {
        /// Age threshold in days
        #[arg(long, default_value = "30")]
        older_than_days: u64,

        /// Output format as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show cache statistics
    Stats {
        /// Output format as JSON
        #[arg(long)]
        json: bool,

        /// Pretty-print JSON output (only with --json)
        #[arg(long)]
        pretty: bool,
    },

    /// Vacuum the cache database and reclaim disk space
    Compact,

    /// Delete the cache database
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> Result<()> {
        // Setup logging based on verbosity
        let log_level = match self.verbose {
            0 => "warn",  // Default: only warnings and errors
            1 => "info",  // -v: show info messages
            2 => "debug", // -vv: show debug messages
            _ => "trace", // -vvv: show trace messages
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
            .init();

        let config = self.resolve_config()?;
        let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;

        runtime.block_on(async move {
            match self.command {
                Command::Index { root, cultures, json, pretty } => {
                    handle_index(config, &root, &cultures, json, pretty).await
                }
                Command::Search { query, cultures, fields, description, all, limit, json, pretty } => {
                    handle_search(config, query, cultures, &fields, description, all, limit, json, pretty)
                        .await
                }
                Command::Show { id, cultures, json, pretty } => {
                    handle_show(config, &id, &cultures, json, pretty).await
                }
                Command::Reg { path, cultures, json, pretty } => {
                    handle_reg(config, &path, &cultures, json, pretty).await
                }
                Command::Purge { older_than_days, json } => {
                    handle_purge(config, older_than_days, json).await
                }
                Command::Stats { json, pretty } => handle_stats(config, json, pretty).await,
                Command::Compact => handle_compact(config).await,
                Command::Clear { yes } => handle_clear(config, yes),
            }
        })
    }

    fn resolve_config(&self) -> Result<CacheConfig> {
        let mut config = match &self.config {
            Some(path) => CacheConfig::load(path)?,
            None => CacheConfig::from_env()?,
        };
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        if self.fast {
            config.fast_mode = true;
        }
        log::debug!("Using cache directory {}", config.cache_dir.display());
        Ok(config)
    }
}

/// Map `--fields` names onto search flags; empty means the defaults
/// Process exit status for a failed command
///
/// `2` for bad arguments, `75` when another process holds the writer gate,
/// `130` after Ctrl+C, `1` for everything else.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    let kind = err.chain().find_map(|cause| cause.downcast_ref::<CacheError>());
    match kind {
        Some(CacheError::InvalidArgument(_)) => 2,
        Some(CacheError::WriterBusy) => 75,
        Some(CacheError::Cancelled) => 130,
        _ => 1,
    }
}

pub fn parse_fields(names: &[String], description: bool) -> Result<SearchFields> {
    let mut fields = if names.is_empty() {
        SearchFields::default()
    } else {
        SearchFields::empty()
    };
    for name in names {
        fields |= match name.trim().to_lowercase().as_str() {
            "name" | "title" => SearchFields::NAME,
            "id" => SearchFields::ID,
            "description" | "desc" => SearchFields::DESCRIPTION,
            "registry" | "reg" => SearchFields::REGISTRY,
            other => anyhow::bail!(
                "Unknown search field '{}'. Supported: name, id, description, registry",
                other
            ),
        };
    }
    if description {
        fields |= SearchFields::DESCRIPTION;
    }
    Ok(fields)
}

async fn open_cache(config: CacheConfig) -> Result<PolicyCache> {
    let cache = PolicyCache::new(config)?;
    cache.initialize(&CancellationToken::new()).await?;
    Ok(cache)
}

/// Existing cache only; read commands never create one
async fn open_existing(config: CacheConfig) -> Result<PolicyCache> {
    if !config.db_path().exists() {
        anyhow::bail!(
            "No policy cache found at {}.\n\
             \n\
             Run 'polcache index <ROOT>' to build it first.",
            config.cache_dir.display()
        );
    }
    open_cache(config).await
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", text);
    Ok(())
}

/// Cancel the token on Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, cancelling");
            token.cancel();
        }
    });
    cancel
}

async fn handle_index(
    config: CacheConfig,
    root: &Path,
    cultures: &[String],
    as_json: bool,
    pretty_json: bool,
) -> Result<()> {
    let cache = open_cache(config).await?;
    cache.set_source_root(root);

    let started = Instant::now();
    let report = cache.scan_and_update(cultures, &cancel_on_ctrl_c()).await?;

    if as_json {
        return print_json(&report, pretty_json);
    }

    if !report.scanned {
        output::warn(&format!("Source root {} does not exist; nothing indexed.", root.display()));
        return Ok(());
    }
    print_scan_summary(&report, started.elapsed());
    Ok(())
}

fn print_scan_summary(report: &ScanReport, elapsed: Duration) {
    if report.global_rebuild {
        println!("Rebuilt cache for new source root");
    }
    for culture in &report.cultures {
        let line = match &culture.outcome {
            CultureOutcome::Reparsed { policies, localized, skipped_unnamed, failed_files } => {
                let mut line = format!("indexed {} policies ({} localized", policies, localized);
                if *skipped_unnamed > 0 {
                    line.push_str(&format!(", {} without a name", skipped_unnamed));
                }
                line.push(')');
                if *failed_files > 0 {
                    line.push_str(&format!(", {} file(s) skipped", failed_files));
                }
                line
            }
            CultureOutcome::Unchanged => "unchanged".to_string(),
            CultureOutcome::Purged { removed } => format!("no localization files, removed {} entries", removed),
            CultureOutcome::Skipped { reason } => format!("skipped: {}", reason),
            CultureOutcome::Failed { error } => format!("failed: {}", error),
        };
        println!("  {:<10} {}", culture.culture, line);
    }
    println!("Done in {:.2?}", elapsed);
}

#[allow(clippy::too_many_arguments)]
async fn handle_search(
    config: CacheConfig,
    query: String,
    cultures: Vec<String>,
    field_names: &[String],
    description: bool,
    and_mode: bool,
    limit: usize,
    as_json: bool,
    pretty_json: bool,
) -> Result<()> {
    let fields = parse_fields(field_names, description)?;
    let cache = open_existing(config).await?;
    let request = SearchRequest::new(query, cultures)
        .fields(fields)
        .and_mode(and_mode)
        .limit(limit);

    let started = Instant::now();
    let hits = cache.search(request, &cancel_on_ctrl_c()).await?;
    log::info!("Search took {:.2?}", started.elapsed());

    if as_json {
        return print_json(&hits, pretty_json);
    }

    if hits.is_empty() {
        output::info("No matching policies.");
        return Ok(());
    }
    for hit in &hits {
        print_hit(hit);
    }
    Ok(())
}

fn print_hit(hit: &Hit) {
    println!("{:>7.1}  {}  [{}]", hit.score, hit.display_name, hit.culture);
    println!("         {}", hit.unique_id);
    println!("         {} ({})", hit.registry_path, hit.value_type);
}

async fn handle_show(
    config: CacheConfig,
    id: &str,
    cultures: &[String],
    as_json: bool,
    pretty_json: bool,
) -> Result<()> {
    let cache = open_existing(config).await?;
    let (namespace, name) = match id.split_once(':') {
        Some((ns, name)) => (ns, name),
        None => ("", id),
    };

    let detail = cache
        .get_by_policy_name(namespace, name, cultures, &CancellationToken::new())
        .await?;
    print_detail(detail, &format!("No policy named '{}'", id), as_json, pretty_json)
}

async fn handle_reg(
    config: CacheConfig,
    path: &str,
    cultures: &[String],
    as_json: bool,
    pretty_json: bool,
) -> Result<()> {
    let cache = open_existing(config).await?;
    let detail = cache
        .get_by_registry_path(path, cultures, &CancellationToken::new())
        .await?;
    print_detail(detail, &format!("No policy writes '{}'", path), as_json, pretty_json)
}

fn print_detail(detail: Option<PolicyDetail>, missing: &str, as_json: bool, pretty_json: bool) -> Result<()> {
    if as_json {
        return print_json(&detail, pretty_json);
    }

    let Some(detail) = detail else {
        output::info(missing);
        return Ok(());
    };

    println!("{}", detail.display_name);
    println!("{}", "=".repeat(detail.display_name.chars().count().max(3)));
    println!("Id:        {}", detail.unique_id);
    println!("Culture:   {}", detail.culture);
    println!("Category:  {}", detail.category_path);
    println!("Hive:      {}", detail.hive);
    println!("Key:       {}", detail.registry_key);
    if let Some(value) = &detail.registry_value {
        println!("Value:     {}", value);
    }
    println!("Type:      {}", detail.value_type);
    if let Some(hint) = &detail.product_hint {
        println!("Supported: {}", hint);
    }
    if !detail.explain_text.is_empty() {
        println!();
        println!("{}", detail.explain_text);
    }
    Ok(())
}

async fn handle_purge(config: CacheConfig, older_than_days: u64, as_json: bool) -> Result<()> {
    let cache = open_existing(config).await?;
    let age = Duration::from_secs(older_than_days.saturating_mul(24 * 60 * 60));
    let removed = cache
        .purge_stale_cache_entries(age, &CancellationToken::new())
        .await?;

    if as_json {
        return print_json(&serde_json::json!({ "removed": removed }), false);
    }
    println!("Removed {} stale file usage entr{}", removed, if removed == 1 { "y" } else { "ies" });
    Ok(())
}

async fn handle_stats(config: CacheConfig, as_json: bool, pretty_json: bool) -> Result<()> {
    let cache = open_existing(config).await?;
    let stats = cache.stats()?;

    if as_json {
        return print_json(&stats, pretty_json);
    }

    println!("Policy Cache Statistics");
    println!("=======================");
    println!("Location:       {}", cache.store().path().display());
    println!("Policies:       {}", stats.policies);
    println!("Localizations:  {}", stats.localizations);
    println!("Index entries:  {}", stats.index_entries);
    println!("Tracked files:  {}", stats.tracked_files);
    for (culture, count) in &stats.localizations_by_culture {
        println!("  {:<12} {}", culture, count);
    }
    println!(
        "Size:           {:.2} MB ({} pages, {} free)",
        stats.size_bytes as f64 / (1024.0 * 1024.0),
        stats.page_count,
        stats.freelist_count
    );
    Ok(())
}

async fn handle_compact(config: CacheConfig) -> Result<()> {
    let cache = open_existing(config).await?;
    let before = cache.stats()?.size_bytes;

    if !cache.compact().await? {
        output::warn("Another process is writing to the cache; try again later.");
        return Ok(());
    }

    let after = cache.stats()?.size_bytes;
    println!(
        "Compacted cache: {:.2} MB -> {:.2} MB",
        before as f64 / (1024.0 * 1024.0),
        after as f64 / (1024.0 * 1024.0)
    );
    Ok(())
}

fn handle_clear(config: CacheConfig, skip_confirm: bool) -> Result<()> {
    let cache = PolicyCache::new(config)?;

    if !cache.store().exists() {
        println!("No cache to clear.");
        return Ok(());
    }

    if !skip_confirm {
        println!("This will delete the policy cache at: {:?}", cache.store().path());
        print!("Are you sure? [y/N] ");
        use std::io::{self, Write};
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    cache.store().clear()?;
    println!("Cache cleared successfully.");

    Ok(())
}
