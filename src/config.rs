//! Runtime configuration for the policy cache
//!
//! Configuration is resolved in three layers: built-in defaults, an optional
//! `config.toml` (`[cache]` table), then `POLICY_CACHE_*` environment
//! variables. The resulting `CacheConfig` is passed explicitly to every
//! component; nothing reads the environment after construction.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable names
pub const ENV_CACHE_DIR: &str = "POLICY_CACHE_DIR";
pub const ENV_FAST_MODE: &str = "POLICY_CACHE_FAST_MODE";
pub const ENV_MAX_POLICIES: &str = "POLICY_CACHE_MAX_POLICIES";
pub const ENV_FILES: &str = "POLICY_CACHE_FILES";
pub const ENV_DISABLE_MAINTENANCE: &str = "POLICY_CACHE_DISABLE_MAINTENANCE";

/// Default cache directory name (under the platform cache dir)
pub const CACHE_DIR_NAME: &str = "policy-cache";

/// Writer gate retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WriterLockConfig {
    /// How long a single attempt polls for the lock
    pub timeout_ms: u64,
    /// Number of attempts before giving up
    pub attempts: u32,
    /// Delay between attempts
    pub backoff_ms: u64,
}

impl Default for WriterLockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            attempts: 3,
            backoff_ms: 250,
        }
    }
}

impl WriterLockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Configuration for scanning, writing and maintaining the cache
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding `policies.db` and `writer.lock`
    pub cache_dir: PathBuf,
    /// Bypass the cross-process writer lock (single-writer test/fast mode)
    pub fast_mode: bool,
    /// Cap on policies taken from each loaded bundle (testing)
    pub max_policies: Option<usize>,
    /// Glob patterns restricting which definition files are scanned (empty = all)
    pub file_allow_list: Vec<String>,
    /// Run the maintenance scheduler after scans
    pub maintenance_enabled: bool,
    /// Policies per upsert transaction
    pub batch_size: usize,
    /// Extension of definition files in the source root
    pub definition_extension: String,
    /// Extension of localization files in `<root>/<culture>/`
    pub localization_extension: String,
    pub writer_lock: WriterLockConfig,
    /// Page count above which full maintenance runs
    pub maintenance_min_pages: u64,
    /// Upper bound on the share of the database reclaimed per maintenance run
    pub max_compaction_ratio: f64,
    /// SQLite busy timeout for every connection
    pub busy_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            fast_mode: false,
            max_policies: None,
            file_allow_list: Vec::new(),
            maintenance_enabled: true,
            batch_size: 500,
            definition_extension: "admx".to_string(),
            localization_extension: "adml".to_string(),
            writer_lock: WriterLockConfig::default(),
            maintenance_min_pages: 4096,
            max_compaction_ratio: 0.25,
            busy_timeout_ms: 5000,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    match dirs::cache_dir() {
        Some(dir) => dir.join(CACHE_DIR_NAME),
        None => PathBuf::from(".").join(format!(".{}", CACHE_DIR_NAME)),
    }
}

/// Top-level layout of config.toml
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    cache: Option<CacheConfig>,
}

impl CacheConfig {
    /// Defaults pointed at a specific cache directory
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Load `[cache]` from a TOML file, then apply environment overrides
    ///
    /// A missing file is not an error; defaults are used.
    pub fn load(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            let text = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            Self::from_toml_str(&text)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            log::debug!("No config file at {}, using defaults", config_path.display());
            Self::default()
        };

        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Parse the `[cache]` table of a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(text).context("Invalid TOML")?;
        Ok(file.cache.unwrap_or_default())
    }

    /// Apply `POLICY_CACHE_*` overrides from a key/value iterator
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let value = value.as_ref().trim();
            match key.as_ref() {
                ENV_CACHE_DIR if !value.is_empty() => {
                    self.cache_dir = PathBuf::from(value);
                }
                ENV_FAST_MODE => {
                    self.fast_mode = is_truthy(value);
                }
                ENV_MAX_POLICIES => {
                    self.max_policies = if value.is_empty() {
                        None
                    } else {
                        let cap: usize = value
                            .parse()
                            .with_context(|| format!("{} must be a number, got '{}'", ENV_MAX_POLICIES, value))?;
                        Some(cap)
                    };
                }
                ENV_FILES => {
                    self.file_allow_list = value
                        .split([';', ','])
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                ENV_DISABLE_MAINTENANCE => {
                    self.maintenance_enabled = !is_truthy(value);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Path of the SQLite database
    pub fn db_path(&self) -> PathBuf {
        self.cache_dir.join(crate::store::DB_FILE)
    }

    /// Path of the writer lock file
    pub fn lock_path(&self) -> PathBuf {
        self.cache_dir.join(crate::writer_gate::LOCK_FILE)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
