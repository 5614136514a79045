//! policy-cache: persisted, multi-language search index for policy definitions
//!
//! Turns a directory of policy definition files (one definition file per
//! product, one localization file per product and culture) into a SQLite
//! store with a contentless FTS5 index, and keeps it consistent with the
//! source files across rescans and across processes.
//!
//! # Architecture
//!
//! - **Store**: schema, connections, checkpoint/vacuum primitives
//! - **WriterGate**: cross-process advisory lock around every index mutation
//! - **Scanner**: per-culture rebuild/skip/purge decisions from content signatures
//! - **Apply**: transactional delete + batched upsert of one culture's bundle
//! - **Search**: ranked n-gram search with culture fallback
//! - **Maintenance**: opportunistic optimize, checkpoint and compaction
//!
//! # Example Usage
//!
//! ```no_run
//! use policy_cache::{CacheConfig, PolicyCache, SearchRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let cache = PolicyCache::new(CacheConfig::from_env()?)?;
//! let cancel = CancellationToken::new();
//! cache.initialize(&cancel).await?;
//! cache.set_source_root("C:/Windows/PolicyDefinitions");
//! cache.scan_and_update(&["en-US".to_string()], &cancel).await?;
//!
//! let hits = cache
//!     .search(SearchRequest::new("pop-up", vec!["en-US".to_string()]), &cancel)
//!     .await?;
//! println!("{} hits", hits.len());
//! # Ok(())
//! # }
//! ```

pub mod apply;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod file_usage;
pub mod loader;
pub mod maintenance;
pub mod meta;
pub mod models;
pub mod normalize;
pub mod output;
pub mod scanner;
pub mod search;
pub mod signature;
pub mod store;
pub mod writer_gate;

// Re-export commonly used types
pub use cache::PolicyCache;
pub use config::CacheConfig;
pub use error::CacheError;
pub use loader::{DefinitionLoader, JsonDefinitionLoader, LoadRequest, LoadedPolicy, PolicyBundle};
pub use models::{Hit, PolicyDetail, RegistryHive, ValueType};
pub use scanner::{CultureOutcome, ScanReport};
pub use search::{SearchFields, SearchRequest};
pub use writer_gate::{FileWriterGate, NoopWriterGate, WriterGate};
