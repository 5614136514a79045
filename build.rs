//! Build-time schema hash computation for automatic cache invalidation
//!
//! Hashes every source file that determines the on-disk layout of the cache
//! (table definitions, token encoding, row writing). The digest is exported as
//! `CACHE_SCHEMA_HASH`; `Store::ensure_schema` compares it with the value
//! recorded in the `meta` table and recreates the tables on mismatch.
//!
//! ## Cache-critical files:
//! - src/store.rs: table and index definitions
//! - src/normalize.rs: strict/loose normalization and n-gram token encoding
//! - src/apply.rs: how policy, localization and search rows are written

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

const CACHE_CRITICAL_FILES: &[&str] = &["src/store.rs", "src/normalize.rs", "src/apply.rs"];

fn main() {
    let schema_hash = compute_schema_hash();

    println!("cargo:rustc-env=CACHE_SCHEMA_HASH={}", schema_hash);

    for file in CACHE_CRITICAL_FILES {
        println!("cargo:rerun-if-changed={}", file);
    }
}

/// Deterministic hash of all cache-critical source files, sorted by path
fn compute_schema_hash() -> String {
    let mut hasher = blake3::Hasher::new();

    let files: BTreeSet<&str> = CACHE_CRITICAL_FILES.iter().copied().collect();

    for file_path in &files {
        let path = Path::new(file_path);

        if !path.exists() {
            panic!("Cache-critical file not found: {}", file_path);
        }

        let content = fs::read(path).unwrap_or_else(|e| panic!("Failed to read {}: {}", file_path, e));

        hasher.update(file_path.as_bytes());
        hasher.update(&content);
    }

    // 64 bits is plenty to detect a layout change
    let hash = hasher.finalize();
    hash.as_bytes()[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
}
