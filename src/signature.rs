//! Source file discovery and content signatures
//!
//! A source root holds definition files at the top level and one
//! subdirectory per culture holding localization files named after the
//! definitions (`root/Contoso.admx`, `root/en-US/Contoso.adml`).
//!
//! The content signature of a culture is a blake3 hash over the name, size and
//! last-write time of every relevant file. Contents are never read, so an
//! unchanged scan costs one directory listing per culture.

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use crate::config::CacheConfig;
use crate::meta::normalize_root;

/// Which files under a source root take part in a scan
#[derive(Debug, Clone)]
pub struct SourceFilter {
    definition_extension: String,
    localization_extension: String,
    allow_list: Option<GlobSet>,
    max_policies: Option<usize>,
}

impl SourceFilter {
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        let allow_list = if config.file_allow_list.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in &config.file_allow_list {
                let glob = GlobBuilder::new(pattern)
                    .case_insensitive(true)
                    .literal_separator(true)
                    .build()
                    .with_context(|| format!("Invalid file allow-list pattern '{}'", pattern))?;
                builder.add(glob);
            }
            Some(builder.build().context("Failed to build file allow-list")?)
        };

        Ok(Self {
            definition_extension: config.definition_extension.trim_start_matches('.').to_string(),
            localization_extension: config
                .localization_extension
                .trim_start_matches('.')
                .to_string(),
            allow_list,
            max_policies: config.max_policies,
        })
    }

    pub fn is_restricted(&self) -> bool {
        self.allow_list.is_some()
    }

    fn allows_definition(&self, path: &Path) -> bool {
        if !has_extension(path, &self.definition_extension) {
            return false;
        }
        match (&self.allow_list, path.file_name()) {
            (None, _) => true,
            (Some(set), Some(name)) => set.is_match(Path::new(name)),
            (Some(_), None) => false,
        }
    }
}

/// Files relevant to one culture of one source root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSet {
    pub root: PathBuf,
    pub culture: String,
    /// Culture subdirectory as found on disk (case may differ from `culture`)
    pub culture_dir: Option<PathBuf>,
    pub definitions: Vec<PathBuf>,
    pub localizations: Vec<PathBuf>,
}

impl SourceSet {
    /// List the definition files and the culture's matching localization files
    pub fn discover(root: &Path, culture: &str, filter: &SourceFilter) -> Result<Self> {
        let definitions = definition_files(root, filter)?;
        let culture_dir = find_culture_dir(root, culture);

        let localizations = match &culture_dir {
            Some(dir) => {
                let wanted: Option<HashSet<String>> = if filter.is_restricted() {
                    Some(definitions.iter().filter_map(|p| file_stem_lower(p)).collect())
                } else {
                    None
                };
                localization_files(dir, &filter.localization_extension, wanted.as_ref())?
            }
            None => Vec::new(),
        };

        Ok(Self {
            root: root.to_path_buf(),
            culture: culture.to_string(),
            culture_dir,
            definitions,
            localizations,
        })
    }

    /// True if the culture has nothing to index
    pub fn has_no_localizations(&self) -> bool {
        self.localizations.is_empty()
    }

    /// Content signature over file metadata plus the scan parameters
    pub fn signature(&self, filter: &SourceFilter) -> Result<String> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(normalize_root(&self.root).to_lowercase().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.culture.as_bytes());
        hasher.update(b"\0");
        hasher.update(format!("{:?}", filter.max_policies).as_bytes());
        hasher.update(b"\0");

        hash_files(&mut hasher, b"D", &self.definitions)?;
        hash_files(&mut hasher, b"L", &self.localizations)?;

        Ok(hasher.finalize().to_hex().to_string())
    }
}

fn hash_files(hasher: &mut blake3::Hasher, tag: &[u8], files: &[PathBuf]) -> Result<()> {
    let mut entries = Vec::with_capacity(files.len());
    for path in files {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        entries.push((name, metadata.len(), modified));
    }
    entries.sort();

    for (name, len, modified) in entries {
        hasher.update(tag);
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
        hasher.update(&len.to_le_bytes());
        hasher.update(&modified.to_le_bytes());
    }
    Ok(())
}

/// Definition files directly under `root`, sorted by path
pub fn definition_files(root: &Path, filter: &SourceFilter) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to list {}", root.display()))?;
        if entry.file_type().is_file() && filter.allows_definition(entry.path()) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Localization files directly under `dir`, optionally restricted to lowercase stems
pub fn localization_files(
    dir: &Path,
    extension: &str,
    stems: Option<&HashSet<String>>,
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to list {}", dir.display()))?;
        let path = entry.path();
        if !entry.file_type().is_file() || !has_extension(path, extension) {
            continue;
        }
        if let Some(stems) = stems {
            match file_stem_lower(path) {
                Some(stem) if stems.contains(&stem) => {}
                _ => continue,
            }
        }
        files.push(entry.into_path());
    }
    files.sort();
    Ok(files)
}

/// Culture subdirectory of `root`, matched case-insensitively
pub fn find_culture_dir(root: &Path, culture: &str) -> Option<PathBuf> {
    let exact = root.join(culture);
    if exact.is_dir() {
        return Some(exact);
    }

    let wanted = culture.to_lowercase().replace('_', "-");
    WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .find(|e| e.file_name().to_string_lossy().to_lowercase().replace('_', "-") == wanted)
        .map(|e| e.into_path())
}

/// Lowercased file stem
pub fn file_stem_lower(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().to_lowercase())
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn layout(temp: &TempDir) -> PathBuf {
        let root = temp.path().join("defs");
        fs::create_dir_all(root.join("en-US")).unwrap();
        fs::create_dir_all(root.join("de-de")).unwrap();
        fs::write(root.join("Alpha.admx"), "{}").unwrap();
        fs::write(root.join("Beta.ADMX"), "{}").unwrap();
        fs::write(root.join("notes.txt"), "x").unwrap();
        fs::write(root.join("en-US").join("Alpha.adml"), "{}").unwrap();
        fs::write(root.join("en-US").join("Beta.adml"), "{}").unwrap();
        fs::write(root.join("de-de").join("Alpha.adml"), "{}").unwrap();
        root
    }

    fn filter(allow: &[&str]) -> SourceFilter {
        let mut config = CacheConfig::with_cache_dir("/unused");
        config.file_allow_list = allow.iter().map(|s| s.to_string()).collect();
        SourceFilter::from_config(&config).unwrap()
    }

    #[test]
    fn test_discover_all_files() {
        let temp = TempDir::new().unwrap();
        let root = layout(&temp);

        let set = SourceSet::discover(&root, "en-US", &filter(&[])).unwrap();
        assert_eq!(set.definitions.len(), 2);
        assert_eq!(set.localizations.len(), 2);
        assert!(!set.has_no_localizations());
    }

    #[test]
    fn test_culture_dir_case_insensitive() {
        let temp = TempDir::new().unwrap();
        let root = layout(&temp);

        let dir = find_culture_dir(&root, "de-DE").unwrap();
        assert_eq!(dir.file_name().unwrap().to_string_lossy().to_lowercase(), "de-de");
        assert!(find_culture_dir(&root, "fr-FR").is_none());
    }

    #[test]
    fn test_missing_culture_has_no_localizations() {
        let temp = TempDir::new().unwrap();
        let root = layout(&temp);

        let set = SourceSet::discover(&root, "fr-FR", &filter(&[])).unwrap();
        assert!(set.culture_dir.is_none());
        assert!(set.has_no_localizations());
    }

    #[test]
    fn test_allow_list_restricts_definitions_and_localizations() {
        let temp = TempDir::new().unwrap();
        let root = layout(&temp);

        let set = SourceSet::discover(&root, "en-US", &filter(&["alpha.admx"])).unwrap();
        assert_eq!(set.definitions, vec![root.join("Alpha.admx")]);
        assert_eq!(set.localizations, vec![root.join("en-US").join("Alpha.adml")]);
    }

    #[test]
    fn test_signature_stable_and_sensitive() {
        let temp = TempDir::new().unwrap();
        let root = layout(&temp);
        let f = filter(&[]);

        let first = SourceSet::discover(&root, "en-US", &f).unwrap().signature(&f).unwrap();
        let second = SourceSet::discover(&root, "en-US", &f).unwrap().signature(&f).unwrap();
        assert_eq!(first, second);

        fs::write(root.join("en-US").join("Beta.adml"), "{\"strings\":{}}").unwrap();
        let changed = SourceSet::discover(&root, "en-US", &f).unwrap().signature(&f).unwrap();
        assert_ne!(first, changed);
    }

    #[test]
    fn test_signature_depends_on_allow_list() {
        let temp = TempDir::new().unwrap();
        let root = layout(&temp);

        let all = filter(&[]);
        let only_alpha = filter(&["Alpha.admx"]);
        let a = SourceSet::discover(&root, "en-US", &all).unwrap().signature(&all).unwrap();
        let b = SourceSet::discover(&root, "en-US", &only_alpha)
            .unwrap()
            .signature(&only_alpha)
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut config = CacheConfig::with_cache_dir("/unused");
        config.file_allow_list = vec!["[".to_string()];
        assert!(SourceFilter::from_config(&config).is_err());
    }
}
