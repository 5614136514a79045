//! Definition loader seam
//!
//! The cache never parses policy definitions itself; it asks a
//! `DefinitionLoader` for a `PolicyBundle` holding every policy of the
//! selected definition files with strings resolved for one culture.
//!
//! `JsonDefinitionLoader` is the loader shipped with the crate. It reads
//! definition and localization files that were extracted to JSON ahead of
//! time. A definition file looks like:
//!
//! ```json
//! {
//!   "namespace": "Contoso.Browser",
//!   "product": "Contoso Browser",
//!   "categories": [{ "name": "Browser", "display_name": "$(string.Cat_Browser)" }],
//!   "policies": [{
//!     "name": "BlockPopups",
//!     "class": "Machine",
//!     "category": "Browser",
//!     "display_name": "$(string.BlockPopups)",
//!     "explain_text": "$(string.BlockPopups_Help)",
//!     "key": "Software\\Policies\\Contoso\\Browser",
//!     "value_name": "BlockPopups",
//!     "presentation": "$(presentation.BlockPopups)",
//!     "elements": [{ "type": "decimal", "id": "Limit", "value_name": "PopupLimit" }]
//!   }]
//! }
//! ```
//!
//! and its localization file `<culture>/<stem>.adml` holds
//! `{ "strings": { "Id": "text" }, "presentations": { "Id": { ... } } }`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::models::{ElementKind, RegistryHive, ValueType};
use crate::signature::{file_stem_lower, find_culture_dir};

/// Culture consulted when `resolve_fallback` is set and a string is missing
pub const FALLBACK_CULTURE: &str = "en-US";

/// Separator between category names in a breadcrumb
pub const CATEGORY_SEPARATOR: &str = " > ";

/// What to load
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub root: PathBuf,
    pub culture: String,
    pub definition_files: Vec<PathBuf>,
    pub localization_dir: Option<PathBuf>,
    pub localization_extension: String,
    /// Fill missing strings from `FALLBACK_CULTURE`. The cache resolves
    /// fallback at query time and always passes `false`.
    pub resolve_fallback: bool,
    pub max_policies: Option<usize>,
}

/// One policy with strings resolved for the requested culture
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedPolicy {
    pub namespace: String,
    pub name: String,
    pub category_key: Option<String>,
    pub hive: RegistryHive,
    pub registry_key: String,
    pub registry_value: Option<String>,
    pub value_type: ValueType,
    pub product_hint: Option<String>,
    /// Empty when the culture has no string for this policy
    pub display_name: String,
    pub explain_text: String,
    pub category_path: String,
    pub presentation: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyBundle {
    pub culture: String,
    pub policies: Vec<LoadedPolicy>,
    /// Definition files that were read successfully
    pub definition_files: Vec<PathBuf>,
    /// Localization files that were read successfully
    pub localization_files: Vec<PathBuf>,
    /// Files skipped because they could not be read or parsed
    pub failed_files: usize,
}

pub trait DefinitionLoader: Send + Sync {
    fn load(&self, request: &LoadRequest) -> Result<PolicyBundle>;
}

#[derive(Debug, Deserialize)]
struct DefinitionFile {
    namespace: String,
    #[serde(default)]
    product: Option<String>,
    #[serde(default)]
    categories: Vec<CategoryDef>,
    #[serde(default)]
    policies: Vec<PolicyDef>,
}

#[derive(Debug, Deserialize)]
struct CategoryDef {
    name: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    parent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PolicyDef {
    name: String,
    #[serde(default = "default_class")]
    class: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    explain_text: String,
    key: String,
    #[serde(default)]
    value_name: Option<String>,
    #[serde(default)]
    supported_on: Option<String>,
    #[serde(default)]
    presentation: Option<String>,
    #[serde(default)]
    elements: Vec<ElementDef>,
}

fn default_class() -> String {
    "Machine".to_string()
}

#[derive(Debug, Deserialize)]
struct ElementDef {
    #[serde(rename = "type")]
    kind: ElementKind,
}

#[derive(Debug, Default, Deserialize)]
struct LocalizationFile {
    #[serde(default)]
    strings: HashMap<String, String>,
    #[serde(default)]
    presentations: HashMap<String, serde_json::Value>,
}

impl LocalizationFile {
    fn merge_missing(&mut self, other: LocalizationFile) {
        for (k, v) in other.strings {
            self.strings.entry(k).or_insert(v);
        }
        for (k, v) in other.presentations {
            self.presentations.entry(k).or_insert(v);
        }
    }

    /// Resolve `$(string.Id)`; anything else is literal text
    fn text(&self, reference: &str) -> String {
        match parse_reference(reference, "string") {
            Some(id) => self.strings.get(id).cloned().unwrap_or_default(),
            None => reference.to_string(),
        }
    }

    fn presentation(&self, reference: &str) -> Option<String> {
        let id = parse_reference(reference, "presentation")?;
        self.presentations
            .get(id)
            .and_then(|value| serde_json::to_string(value).ok())
    }
}

/// `$(kind.Id)` -> `Id`
fn parse_reference<'a>(text: &'a str, kind: &str) -> Option<&'a str> {
    let inner = text.trim().strip_prefix("$(")?.strip_suffix(')')?;
    let (prefix, id) = inner.split_once('.')?;
    (prefix == kind).then_some(id)
}

/// Strip an optional `namespace:` prefix from a category reference
fn local_name(reference: &str) -> &str {
    reference.rsplit(':').next().unwrap_or(reference)
}

/// Loader for pre-extracted JSON definition and localization files
#[derive(Debug, Clone, Default)]
pub struct JsonDefinitionLoader;

impl JsonDefinitionLoader {
    pub fn new() -> Self {
        Self
    }

    fn read_definition(path: &Path) -> Result<DefinitionFile> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn read_localization(path: &Path) -> Result<LocalizationFile> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn localization_path(dir: &Path, stem: &str, extension: &str) -> Option<PathBuf> {
        std::fs::read_dir(dir).ok()?.filter_map(|e| e.ok()).map(|e| e.path()).find(|p| {
            p.is_file()
                && file_stem_lower(p).as_deref() == Some(stem)
                && p.extension()
                    .map(|e| e.to_string_lossy().eq_ignore_ascii_case(extension))
                    .unwrap_or(false)
        })
    }

    /// Strings for one definition file; missing or unreadable files give an empty table
    fn strings_for(
        &self,
        request: &LoadRequest,
        stem: &str,
        bundle: &mut PolicyBundle,
    ) -> LocalizationFile {
        let mut strings = LocalizationFile::default();

        if let Some(path) = request
            .localization_dir
            .as_deref()
            .and_then(|dir| Self::localization_path(dir, stem, &request.localization_extension))
        {
            match Self::read_localization(&path) {
                Ok(file) => {
                    strings = file;
                    bundle.localization_files.push(path);
                }
                Err(e) => {
                    log::warn!("Skipping localization file: {:#}", e);
                    bundle.failed_files += 1;
                }
            }
        }

        if request.resolve_fallback && !request.culture.eq_ignore_ascii_case(FALLBACK_CULTURE) {
            let fallback = find_culture_dir(&request.root, FALLBACK_CULTURE)
                .and_then(|dir| Self::localization_path(&dir, stem, &request.localization_extension));
            if let Some(path) = fallback {
                match Self::read_localization(&path) {
                    Ok(file) => strings.merge_missing(file),
                    Err(e) => log::debug!("Fallback localization unreadable: {:#}", e),
                }
            }
        }

        strings
    }

    fn category_path(
        categories: &HashMap<String, &CategoryDef>,
        strings: &LocalizationFile,
        start: Option<&str>,
    ) -> String {
        let mut names = Vec::new();
        let mut current = start.map(local_name);
        // Bounded walk; malformed files may contain parent cycles
        while let Some(name) = current {
            if names.len() >= 32 {
                break;
            }
            match categories.get(name) {
                Some(category) => {
                    let label = strings.text(&category.display_name);
                    names.push(if label.is_empty() { category.name.clone() } else { label });
                    current = category.parent.as_deref().map(local_name);
                }
                None => break,
            }
        }
        names.reverse();
        names.join(CATEGORY_SEPARATOR)
    }
}

impl DefinitionLoader for JsonDefinitionLoader {
    fn load(&self, request: &LoadRequest) -> Result<PolicyBundle> {
        let mut bundle = PolicyBundle {
            culture: request.culture.clone(),
            ..PolicyBundle::default()
        };

        for path in &request.definition_files {
            let definition = match Self::read_definition(path) {
                Ok(d) => d,
                Err(e) => {
                    log::warn!("Skipping definition file: {:#}", e);
                    bundle.failed_files += 1;
                    continue;
                }
            };
            bundle.definition_files.push(path.clone());

            let stem = file_stem_lower(path).unwrap_or_default();
            let strings = self.strings_for(request, &stem, &mut bundle);
            let categories: HashMap<String, &CategoryDef> = definition
                .categories
                .iter()
                .map(|c| (c.name.clone(), c))
                .collect();

            for policy in &definition.policies {
                let hive = match policy.class.parse::<RegistryHive>() {
                    Ok(hive) => hive,
                    Err(_) => {
                        log::debug!(
                            "Policy {}:{} has unknown class '{}', assuming Machine",
                            definition.namespace,
                            policy.name,
                            policy.class
                        );
                        RegistryHive::Machine
                    }
                };

                let kinds: Vec<ElementKind> = policy.elements.iter().map(|e| e.kind).collect();
                let product_hint = policy
                    .supported_on
                    .as_deref()
                    .map(|s| strings.text(s))
                    .filter(|s| !s.is_empty())
                    .or_else(|| definition.product.clone());

                bundle.policies.push(LoadedPolicy {
                    namespace: definition.namespace.clone(),
                    name: policy.name.clone(),
                    category_key: policy.category.as_deref().map(|c| local_name(c).to_string()),
                    hive,
                    registry_key: policy.key.clone(),
                    registry_value: policy.value_name.clone().filter(|v| !v.is_empty()),
                    value_type: ValueType::infer(&kinds),
                    product_hint,
                    display_name: strings.text(&policy.display_name).trim().to_string(),
                    explain_text: strings.text(&policy.explain_text),
                    category_path: Self::category_path(&categories, &strings, policy.category.as_deref()),
                    presentation: policy.presentation.as_deref().and_then(|p| strings.presentation(p)),
                });

                if let Some(cap) = request.max_policies {
                    if bundle.policies.len() >= cap {
                        log::debug!("Policy cap of {} reached", cap);
                        return Ok(bundle);
                    }
                }
            }
        }

        log::debug!(
            "Loaded {} policies for {} ({} definition file(s), {} failed)",
            bundle.policies.len(),
            request.culture,
            bundle.definition_files.len(),
            bundle.failed_files
        );
        Ok(bundle)
    }
}
