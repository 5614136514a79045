//! Core data models for the policy cache
//!
//! These are the shapes that cross the crate boundary: what the loader hands
//! in (`ElementKind`, `RegistryHive`), what searches and lookups hand out
//! (`Hit`, `PolicyDetail`).

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Registry hive a policy writes to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, EnumString, Display)]
#[strum(ascii_case_insensitive)]
pub enum RegistryHive {
    Machine,
    User,
    /// Policy is defined for both classes
    Both,
}

impl RegistryHive {
    /// Short registry root used when rendering a full registry path
    pub fn root_prefix(&self) -> Option<&'static str> {
        match self {
            RegistryHive::Machine => Some("HKLM"),
            RegistryHive::User => Some("HKCU"),
            RegistryHive::Both => None,
        }
    }
}

/// Kind of a presentation/value element declared by a policy definition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ElementKind {
    Decimal,
    LongDecimal,
    Text,
    MultiText,
    Enum,
    Boolean,
    List,
}

/// Value type inferred from a policy's elements
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, EnumString, Display)]
pub enum ValueType {
    /// Enabled/disabled switch without extra elements
    Toggle,
    Decimal,
    LongDecimal,
    Text,
    MultiText,
    Enum,
    Boolean,
    List,
    /// More than one element
    Composite,
    /// Unrecognized value stored in an older cache row
    #[strum(default)]
    Other(String),
}

impl ValueType {
    pub fn infer(elements: &[ElementKind]) -> Self {
        match elements {
            [] => ValueType::Toggle,
            [only] => match only {
                ElementKind::Decimal => ValueType::Decimal,
                ElementKind::LongDecimal => ValueType::LongDecimal,
                ElementKind::Text => ValueType::Text,
                ElementKind::MultiText => ValueType::MultiText,
                ElementKind::Enum => ValueType::Enum,
                ElementKind::Boolean => ValueType::Boolean,
                ElementKind::List => ValueType::List,
            },
            _ => ValueType::Composite,
        }
    }
}

/// One ranked search result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hit {
    /// Row id of the policy in the store
    pub policy_id: i64,
    /// Culture of the localization row that produced the hit
    pub culture: String,
    /// `namespace:policy_name`
    pub unique_id: String,
    pub display_name: String,
    /// Registry key plus value name, prefixed with the hive root when unambiguous
    pub registry_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_hint: Option<String>,
    pub value_type: String,
    pub score: f64,
}

/// Full policy record joined with one localization row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyDetail {
    pub policy_id: i64,
    pub unique_id: String,
    pub namespace: String,
    pub policy_name: String,
    pub category_key: Option<String>,
    pub hive: String,
    pub registry_key: String,
    pub registry_value: Option<String>,
    pub value_type: String,
    pub product_hint: Option<String>,
    pub culture: String,
    pub display_name: String,
    pub explain_text: String,
    pub category_path: String,
    /// Serialized presentation descriptor, if the definition had one
    pub presentation: Option<String>,
}

/// Build the `namespace:policy_name` identifier
pub fn unique_id(namespace: &str, policy_name: &str) -> String {
    format!("{}:{}", namespace, policy_name)
}

/// Render `HKLM\key\value` style paths for display
pub fn display_registry_path(hive: &str, key: &str, value: Option<&str>) -> String {
    let mut path = String::new();
    if let Some(prefix) = hive.parse::<RegistryHive>().ok().and_then(|h| h.root_prefix()) {
        path.push_str(prefix);
        path.push('\\');
    }
    path.push_str(key.trim_matches('\\'));
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        path.push('\\');
        path.push_str(value);
    }
    path
}

/// Canonical form of a culture name: `en-us` / `EN_US` become `en-US`,
/// script subtags are title-cased (`zh-hant-tw` becomes `zh-Hant-TW`)
pub fn canonical_culture(culture: &str) -> String {
    culture
        .trim()
        .split(['-', '_'])
        .filter(|part| !part.is_empty())
        .enumerate()
        .map(|(i, part)| {
            if i == 0 {
                part.to_ascii_lowercase()
            } else if part.len() == 2 {
                part.to_ascii_uppercase()
            } else if part.len() == 4 {
                let lower = part.to_ascii_lowercase();
                let mut chars = lower.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => lower,
                }
            } else {
                part.to_ascii_lowercase()
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Canonicalize and de-duplicate a culture list, keeping first occurrences
pub fn dedupe_cultures<I, S>(cultures: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = Vec::new();
    for culture in cultures {
        let canonical = canonical_culture(culture.as_ref());
        if !canonical.is_empty() && !seen.contains(&canonical) {
            seen.push(canonical);
        }
    }
    seen
}
