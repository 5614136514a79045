//! Shared fixtures: a small policy definition tree and fast-mode caches over it

#![allow(dead_code)]

use policy_cache::{CacheConfig, Hit, PolicyCache};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Source tree with two products:
///
/// - `contoso.admx`: BlockPopups, HomePage, SmartScreenFilter
/// - `fabrikam.admx`: AutoUpdate, UpdateChannel
///
/// en-US localizes both; de-DE localizes Contoso only and has no string
/// for HomePage.
pub struct PolicyTree {
    temp: TempDir,
    pub root: PathBuf,
}

impl PolicyTree {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("temp dir");
        let root = temp.path().join("PolicyDefinitions");
        fs::create_dir_all(&root).unwrap();

        let tree = Self { temp, root };
        tree.write_definition("contoso.admx", &contoso_definition());
        tree.write_definition("fabrikam.admx", &fabrikam_definition());

        tree.write_localization(
            "en-US",
            "contoso.adml",
            &[
                ("Cat_Contoso", "Contoso"),
                ("BlockPopups", "Block pop-ups"),
                ("BlockPopups_Help", "Prevents sites from opening new windows."),
                ("HomePage", "Set the home page"),
                ("HomePage_Help", "Configures the start address."),
                ("SmartScreen", "Configure SmartScreen filter"),
                ("SmartScreen_Help", "Checks downloads against a reputation list."),
            ],
        );
        tree.write_localization(
            "en-US",
            "fabrikam.adml",
            &[
                ("Cat_Fabrikam", "Fabrikam"),
                ("AutoUpdate", "Enable automatic updates"),
                ("AutoUpdate_Help", "Installs new versions in the background."),
                ("UpdateChannel", "Choose the release channel"),
                ("UpdateChannel_Help", "Stable or beta."),
            ],
        );
        tree.write_localization(
            "de-DE",
            "contoso.adml",
            &[
                ("Cat_Contoso", "Contoso"),
                ("BlockPopups", "Popups blockieren"),
                ("BlockPopups_Help", "Verhindert das Öffnen neuer Fenster."),
                ("SmartScreen", "SmartScreen-Filter konfigurieren"),
            ],
        );
        tree
    }

    pub fn write_definition(&self, file: &str, definition: &Value) {
        fs::write(self.root.join(file), definition.to_string()).unwrap();
    }

    pub fn write_localization(&self, culture: &str, file: &str, strings: &[(&str, &str)]) {
        let dir = self.root.join(culture);
        fs::create_dir_all(&dir).unwrap();
        let strings: serde_json::Map<String, Value> = strings
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        fs::write(dir.join(file), json!({ "strings": strings }).to_string()).unwrap();
    }

    pub fn remove_culture(&self, culture: &str) {
        fs::remove_dir_all(self.root.join(culture)).unwrap();
    }

    /// A fresh cache directory next to the source tree
    pub fn cache_dir(&self, name: &str) -> PathBuf {
        self.temp.path().join(name)
    }

    /// Fast-mode config without maintenance
    pub fn config(&self, cache_name: &str) -> CacheConfig {
        let mut config = CacheConfig::with_cache_dir(self.cache_dir(cache_name));
        config.fast_mode = true;
        config.maintenance_enabled = false;
        config
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

fn contoso_definition() -> Value {
    json!({
        "namespace": "Contoso.Browser",
        "product": "Contoso Browser",
        "categories": [{ "name": "Contoso", "display_name": "$(string.Cat_Contoso)" }],
        "policies": [
            {
                "name": "BlockPopups",
                "class": "Machine",
                "category": "Contoso",
                "display_name": "$(string.BlockPopups)",
                "explain_text": "$(string.BlockPopups_Help)",
                "key": "Software\\Policies\\Contoso\\Browser",
                "value_name": "BlockPopups"
            },
            {
                "name": "HomePage",
                "class": "User",
                "category": "Contoso",
                "display_name": "$(string.HomePage)",
                "explain_text": "$(string.HomePage_Help)",
                "key": "Software\\Policies\\Contoso\\Browser",
                "value_name": "HomePage",
                "elements": [{ "type": "text", "id": "Url", "value_name": "HomePageUrl" }]
            },
            {
                "name": "SmartScreenFilter",
                "class": "Machine",
                "category": "Contoso",
                "display_name": "$(string.SmartScreen)",
                "explain_text": "$(string.SmartScreen_Help)",
                "key": "Software\\Policies\\Contoso\\Browser\\Filter",
                "value_name": "SmartScreenEnabled"
            }
        ]
    })
}

fn fabrikam_definition() -> Value {
    json!({
        "namespace": "Fabrikam.Update",
        "product": "Fabrikam Updater",
        "categories": [{ "name": "Fabrikam", "display_name": "$(string.Cat_Fabrikam)" }],
        "policies": [
            {
                "name": "AutoUpdate",
                "class": "Machine",
                "category": "Fabrikam",
                "display_name": "$(string.AutoUpdate)",
                "explain_text": "$(string.AutoUpdate_Help)",
                "key": "Software\\Policies\\Fabrikam\\Update",
                "value_name": "AutoUpdateEnabled"
            },
            {
                "name": "UpdateChannel",
                "class": "Machine",
                "category": "Fabrikam",
                "display_name": "$(string.UpdateChannel)",
                "explain_text": "$(string.UpdateChannel_Help)",
                "key": "Software\\Policies\\Fabrikam\\Update",
                "value_name": "Channel",
                "elements": [{ "type": "enum", "id": "Channel", "value_name": "Channel" }]
            }
        ]
    })
}

/// Initialized cache pointed at `root`
pub async fn open_cache(config: CacheConfig, root: &Path) -> PolicyCache {
    let cache = PolicyCache::new(config).expect("cache");
    cache
        .initialize(&CancellationToken::new())
        .await
        .expect("initialize");
    cache.set_source_root(root);
    cache
}

pub fn cultures(list: &[&str]) -> Vec<String> {
    list.iter().map(|c| c.to_string()).collect()
}

pub fn ids(hits: &[Hit]) -> BTreeSet<String> {
    hits.iter().map(|h| h.unique_id.clone()).collect()
}

/// Hit without its store row id, for comparing separately built caches
pub fn portable(hits: &[Hit]) -> Vec<(String, String, String, String, String)> {
    hits.iter()
        .map(|h| {
            (
                h.unique_id.clone(),
                h.culture.clone(),
                h.display_name.clone(),
                h.registry_path.clone(),
                format!("{:.3}", h.score),
            )
        })
        .collect()
}
