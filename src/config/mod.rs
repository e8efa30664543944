//! Config reader: loads YAML config files and resolves dot-separated keys.
//!
//! Reads `~/.leadroute/config.yml` (global) and `.leadroute.yml` (project).
//! Project config overrides global config for the same key.
//!
//! Parsed YAML is cached for the process lifetime, so the polling loops can
//! look keys up on every tick without touching disk.

use anyhow::Context;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::RwLock;

/// Project-local config file name.
pub const PROJECT_FILE: &str = ".leadroute.yml";

/// Cached YAML values: parsed once per file, reused for all key lookups.
static CACHE: std::sync::LazyLock<RwLock<HashMap<PathBuf, serde_yml::Value>>> =
    std::sync::LazyLock::new(|| RwLock::new(HashMap::new()));

/// Resolve the global config path: `~/.leadroute/config.yml`
pub fn global_config_path() -> anyhow::Result<PathBuf> {
    Ok(crate::home::app_home()?.join("config.yml"))
}

/// Get a config value by dot-separated key (e.g. "crm.webhook_url").
///
/// Lookup order:
/// 1. `.leadroute.yml` in the current directory (project config)
/// 2. `~/.leadroute/config.yml` (global config)
pub fn get(key: &str) -> anyhow::Result<String> {
    let project_path = PathBuf::from(PROJECT_FILE);
    if project_path.exists() {
        if let Ok(val) = resolve_key(&project_path, key) {
            return Ok(val);
        }
    }

    let global_path = global_config_path()?;
    if global_path.exists() {
        return resolve_key(&global_path, key);
    }

    anyhow::bail!("config key not found: {key}")
}

/// Get and parse a config value, falling back to `default` when the key is
/// missing or does not parse.
pub fn get_or<T: FromStr>(key: &str, default: T) -> T {
    get(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Resolve a dot-separated key from a YAML file, caching the parsed tree.
fn resolve_key(path: &PathBuf, key: &str) -> anyhow::Result<String> {
    if let Ok(cache) = CACHE.read() {
        if let Some(cached) = cache.get(path) {
            return extract_value(cached, key);
        }
    }

    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: serde_yml::Value =
        serde_yml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;

    if let Ok(mut cache) = CACHE.write() {
        cache.insert(path.clone(), parsed.clone());
    }

    extract_value(&parsed, key)
}

/// Extract a value from a YAML tree by dot-separated key.
fn extract_value(root: &serde_yml::Value, key: &str) -> anyhow::Result<String> {
    let mut current = root;
    for part in key.split('.') {
        current = current
            .get(part)
            .with_context(|| format!("key not found: {key}"))?;
    }

    match current {
        serde_yml::Value::String(s) => Ok(s.clone()),
        serde_yml::Value::Number(n) => Ok(n.to_string()),
        serde_yml::Value::Bool(b) => Ok(b.to_string()),
        serde_yml::Value::Null => Ok(String::new()),
        _ => Ok(serde_yml::to_string(current)?),
    }
}
