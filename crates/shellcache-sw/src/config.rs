//! Worker and container configuration.
//!
//! A worker "script" in this runtime is a JSON-serialized [`WorkerConfig`]:
//! fetching the registered script URL and parsing the body yields everything a
//! generation needs (its cache name, its shell asset list, ...).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shellcache_common::{RetrySettings, ShellCacheError};
use url::Url;

/// Configuration of one worker generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Prefix of every cache generation name.
    pub cache_prefix: String,

    /// Build counter baked into the cache name.
    pub cache_version: u32,

    /// Application shell files, relative to the base path.
    pub assets: Vec<String>,

    /// Base path override. Relative values resolve against the script URL;
    /// `None` means the directory containing the script.
    pub base_path: Option<String>,

    /// Relative path of the JSON resource carrying the application version.
    pub version_manifest: String,

    /// Call skip-waiting at the start of install.
    pub skip_waiting_on_install: bool,

    /// Tag of the periodic background refresh.
    pub periodic_sync_tag: String,

    /// Minimum interval between periodic refreshes, in seconds.
    pub periodic_interval_secs: u64,

    /// Title shown by the synthesized offline document.
    pub offline_title: String,

    /// Retry policy for single-asset fetches after a failed bulk put.
    pub asset_retry: RetrySettings,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "shellcache".to_string(),
            cache_version: 1,
            assets: vec![
                "./".to_string(),
                "index.html".to_string(),
                "manifest.json".to_string(),
                "static/js/main.js".to_string(),
                "static/css/main.css".to_string(),
                "favicon.ico".to_string(),
                "logo192.png".to_string(),
            ],
            base_path: None,
            version_manifest: "manifest.json".to_string(),
            skip_waiting_on_install: true,
            periodic_sync_tag: "update-cache".to_string(),
            periodic_interval_secs: 24 * 60 * 60,
            offline_title: "You are offline".to_string(),
            asset_retry: RetrySettings::default(),
        }
    }
}

impl WorkerConfig {
    /// Name of this generation's cache.
    pub fn cache_name(&self) -> String {
        format!("{}-v{}", self.cache_prefix, self.cache_version)
    }

    /// Periodic refresh interval.
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_secs(self.periodic_interval_secs)
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> shellcache_common::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ShellCacheError::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: &Path) -> shellcache_common::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Serialize to the JSON form served as a worker script.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Check the values a cache name is built from.
    pub fn validate(&self) -> shellcache_common::Result<()> {
        if self.cache_prefix.is_empty() {
            return Err(ShellCacheError::config("cache_prefix must not be empty"));
        }
        if !is_valid_cache_name(&self.cache_prefix) {
            return Err(ShellCacheError::config(format!(
                "cache_prefix '{}' may only contain [A-Za-z0-9._-]",
                self.cache_prefix
            )));
        }
        if self.periodic_sync_tag.is_empty() {
            return Err(ShellCacheError::config("periodic_sync_tag must not be empty"));
        }
        Ok(())
    }

    /// Resolve the base URL shell assets are relative to.
    ///
    /// The result always ends with `/`.
    pub fn resolve_base(&self, script_url: &Url) -> shellcache_common::Result<Url> {
        let mut base = match self.base_path {
            Some(ref path) => script_url.join(path).map_err(|e| {
                ShellCacheError::config_with_source(format!("invalid base_path '{path}'"), e)
            })?,
            None => script_url.join("./").map_err(|e| {
                ShellCacheError::config_with_source("script URL has no directory", e)
            })?,
        };
        base.set_query(None);
        base.set_fragment(None);
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(base)
    }
}

/// Whether `name` is usable as a cache generation name.
pub fn is_valid_cache_name(name: &str) -> bool {
    name.chars().any(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Configuration of the host runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Whether periodic background refresh may be scheduled.
    pub periodic_sync_granted: bool,

    /// Capacity of the container event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            periodic_sync_granted: true,
            event_capacity: 64,
        }
    }
}
