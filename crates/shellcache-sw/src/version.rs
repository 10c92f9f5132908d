//! Application version lookup.

use std::sync::Arc;

use serde::Deserialize;
use shellcache_net::{CacheMode, Fetcher, Request};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Deserialize)]
struct VersionManifest {
    version: Option<String>,
}

/// Reads the `version` field of a JSON manifest next to the worker.
///
/// Resolution never fails: every error is logged and yields an empty string.
#[derive(Clone)]
pub struct VersionResolver {
    fetcher: Arc<dyn Fetcher>,
    manifest_url: Option<Url>,
}

impl VersionResolver {
    /// Resolve `manifest_path` against `base` (the worker location).
    pub fn new(fetcher: Arc<dyn Fetcher>, base: &Url, manifest_path: &str) -> Self {
        let manifest_url = match base.join(manifest_path) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(path = %manifest_path, error = %e, "Invalid version manifest path");
                None
            }
        };
        Self {
            fetcher,
            manifest_url,
        }
    }

    pub fn manifest_url(&self) -> Option<&Url> {
        self.manifest_url.as_ref()
    }

    /// Fetch the manifest and return its version, or `""` on any failure.
    pub async fn resolve(&self) -> String {
        let Some(url) = self.manifest_url.clone() else {
            return String::new();
        };

        let request = Request::get(url.clone()).cache_mode(CacheMode::NoStore);
        let response = match self.fetcher.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, error = %e, "Version manifest fetch failed");
                return String::new();
            }
        };

        if !response.ok() {
            warn!(url = %url, status = %response.status, "Version manifest unavailable");
            return String::new();
        }

        match response.json::<VersionManifest>() {
            Ok(VersionManifest {
                version: Some(version),
            }) => {
                debug!(version = %version, "Resolved application version");
                version
            }
            Ok(_) => {
                warn!(url = %url, "Version manifest has no version field");
                String::new()
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Version manifest is not valid JSON");
                String::new()
            }
        }
    }

    /// Resolve on a background task.
    pub fn spawn(&self) -> JoinHandle<String> {
        let resolver = self.clone();
        tokio::spawn(async move { resolver.resolve().await })
    }
}
