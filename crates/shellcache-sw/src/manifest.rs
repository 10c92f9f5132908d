//! Static asset manifest: the application shell files cached at install.

use tracing::warn;
use url::Url;

/// Collapse empty path segments.
///
/// `/app//main.js` becomes `/app/main.js`. A trailing slash is kept.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let mut normalized = String::with_capacity(path.len());
    normalized.push('/');
    normalized.push_str(&segments.join("/"));
    if path.ends_with('/') && !segments.is_empty() {
        normalized.push('/');
    }
    normalized
}

/// Drop the leading segment of a relative `asset` when it repeats the last
/// directory of `base`.
///
/// With base `/app/Assets/`, `Assets/logo.png` becomes `logo.png`, so the
/// entry resolves to `/app/Assets/logo.png` instead of
/// `/app/Assets/Assets/logo.png`. Absolute and root-relative assets are left
/// alone, as are repeats anywhere else in the path.
pub fn strip_repeated_base_dir<'a>(base: &Url, asset: &'a str) -> &'a str {
    if asset.starts_with('/') || Url::parse(asset).is_ok() {
        return asset;
    }

    let dir = base.path().rsplit_once('/').map_or("", |(dir, _)| dir);
    let Some(last_dir) = dir.rsplit('/').find(|s| !s.is_empty()) else {
        return asset;
    };

    let relative = asset.trim_start_matches("./");
    match relative.split_once('/') {
        Some((first, rest)) if first == last_dir => rest,
        _ => asset,
    }
}

/// Resolved, normalized and de-duplicated list of shell asset URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetManifest {
    entries: Vec<Url>,
}

impl AssetManifest {
    /// Resolve `assets` against `base`.
    ///
    /// Entries that do not form a valid URL are logged and dropped.
    pub fn resolve(base: &Url, assets: &[String]) -> Self {
        let mut entries: Vec<Url> = Vec::with_capacity(assets.len());

        for asset in assets {
            let mut url = match base.join(strip_repeated_base_dir(base, asset)) {
                Ok(url) => url,
                Err(e) => {
                    warn!(asset = %asset, error = %e, "Skipping unresolvable asset");
                    continue;
                }
            };
            url.set_fragment(None);
            let path = normalize_path(url.path());
            url.set_path(&path);

            if !entries.contains(&url) {
                entries.push(url);
            }
        }

        Self { entries }
    }

    pub fn entries(&self) -> &[Url] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
