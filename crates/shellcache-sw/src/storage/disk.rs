//! Disk-backed cache storage.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/
//!     shellcache-v3/
//!         3f1c0e9a5b7d2e41.json   (entry metadata, written last)
//!         3f1c0e9a5b7d2e41.body   (response body)
//!     shellcache-v4/
//!     registration.json           (active worker script)
//! ```
//!
//! An entry exists once its metadata file exists, so a crash between the two
//! writes leaves at most an orphaned body file.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use shellcache_net::{Request, Response, ResponseType};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use super::{
    check_storable, now_millis, Cache, CacheHandle, CacheStorage, StoredRegistration,
};
use crate::config::is_valid_cache_name;
use crate::ServiceWorkerError;

const META_EXT: &str = "json";
const BODY_EXT: &str = "body";
const REGISTRATION_FILE: &str = "registration.json";

/// Raw metadata and body bytes of an entry, as found on disk.
type RawEntry = (Vec<u8>, Vec<u8>);

/// Entry metadata persisted next to each body file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    cached_at: u64,
}

impl EntryMeta {
    fn from_response(key: String, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            key,
            url: response.url.to_string(),
            status: response.status.as_u16(),
            headers,
            cached_at: now_millis(),
        }
    }

    fn into_response(self, body: Bytes) -> Result<Response, ServiceWorkerError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("corrupt entry url: {e}")))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::CacheError(format!("corrupt entry status: {e}")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }

        Ok(Response {
            url,
            status,
            headers,
            body,
            response_type: ResponseType::Basic,
            redirected: false,
        })
    }
}

/// FNV-1a, stable across builds so file names survive upgrades.
fn key_hash(key: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    key.bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}

fn cache_io(context: &str, e: io::Error) -> ServiceWorkerError {
    ServiceWorkerError::CacheError(format!("{context}: {e}"))
}

/// A cache generation stored in one directory.
#[derive(Debug)]
pub struct DiskCache {
    name: String,
    dir: PathBuf,
    lock: RwLock<()>,
}

impl DiskCache {
    fn new(name: &str, dir: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            dir,
            lock: RwLock::new(()),
        }
    }

    fn paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let stem = format!("{:016x}", key_hash(key));
        (
            self.dir.join(format!("{stem}.{META_EXT}")),
            self.dir.join(format!("{stem}.{BODY_EXT}")),
        )
    }

    async fn write_entry(&self, key: String, response: &Response) -> Result<(), ServiceWorkerError> {
        let (meta_path, body_path) = self.paths(&key);
        let meta = EntryMeta::from_response(key, response);
        let json = serde_json::to_vec(&meta)
            .map_err(|e| ServiceWorkerError::CacheError(format!("encode entry: {e}")))?;

        tokio::fs::write(&body_path, &response.body)
            .await
            .map_err(|e| cache_io("write body", e))?;
        tokio::fs::write(&meta_path, json)
            .await
            .map_err(|e| cache_io("write metadata", e))?;
        Ok(())
    }

    async fn remove_entry(&self, key: &str) -> Result<bool, ServiceWorkerError> {
        let (meta_path, body_path) = self.paths(key);
        let existed = match tokio::fs::remove_file(&meta_path).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(cache_io("remove metadata", e)),
        };
        if let Err(e) = tokio::fs::remove_file(&body_path).await {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(cache_io("remove body", e));
            }
        }
        Ok(existed)
    }

    async fn read_raw(&self, key: &str) -> Result<Option<RawEntry>, ServiceWorkerError> {
        let (meta_path, body_path) = self.paths(key);
        let meta = match tokio::fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(cache_io("read metadata", e)),
        };
        match tokio::fs::read(&body_path).await {
            Ok(body) => Ok(Some((meta, body))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(cache_io("read body", e)),
        }
    }

    /// Put back what a key held before a batch started writing.
    async fn restore_raw(&self, key: &str, previous: Option<RawEntry>) -> Result<(), ServiceWorkerError> {
        let Some((meta, body)) = previous else {
            return self.remove_entry(key).await.map(|_| ());
        };
        let (meta_path, body_path) = self.paths(key);
        tokio::fs::write(&body_path, body)
            .await
            .map_err(|e| cache_io("restore body", e))?;
        tokio::fs::write(&meta_path, meta)
            .await
            .map_err(|e| cache_io("restore metadata", e))
    }

    async fn roll_back(&self, written: Vec<(String, Option<RawEntry>)>) {
        // Newest first, so a key written twice ends with its original bytes.
        for (key, previous) in written.into_iter().rev() {
            if let Err(e) = self.restore_raw(&key, previous).await {
                warn!(cache = %self.name, key = %key, error = %e, "Rollback failed");
            }
        }
    }

    async fn read_meta(path: &Path) -> Result<Option<EntryMeta>, ServiceWorkerError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ServiceWorkerError::CacheError(format!("corrupt metadata: {e}"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(cache_io("read metadata", e)),
        }
    }
}

#[async_trait]
impl Cache for DiskCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, request: &Request, response: Response) -> Result<(), ServiceWorkerError> {
        check_storable(request, &response)?;
        let _guard = self.lock.write().await;
        self.write_entry(request.cache_key(), &response).await
    }

    async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<(), ServiceWorkerError> {
        for (request, response) in &entries {
            check_storable(request, response)?;
        }

        let _guard = self.lock.write().await;
        let mut written: Vec<(String, Option<RawEntry>)> = Vec::with_capacity(entries.len());
        for (request, response) in &entries {
            let key = request.cache_key();
            let previous = match self.read_raw(&key).await {
                Ok(previous) => previous,
                Err(e) => {
                    self.roll_back(written).await;
                    return Err(e);
                }
            };
            written.push((key.clone(), previous));
            if let Err(e) = self.write_entry(key, response).await {
                self.roll_back(written).await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn match_request(
        &self,
        request: &Request,
    ) -> Result<Option<Response>, ServiceWorkerError> {
        let key = request.cache_key();
        let (meta_path, body_path) = self.paths(&key);
        let _guard = self.lock.read().await;

        let Some(meta) = Self::read_meta(&meta_path).await? else {
            return Ok(None);
        };
        // Distinct keys can share a hash; the stored key decides.
        if meta.key != key {
            return Ok(None);
        }

        let body = tokio::fs::read(&body_path)
            .await
            .map_err(|e| cache_io("read body", e))?;
        meta.into_response(Bytes::from(body)).map(Some)
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let _guard = self.lock.read().await;
        let mut keys = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| cache_io("list entries", e))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| cache_io("list entries", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXT) {
                continue;
            }
            if let Some(meta) = Self::read_meta(&path).await? {
                keys.push(meta.key);
            }
        }
        Ok(keys)
    }

    async fn delete(&self, request: &Request) -> Result<bool, ServiceWorkerError> {
        let _guard = self.lock.write().await;
        self.remove_entry(&request.cache_key()).await
    }
}

/// Cache storage persisting each generation as a directory.
#[derive(Debug)]
pub struct DiskCacheStorage {
    root: PathBuf,
    open: RwLock<hashbrown::HashMap<String, Arc<DiskCache>>>,
}

impl DiskCacheStorage {
    /// Create storage rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ServiceWorkerError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| cache_io("create cache root", e))?;
        debug!(root = %root.display(), "DiskCacheStorage initialized");
        Ok(Self {
            root,
            open: RwLock::new(hashbrown::HashMap::new()),
        })
    }

    /// Default root: the platform cache directory plus `shellcache`.
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shellcache")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generation_dir(&self, name: &str) -> Result<PathBuf, ServiceWorkerError> {
        if !is_valid_cache_name(name) {
            return Err(ServiceWorkerError::CacheError(format!(
                "invalid cache name '{name}'"
            )));
        }
        Ok(self.root.join(name))
    }

    fn registration_path(&self) -> PathBuf {
        self.root.join(REGISTRATION_FILE)
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> Result<CacheHandle, ServiceWorkerError> {
        let dir = self.generation_dir(name)?;
        let mut open = self.open.write().await;

        if let Some(cache) = open.get(name) {
            if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                let handle: CacheHandle = cache.clone();
                return Ok(handle);
            }
        }

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| cache_io("create generation", e))?;
        let cache = Arc::new(DiskCache::new(name, dir));
        open.insert(name.to_string(), cache.clone());
        let handle: CacheHandle = cache;
        Ok(handle)
    }

    async fn open_existing(&self, name: &str) -> Result<Option<CacheHandle>, ServiceWorkerError> {
        let dir = self.generation_dir(name)?;
        let mut open = self.open.write().await;

        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            open.remove(name);
            return Ok(None);
        }
        let cache = open
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(DiskCache::new(name, dir)))
            .clone();
        let handle: CacheHandle = cache;
        Ok(Some(handle))
    }

    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        let dir = self.generation_dir(name)?;
        Ok(tokio::fs::try_exists(&dir).await.unwrap_or(false))
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| cache_io("list generations", e))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| cache_io("list generations", e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
                if is_valid_cache_name(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        let dir = self.generation_dir(name)?;
        self.open.write().await.remove(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(cache_io("delete generation", e)),
        }
    }

    async fn load_registration(&self) -> Result<Option<StoredRegistration>, ServiceWorkerError> {
        let bytes = match tokio::fs::read(self.registration_path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(cache_io("read registration", e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ServiceWorkerError::CacheError(format!("corrupt registration: {e}")))
    }

    async fn save_registration(&self, record: &StoredRegistration) -> Result<(), ServiceWorkerError> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| ServiceWorkerError::CacheError(format!("encode registration: {e}")))?;
        let path = self.registration_path();
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, json)
            .await
            .map_err(|e| cache_io("write registration", e))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| cache_io("write registration", e))?;
        debug!(script_url = %record.script_url, "Registration persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header;
    use tempfile::TempDir;

    fn request(path: &str) -> Request {
        Request::get(Url::parse("https://example.com/").unwrap().join(path).unwrap())
    }

    fn ok(request: &Request, body: &'static str) -> Response {
        Response::new(request.url.clone(), StatusCode::OK, body).with_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/css"),
        )
    }

    #[test]
    fn test_key_hash_is_stable() {
        assert_eq!(key_hash(""), 0xcbf2_9ce4_8422_2325);
        assert_ne!(
            key_hash("https://example.com/a.js"),
            key_hash("https://example.com/b.js")
        );
    }

    #[tokio::test]
    async fn test_put_and_match_round_trip() {
        let dir = TempDir::new().unwrap();
        let storage = DiskCacheStorage::new(dir.path()).unwrap();
        let cache = storage.open("shellcache-v1").await.unwrap();

        let req = request("/main.css");
        cache.put(&req, ok(&req, "body{}")).await.unwrap();

        let hit = cache.match_request(&req).await.unwrap().unwrap();
        assert_eq!(hit.status, StatusCode::OK);
        assert_eq!(&hit.body[..], b"body{}");
        assert_eq!(hit.header("content-type"), Some("text/css"));
        assert!(hit.is_cacheable());
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let req = request("/index.html");
        {
            let storage = DiskCacheStorage::new(dir.path()).unwrap();
            let cache = storage.open("shellcache-v1").await.unwrap();
            cache.put(&req, ok(&req, "<html/>")).await.unwrap();
        }

        let storage = DiskCacheStorage::new(dir.path()).unwrap();
        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["shellcache-v1".to_string()]
        );
        let cache = storage.open("shellcache-v1").await.unwrap();
        assert_eq!(cache.keys().await.unwrap(), vec![req.cache_key()]);
    }

    #[tokio::test]
    async fn test_put_all_rejects_uncacheable_without_writing() {
        let dir = TempDir::new().unwrap();
        let storage = DiskCacheStorage::new(dir.path()).unwrap();
        let cache = storage.open("v1").await.unwrap();

        let a = request("/a.js");
        let b = request("/b.js");
        let missing = Response::new(b.url.clone(), StatusCode::NOT_FOUND, "");
        assert!(cache
            .put_all(vec![(a.clone(), ok(&a, "a")), (b, missing)])
            .await
            .is_err());
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_entry_and_generation() {
        let dir = TempDir::new().unwrap();
        let storage = DiskCacheStorage::new(dir.path()).unwrap();
        let cache = storage.open("v1").await.unwrap();
        let req = request("/a.js");
        cache.put(&req, ok(&req, "a")).await.unwrap();

        assert!(cache.delete(&req).await.unwrap());
        assert!(cache.match_request(&req).await.unwrap().is_none());

        storage.open("v2").await.unwrap();
        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.delete("v1").await.unwrap());
        assert_eq!(storage.keys().await.unwrap(), vec!["v2".to_string()]);
    }

    #[tokio::test]
    async fn test_reopen_after_delete_recreates() {
        let dir = TempDir::new().unwrap();
        let storage = DiskCacheStorage::new(dir.path()).unwrap();
        storage.open("v1").await.unwrap();
        storage.delete("v1").await.unwrap();

        let cache = storage.open("v1").await.unwrap();
        let req = request("/a.js");
        cache.put(&req, ok(&req, "a")).await.unwrap();
        assert!(storage.has("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_generation_name() {
        let dir = TempDir::new().unwrap();
        let storage = DiskCacheStorage::new(dir.path()).unwrap();
        assert!(storage.open("../escape").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_batch_keeps_previous_entries() {
        let dir = TempDir::new().unwrap();
        let generation = dir.path().join("v1");
        std::fs::create_dir_all(&generation).unwrap();
        let cache = DiskCache::new("v1", generation);

        let a = request("/a.js");
        let b = request("/b.js");
        cache.put(&a, ok(&a, "a1")).await.unwrap();

        // A directory where b's body belongs makes the second write fail.
        let (_, b_body) = cache.paths(&b.cache_key());
        std::fs::create_dir(&b_body).unwrap();

        let result = cache
            .put_all(vec![(a.clone(), ok(&a, "a2")), (b.clone(), ok(&b, "b"))])
            .await;
        assert!(result.is_err());

        let kept = cache.match_request(&a).await.unwrap().unwrap();
        assert_eq!(&kept.body[..], b"a1");
        assert!(cache.match_request(&b).await.unwrap().is_none());
        assert_eq!(cache.keys().await.unwrap(), vec![a.cache_key()]);
    }

    #[tokio::test]
    async fn test_open_existing_does_not_recreate_deleted_generation() {
        let dir = TempDir::new().unwrap();
        let storage = DiskCacheStorage::new(dir.path()).unwrap();
        assert!(storage.open_existing("v1").await.unwrap().is_none());

        storage.open("v1").await.unwrap();
        assert!(storage.open_existing("v1").await.unwrap().is_some());

        storage.delete("v1").await.unwrap();
        assert!(storage.open_existing("v1").await.unwrap().is_none());
        assert!(!dir.path().join("v1").exists());
    }

    #[tokio::test]
    async fn test_registration_survives_restart() {
        let dir = TempDir::new().unwrap();
        let record = StoredRegistration {
            script_url: "https://example.com/sw.json?v=3".to_string(),
            script: r#"{"cache_version": 3}"#.to_string(),
        };
        {
            let storage = DiskCacheStorage::new(dir.path()).unwrap();
            assert!(storage.load_registration().await.unwrap().is_none());
            storage.save_registration(&record).await.unwrap();
        }

        let storage = DiskCacheStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load_registration().await.unwrap(), Some(record));
        // The record is not mistaken for a generation.
        assert!(storage.keys().await.unwrap().is_empty());
    }
}
