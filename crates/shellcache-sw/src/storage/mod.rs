//! Named cache storage.
//!
//! [`CacheStorage`] is the `caches` global: a set of named generations. Each
//! generation is a [`Cache`] mapping normalized request keys to responses.
//! Both are traits so the worker can run on any storage engine; two engines
//! ship with the crate.
//!
//! ```text
//! CacheStorage
//!     ├── "shellcache-v3" (Cache)
//!     │       └── Request key → Response
//!     └── "shellcache-v4" (Cache)
//! ```

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use http::Method;
use serde::{Deserialize, Serialize};
use shellcache_net::{Request, Response};

use crate::ServiceWorkerError;

pub mod disk;
pub mod memory;

pub use disk::DiskCacheStorage;
pub use memory::MemoryCacheStorage;

/// Shared handle to an open cache generation.
pub type CacheHandle = Arc<dyn Cache>;

/// A cached request/response pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Normalized request key.
    pub key: String,

    /// Stored response.
    pub response: Response,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    pub fn new(key: String, response: Response) -> Self {
        Self {
            key,
            response,
            cached_at: now_millis(),
        }
    }
}

/// One named cache generation.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Generation name.
    fn name(&self) -> &str;

    /// Store one response, replacing any previous entry for the request.
    async fn put(&self, request: &Request, response: Response) -> Result<(), ServiceWorkerError>;

    /// Store every pair or none of them.
    async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<(), ServiceWorkerError>;

    /// Look up the response stored for a request.
    async fn match_request(&self, request: &Request)
        -> Result<Option<Response>, ServiceWorkerError>;

    /// Keys of every stored entry.
    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError>;

    /// Remove the entry for a request. Returns whether one existed.
    async fn delete(&self, request: &Request) -> Result<bool, ServiceWorkerError>;
}

/// The active worker's script, kept so a restarted host can serve the cached
/// shell before (or without) reaching the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRegistration {
    pub script_url: String,
    pub script: String,
}

/// The set of named cache generations.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a generation, creating it if it does not exist.
    async fn open(&self, name: &str) -> Result<CacheHandle, ServiceWorkerError>;

    /// Open a generation only if it exists. Never creates one.
    async fn open_existing(&self, name: &str) -> Result<Option<CacheHandle>, ServiceWorkerError> {
        if self.has(name).await? {
            self.open(name).await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Check if a generation exists.
    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Names of every existing generation.
    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError>;

    /// Delete a generation. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// The persisted registration, if any.
    async fn load_registration(&self) -> Result<Option<StoredRegistration>, ServiceWorkerError> {
        Ok(None)
    }

    /// Persist the registration. Engines without persistence drop it.
    async fn save_registration(&self, _record: &StoredRegistration) -> Result<(), ServiceWorkerError> {
        Ok(())
    }
}

/// Reject pairs that must never be persisted.
pub(crate) fn check_storable(request: &Request, response: &Response) -> Result<(), ServiceWorkerError> {
    if request.method != Method::GET {
        return Err(ServiceWorkerError::CacheError(format!(
            "cannot cache {} request for {}",
            request.method, request.url
        )));
    }
    if !response.is_cacheable() {
        return Err(ServiceWorkerError::CacheError(format!(
            "response for {} is not cacheable (status {}, type {:?}, redirected {})",
            request.url, response.status, response.response_type, response.redirected
        )));
    }
    Ok(())
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
