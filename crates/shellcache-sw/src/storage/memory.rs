//! In-memory cache storage.

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use shellcache_net::{Request, Response};
use tokio::sync::RwLock;
use tracing::trace;

use super::{check_storable, Cache, CacheEntry, CacheHandle, CacheStorage, StoredRegistration};
use crate::ServiceWorkerError;

/// A cache generation held in memory.
#[derive(Debug, Default)]
pub struct MemoryCache {
    name: String,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, request: &Request, response: Response) -> Result<(), ServiceWorkerError> {
        check_storable(request, &response)?;
        let key = request.cache_key();
        trace!(cache = %self.name, key = %key, "Cache put");
        self.entries
            .write()
            .await
            .insert(key.clone(), CacheEntry::new(key, response));
        Ok(())
    }

    async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<(), ServiceWorkerError> {
        for (request, response) in &entries {
            check_storable(request, response)?;
        }

        let mut map = self.entries.write().await;
        for (request, response) in entries {
            let key = request.cache_key();
            map.insert(key.clone(), CacheEntry::new(key, response));
        }
        Ok(())
    }

    async fn match_request(
        &self,
        request: &Request,
    ) -> Result<Option<Response>, ServiceWorkerError> {
        Ok(self
            .entries
            .read()
            .await
            .get(&request.cache_key())
            .map(|entry| entry.response.clone()))
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn delete(&self, request: &Request) -> Result<bool, ServiceWorkerError> {
        Ok(self
            .entries
            .write()
            .await
            .remove(&request.cache_key())
            .is_some())
    }
}

/// Cache storage held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Arc<MemoryCache>>>,
    registration: RwLock<Option<StoredRegistration>>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<CacheHandle, ServiceWorkerError> {
        let mut caches = self.caches.write().await;
        let cache: CacheHandle = caches
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryCache::new(name)))
            .clone();
        Ok(cache)
    }

    async fn open_existing(&self, name: &str) -> Result<Option<CacheHandle>, ServiceWorkerError> {
        let caches = self.caches.read().await;
        Ok(caches.get(name).map(|cache| {
            let handle: CacheHandle = cache.clone();
            handle
        }))
    }

    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.caches.write().await.remove(name).is_some())
    }

    async fn load_registration(&self) -> Result<Option<StoredRegistration>, ServiceWorkerError> {
        Ok(self.registration.read().await.clone())
    }

    async fn save_registration(&self, record: &StoredRegistration) -> Result<(), ServiceWorkerError> {
        *self.registration.write().await = Some(record.clone());
        Ok(())
    }
}
