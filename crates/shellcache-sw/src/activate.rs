//! Activate handler.

use tracing::info;

use crate::global::WorkerHost;
use crate::store::CacheStore;

/// Result of an activate event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateOutcome {
    pub cache_name: String,
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Deletes stale generations, then claims every open client.
#[derive(Clone)]
pub struct ActivateHandler {
    cache_name: String,
    store: CacheStore,
}

impl ActivateHandler {
    pub fn new(cache_name: impl Into<String>, store: CacheStore) -> Self {
        Self {
            cache_name: cache_name.into(),
            store,
        }
    }

    pub async fn handle(&self, host: &dyn WorkerHost) -> ActivateOutcome {
        let report = self.store.delete_all_except(&self.cache_name).await;
        host.claim_clients();

        info!(
            cache = %self.cache_name,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Generation activated"
        );

        ActivateOutcome {
            cache_name: self.cache_name.clone(),
            deleted: report.deleted,
            failed: report.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::HostSignals;
    use crate::storage::{CacheHandle, CacheStorage, MemoryCacheStorage};
    use crate::{Result, ServiceWorkerError};
    use async_trait::async_trait;
    use shellcache_net::RouteFetcher;
    use std::sync::Arc;
    use url::Url;

    /// Memory storage that refuses to delete one generation.
    struct StickyStorage {
        inner: MemoryCacheStorage,
        sticky: &'static str,
    }

    #[async_trait]
    impl CacheStorage for StickyStorage {
        async fn open(&self, name: &str) -> Result<CacheHandle> {
            self.inner.open(name).await
        }
        async fn has(&self, name: &str) -> Result<bool> {
            self.inner.has(name).await
        }
        async fn keys(&self) -> Result<Vec<String>> {
            self.inner.keys().await
        }
        async fn delete(&self, name: &str) -> Result<bool> {
            if name == self.sticky {
                return Err(ServiceWorkerError::CacheError("locked".to_string()));
            }
            self.inner.delete(name).await
        }
    }

    fn fetcher() -> Arc<RouteFetcher> {
        Arc::new(RouteFetcher::new(Url::parse("https://app.example.com/").unwrap()))
    }

    #[tokio::test]
    async fn test_activate_deletes_stale_and_claims() {
        let storage = Arc::new(MemoryCacheStorage::new());
        for name in ["shellcache-v1", "shellcache-v2"] {
            storage.open(name).await.unwrap();
        }
        let handler = ActivateHandler::new("shellcache-v2", CacheStore::new(storage.clone(), fetcher()));
        let signals = HostSignals::default();

        let outcome = handler.handle(&signals).await;

        assert_eq!(outcome.deleted, vec!["shellcache-v1".to_string()]);
        assert_eq!(storage.keys().await.unwrap(), vec!["shellcache-v2".to_string()]);
        assert!(signals.take_claim());
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_block_activation() {
        let storage = Arc::new(StickyStorage {
            inner: MemoryCacheStorage::new(),
            sticky: "shellcache-v1",
        });
        for name in ["shellcache-v0", "shellcache-v1", "shellcache-v2"] {
            storage.open(name).await.unwrap();
        }
        let handler = ActivateHandler::new("shellcache-v2", CacheStore::new(storage.clone(), fetcher()));
        let signals = HostSignals::default();

        let outcome = handler.handle(&signals).await;

        assert_eq!(outcome.deleted, vec!["shellcache-v0".to_string()]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "shellcache-v1");
        assert!(signals.take_claim());
    }
}
