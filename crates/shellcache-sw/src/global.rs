//! The worker global scope: one generation's configuration, handlers and the
//! signals it raises towards the host.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use shellcache_net::Fetcher;
use tokio::task::JoinHandle;
use tracing::info;
use url::Url;

use crate::activate::ActivateHandler;
use crate::config::WorkerConfig;
use crate::control::ControlChannel;
use crate::dispatcher::{EventKind, EventResult, EventRouter, WorkerEvent};
use crate::fetch::FetchInterceptor;
use crate::install::{InstallHandler, Precacher};
use crate::manifest::AssetManifest;
use crate::offline::OfflinePage;
use crate::periodic::PeriodicRefresh;
use crate::storage::CacheStorage;
use crate::store::CacheStore;
use crate::version::VersionResolver;
use crate::Result;

/// Requests a worker can make of the runtime hosting it.
///
/// Calls only record the request; the host applies it once the current event
/// handler has returned.
pub trait WorkerHost: Send + Sync {
    /// Activate without waiting for older clients to close.
    fn skip_waiting(&self);

    /// Take control of every open client after activation.
    fn claim_clients(&self);

    /// Re-fetch the worker script and install it if it changed.
    fn request_update(&self);
}

/// Recorded [`WorkerHost`] requests.
#[derive(Debug, Default)]
pub struct HostSignals {
    skip_waiting: AtomicBool,
    claim: AtomicBool,
    update: AtomicBool,
}

impl HostSignals {
    /// Sticky for the lifetime of the worker.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Consume a pending claim request.
    pub fn take_claim(&self) -> bool {
        self.claim.swap(false, Ordering::SeqCst)
    }

    /// Consume a pending update request.
    pub fn take_update(&self) -> bool {
        self.update.swap(false, Ordering::SeqCst)
    }
}

impl WorkerHost for HostSignals {
    fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    fn claim_clients(&self) {
        self.claim.store(true, Ordering::SeqCst);
    }

    fn request_update(&self) {
        self.update.store(true, Ordering::SeqCst);
    }
}

/// One worker generation, ready to receive events.
pub struct WorkerGlobal {
    config: WorkerConfig,
    script_url: Url,
    base: Url,
    cache_name: String,
    signals: Arc<HostSignals>,
    router: EventRouter,
    version: VersionResolver,
}

impl WorkerGlobal {
    /// Build the generation described by `config`, loaded from `script_url`.
    pub fn new(
        config: WorkerConfig,
        script_url: Url,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        config.validate()?;
        let base = config.resolve_base(&script_url)?;
        let cache_name = config.cache_name();
        let manifest = AssetManifest::resolve(&base, &config.assets);

        let store = CacheStore::new(storage, fetcher.clone()).with_retry(config.asset_retry.into());
        let precacher = Precacher::new(cache_name.clone(), manifest, store.clone());

        let install = Arc::new(InstallHandler::new(
            precacher.clone(),
            config.skip_waiting_on_install,
        ));
        let activate = Arc::new(ActivateHandler::new(cache_name.clone(), store.clone()));
        let fetch = Arc::new(FetchInterceptor::new(
            cache_name.clone(),
            store,
            fetcher.clone(),
            OfflinePage::new(config.offline_title.clone()),
        ));
        let control = Arc::new(ControlChannel::new(precacher.clone()));
        let periodic = Arc::new(PeriodicRefresh::new(
            config.periodic_sync_tag.clone(),
            precacher,
        ));

        let router = EventRouter::new()
            .on(EventKind::Install, move |_, host| {
                let install = install.clone();
                async move { EventResult::Installed(install.handle(host.as_ref()).await) }
            })
            .on(EventKind::Activate, move |_, host| {
                let activate = activate.clone();
                async move { EventResult::Activated(activate.handle(host.as_ref()).await) }
            })
            .on(EventKind::Fetch, move |event, _| {
                let fetch = fetch.clone();
                async move {
                    match event {
                        WorkerEvent::Fetch(event) => EventResult::Fetched(fetch.handle(event).await),
                        other => EventResult::Unhandled(other.kind()),
                    }
                }
            })
            .on(EventKind::Message, move |event, host| {
                let control = control.clone();
                async move {
                    match event {
                        WorkerEvent::Message(message) => {
                            EventResult::Message(control.handle(&message, host.as_ref()).await)
                        }
                        other => EventResult::Unhandled(other.kind()),
                    }
                }
            })
            .on(EventKind::PeriodicSync, move |event, _| {
                let periodic = periodic.clone();
                async move {
                    match event {
                        WorkerEvent::PeriodicSync { tag } => {
                            EventResult::PeriodicSync(periodic.handle(&tag).await)
                        }
                        other => EventResult::Unhandled(other.kind()),
                    }
                }
            });

        let version = VersionResolver::new(fetcher, &base, &config.version_manifest);

        Ok(Self {
            config,
            script_url,
            base,
            cache_name,
            signals: Arc::new(HostSignals::default()),
            router,
            version,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn script_url(&self) -> &Url {
        &self.script_url
    }

    /// Base URL shell assets resolve against.
    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn signals(&self) -> &HostSignals {
        &self.signals
    }

    pub fn version_resolver(&self) -> &VersionResolver {
        &self.version
    }

    /// Resolve and log the application version in the background.
    pub fn start(&self) -> JoinHandle<String> {
        let resolver = self.version.clone();
        let cache_name = self.cache_name.clone();
        tokio::spawn(async move {
            let version = resolver.resolve().await;
            info!(cache = %cache_name, version = %version, "Worker started");
            version
        })
    }

    /// Deliver an event and wait for its handler.
    pub async fn dispatch(&self, event: WorkerEvent) -> EventResult {
        let host: Arc<dyn WorkerHost> = self.signals.clone();
        self.router.dispatch(event, host).await
    }
}

impl std::fmt::Debug for WorkerGlobal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerGlobal")
            .field("script_url", &self.script_url.as_str())
            .field("cache_name", &self.cache_name)
            .field("router", &self.router)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchEvent;
    use crate::storage::MemoryCacheStorage;
    use serde_json::json;
    use shellcache_net::{Request, RouteFetcher};

    fn origin() -> Url {
        Url::parse("https://app.example.com/").unwrap()
    }

    fn worker(fetcher: Arc<RouteFetcher>, storage: Arc<MemoryCacheStorage>) -> WorkerGlobal {
        let config = WorkerConfig {
            cache_version: 2,
            assets: vec!["index.html".to_string()],
            ..Default::default()
        };
        WorkerGlobal::new(config, origin().join("/sw.json").unwrap(), storage, fetcher).unwrap()
    }

    #[test]
    fn test_signals_take_once() {
        let signals = HostSignals::default();
        signals.claim_clients();
        assert!(signals.take_claim());
        assert!(!signals.take_claim());

        signals.skip_waiting();
        assert!(signals.skip_waiting_requested());
        assert!(signals.skip_waiting_requested());
    }

    #[tokio::test]
    async fn test_dispatch_install_then_fetch() {
        let fetcher = Arc::new(RouteFetcher::new(origin()).with_route("/index.html", 200, "<html/>"));
        let global = worker(fetcher.clone(), Arc::new(MemoryCacheStorage::new()));
        assert_eq!(global.cache_name(), "shellcache-v2");

        let EventResult::Installed(outcome) = global.dispatch(WorkerEvent::Install).await else {
            panic!("install not routed");
        };
        assert!(!outcome.is_degraded());
        assert!(global.signals().skip_waiting_requested());

        let event = FetchEvent::new(Request::get(origin().join("/index.html").unwrap()));
        let EventResult::Fetched(outcome) = global.dispatch(WorkerEvent::Fetch(event)).await else {
            panic!("fetch not routed");
        };
        assert!(outcome.response.from_cache());
    }

    #[tokio::test]
    async fn test_dispatch_message_and_periodic_sync() {
        let fetcher = Arc::new(RouteFetcher::new(origin()).with_route("/index.html", 200, "<html/>"));
        let global = worker(fetcher, Arc::new(MemoryCacheStorage::new()));

        let result = global
            .dispatch(WorkerEvent::Message(json!({"type": "CHECK_FOR_UPDATES"})))
            .await;
        assert!(matches!(result, EventResult::Message(_)));
        assert!(global.signals().take_update());

        let result = global
            .dispatch(WorkerEvent::PeriodicSync {
                tag: "update-cache".to_string(),
            })
            .await;
        assert!(matches!(result, EventResult::PeriodicSync(Some(_))));
    }

    #[tokio::test]
    async fn test_start_resolves_version() {
        let fetcher = Arc::new(
            RouteFetcher::new(origin())
                .with_route("/manifest.json", 200, r#"{"version":"4.0.1"}"#),
        );
        let global = worker(fetcher, Arc::new(MemoryCacheStorage::new()));
        assert_eq!(global.start().await.unwrap(), "4.0.1");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = WorkerConfig {
            cache_prefix: "bad/prefix".to_string(),
            ..Default::default()
        };
        let result = WorkerGlobal::new(
            config,
            origin().join("/sw.json").unwrap(),
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(RouteFetcher::new(origin())),
        );
        assert!(result.is_err());
    }
}
