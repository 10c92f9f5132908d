//! Page-side helpers: worker registration and the reload-once listener.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use shellcache_net::Request;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info};
use url::Url;

use crate::clients::ClientId;
use crate::container::{ContainerEvent, MessageTarget, ServiceWorkerContainer, ServiceWorkerId};
use crate::control::ControlOutcome;
use crate::fetch::{FetchOutcome, FetchResponse};
use crate::offline::is_offline_fallback;
use crate::version::VersionResolver;
use crate::Result;

/// Build the cache-busting registration URL: `script?v=<version>&t=<timestamp>`.
///
/// Existing `v` and `t` parameters are replaced; any others are kept.
pub fn registration_url(script: &Url, version: &str, timestamp_ms: u64) -> Url {
    let kept: Vec<(String, String)> = script
        .query_pairs()
        .filter(|(k, _)| k != "v" && k != "t")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut url = script.clone();
    url.set_query(None);
    url.query_pairs_mut()
        .extend_pairs(kept)
        .append_pair("v", version)
        .append_pair("t", &timestamp_ms.to_string());
    url
}

/// "Already reloading" flag. Only the first [`ReloadGuard::try_begin`] after a
/// reset succeeds.
#[derive(Debug, Default)]
pub struct ReloadGuard {
    reloading: AtomicBool,
}

impl ReloadGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self) -> bool {
        !self.reloading.swap(true, Ordering::SeqCst)
    }

    /// Called once a fresh document has loaded.
    pub fn reset(&self) {
        self.reloading.store(false, Ordering::SeqCst);
    }

    pub fn is_reloading(&self) -> bool {
        self.reloading.load(Ordering::SeqCst)
    }
}

/// One open tab of the application.
pub struct Page {
    container: Arc<ServiceWorkerContainer>,
    client_id: ClientId,
    url: Url,
    events: broadcast::Receiver<ContainerEvent>,
    guard: ReloadGuard,
    reloads: usize,
    showing_offline: bool,
}

impl Page {
    /// Open a tab at `url`. Nothing is loaded until [`Page::load`].
    pub async fn open(container: Arc<ServiceWorkerContainer>, url: Url) -> Self {
        let client = container.open_client(url.clone()).await;
        let events = container.subscribe();
        Self {
            container,
            client_id: client.id,
            url,
            events,
            guard: ReloadGuard::new(),
            reloads: 0,
            showing_offline: false,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Number of reloads triggered by this page's listeners.
    pub fn reload_count(&self) -> usize {
        self.reloads
    }

    pub fn is_showing_offline(&self) -> bool {
        self.showing_offline
    }

    pub async fn controller(&self) -> Option<ServiceWorkerId> {
        self.container
            .client(&self.client_id)
            .await
            .and_then(|c| c.controller)
    }

    /// Register `script` with a version and timestamp cache-buster.
    ///
    /// The version comes from `version_manifest`, resolved against the script;
    /// an unresolvable version registers with an empty `v`.
    pub async fn register(&self, script: &Url, version_manifest: &str) -> Result<ServiceWorkerId> {
        let resolver =
            VersionResolver::new(self.container.fetcher().clone(), script, version_manifest);
        let version = resolver.resolve().await;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let url = registration_url(script, &version, timestamp);
        info!(client = %self.client_id, script = %url, "Registering worker");
        self.container.register(url).await
    }

    /// Load (or reload) the document.
    pub async fn load(&mut self) -> Result<FetchResponse> {
        // Events queued for the previous document die with it.
        self.events = self.container.subscribe();
        let outcome = self
            .container
            .fetch(Some(&self.client_id), Request::navigate(self.url.clone()))
            .await?;
        self.showing_offline = is_offline_fallback(&outcome.response.response);
        self.guard.reset();
        debug!(client = %self.client_id, offline = self.showing_offline, "Document loaded");
        Ok(outcome.response)
    }

    async fn reload(&mut self) -> Result<FetchResponse> {
        self.reloads += 1;
        info!(client = %self.client_id, reloads = self.reloads, "Reloading page");
        self.load().await
    }

    /// React to one container event. Returns whether a reload happened.
    pub async fn handle_event(&mut self, event: &ContainerEvent) -> Result<bool> {
        match event {
            ContainerEvent::ControllerChange { client_id, .. } if *client_id == self.client_id => {
                if !self.guard.try_begin() {
                    debug!(client = %self.client_id, "Reload already in progress");
                    return Ok(false);
                }
                self.reload().await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Drain pending container events. Returns the number of reloads.
    pub async fn pump_events(&mut self) -> Result<usize> {
        let mut reloads = 0;
        loop {
            let event = match self.events.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!(client = %self.client_id, skipped, "Page event listener lagged");
                    continue;
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            };
            if self.handle_event(&event).await? {
                reloads += 1;
            }
        }
        Ok(reloads)
    }

    /// Connectivity came back: reload if the offline document is showing.
    pub async fn on_online(&mut self) -> Result<bool> {
        if !self.showing_offline || !self.guard.try_begin() {
            return Ok(false);
        }
        self.reload().await?;
        Ok(true)
    }

    pub async fn post_message(&self, target: MessageTarget, message: Value) -> Result<ControlOutcome> {
        self.container.post_message(target, message).await
    }

    /// Issue a sub-resource request from this page.
    pub async fn fetch(&self, request: Request) -> Result<FetchOutcome> {
        self.container.fetch(Some(&self.client_id), request).await
    }

    /// Close the tab.
    pub async fn close(self) {
        self.container.close_client(&self.client_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_url_appends_params() {
        let script = Url::parse("https://app.example.com/admin/sw.json").unwrap();
        let url = registration_url(&script, "1.4.2", 1700000000000);
        assert_eq!(
            url.as_str(),
            "https://app.example.com/admin/sw.json?v=1.4.2&t=1700000000000"
        );
    }

    #[test]
    fn test_registration_url_replaces_params() {
        let script = Url::parse("https://app.example.com/sw.json?v=old&scope=admin&t=1").unwrap();
        let url = registration_url(&script, "", 2);
        assert_eq!(url.as_str(), "https://app.example.com/sw.json?scope=admin&v=&t=2");
    }

    #[test]
    fn test_reload_guard_once_until_reset() {
        let guard = ReloadGuard::new();
        assert!(guard.try_begin());
        assert!(!guard.try_begin());
        assert!(guard.is_reloading());

        guard.reset();
        assert!(guard.try_begin());
    }
}
