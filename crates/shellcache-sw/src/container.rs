//! The host runtime: registration, lifecycle and routing of page requests.
//!
//! Lifecycle operations (register, update, activation, control messages) are
//! serialized by one mutex, so a generation's install always completes before
//! its activation starts. Activation holds the `activation` gate for writing
//! while the activate event runs; fetch routing takes it for reading, so no
//! request reaches a generation before its activate handler has finished.
//!
//! Each activation persists the worker script through [`CacheStorage`]. A
//! fresh container reinstates that worker, without reinstalling it, the first
//! time a page opens or a registration runs, so a restarted host can serve
//! the cached shell while offline.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shellcache_net::{CacheMode, Fetcher, Request};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::{Client, ClientId, Clients};
use crate::config::{ContainerConfig, WorkerConfig};
use crate::control::ControlOutcome;
use crate::dispatcher::{EventResult, WorkerEvent};
use crate::fetch::{FetchEvent, FetchOutcome, FetchResponse, ResponseSource};
use crate::global::WorkerGlobal;
use crate::storage::{CacheStorage, StoredRegistration};
use crate::store::PopulateReport;
use crate::{Result, ServiceWorkerError};

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Script fetched and parsed.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced).
    Redundant,
}

// ==================== Service Worker ====================

/// A service worker instance.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Cache generation this worker owns.
    pub cache_name: String,

    /// Script bytes, compared on update.
    pub script: Bytes,

    /// Time of last state change.
    pub state_changed_at: Instant,

    global: Arc<WorkerGlobal>,
}

impl ServiceWorker {
    fn new(script_url: Url, script: Bytes, global: Arc<WorkerGlobal>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            state: ServiceWorkerState::Parsed,
            cache_name: global.cache_name().to_string(),
            script,
            state_changed_at: Instant::now(),
            global,
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }

    pub fn config(&self) -> &WorkerConfig {
        self.global.config()
    }

    pub fn global(&self) -> &Arc<WorkerGlobal> {
        &self.global
    }
}

// ==================== Registration ====================

/// The worker registration.
#[derive(Debug, Default)]
pub struct Registration {
    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Last update check time.
    pub last_update_check: Option<Instant>,
}

impl Registration {
    /// The most recently installed worker.
    pub fn newest(&self) -> Option<&ServiceWorker> {
        self.installing
            .as_ref()
            .or(self.waiting.as_ref())
            .or(self.active.as_ref())
    }

    /// Transition installing to waiting. A previously waiting worker is
    /// returned as redundant.
    fn install_complete(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Installed);
        self.waiting.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// Move the waiting worker into the active slot in `Activating` state.
    /// The previously active worker is returned as redundant.
    fn begin_activation(&mut self) -> Option<(ServiceWorker, Option<ServiceWorker>)> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);
        let old = self.active.replace(worker.clone()).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });
        Some((worker, old))
    }

    fn finish_activation(&mut self, id: ServiceWorkerId) {
        if let Some(active) = self.active.as_mut().filter(|w| w.id == id) {
            active.set_state(ServiceWorkerState::Activated);
        }
    }
}

// ==================== Events ====================

/// Events observed by pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    /// A new worker started installing.
    UpdateFound { worker_id: ServiceWorkerId },
    /// A worker changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        state: ServiceWorkerState,
    },
    /// A client got a new controller.
    ControllerChange {
        client_id: ClientId,
        worker_id: ServiceWorkerId,
    },
}

/// Which registration slot a message goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    Active,
    Waiting,
    Installing,
}

// ==================== Service Worker Container ====================

/// Service worker container (navigator.serviceWorker).
pub struct ServiceWorkerContainer {
    config: ContainerConfig,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    registration: RwLock<Registration>,
    clients: RwLock<Clients>,
    events: broadcast::Sender<ContainerEvent>,
    lifecycle: Mutex<()>,
    activation: RwLock<()>,
    restore_attempted: AtomicBool,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(
        config: ContainerConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            storage,
            fetcher,
            registration: RwLock::new(Registration::default()),
            clients: RwLock::new(Clients::new()),
            events,
            lifecycle: Mutex::new(()),
            activation: RwLock::new(()),
            restore_attempted: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    /// Subscribe to container events.
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ContainerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ---------- Registration ----------

    /// Register the worker script at `script_url`.
    ///
    /// Installs a new generation when there is none yet or when the script URL
    /// or bytes differ from the newest one. Returns the newest worker.
    ///
    /// If the script cannot be fetched but a worker is already in place,
    /// including one reinstated from storage, that worker is kept and returned.
    pub async fn register(&self, script_url: Url) -> Result<ServiceWorkerId> {
        let _lifecycle = self.lifecycle.lock().await;
        self.restore_locked().await;
        match self.update_locked(script_url).await {
            Ok(Some(id)) => return Ok(id),
            Ok(None) => {}
            Err(ServiceWorkerError::RegistrationFailed(reason)) => {
                if self.registration.read().await.newest().is_none() {
                    return Err(ServiceWorkerError::RegistrationFailed(reason));
                }
                warn!(reason = %reason, "Worker script unreachable, keeping current registration");
            }
            Err(e) => return Err(e),
        }
        self.registration
            .read()
            .await
            .newest()
            .map(|w| w.id)
            .ok_or_else(|| ServiceWorkerError::NotFound("registration".to_string()))
    }

    /// Re-fetch the newest worker's script. Returns the new worker if the
    /// script changed.
    pub async fn update(&self) -> Result<Option<ServiceWorkerId>> {
        let _lifecycle = self.lifecycle.lock().await;
        let script_url = self.newest_script_url().await?;
        self.update_locked(script_url).await
    }

    async fn newest_script_url(&self) -> Result<Url> {
        self.registration
            .read()
            .await
            .newest()
            .map(|w| w.script_url.clone())
            .ok_or_else(|| ServiceWorkerError::NotFound("registration".to_string()))
    }

    async fn fetch_script(&self, script_url: &Url) -> Result<(WorkerConfig, Bytes)> {
        let request = Request::get(script_url.clone()).cache_mode(CacheMode::Reload);
        let response = self.fetcher.fetch(request).await.map_err(|e| {
            ServiceWorkerError::RegistrationFailed(format!("fetching {script_url}: {e}"))
        })?;
        if !response.ok() {
            return Err(ServiceWorkerError::RegistrationFailed(format!(
                "fetching {script_url}: status {}",
                response.status
            )));
        }

        let text = response
            .text()
            .map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))?;
        let config = WorkerConfig::from_json(&text)
            .map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))?;
        Ok((config, response.body))
    }

    /// Reinstate the persisted worker, if this container has none yet.
    ///
    /// Runs at most once per container. Returns the active worker.
    pub async fn restore(&self) -> Option<ServiceWorkerId> {
        if !self.restore_attempted.load(Ordering::Acquire) {
            let _lifecycle = self.lifecycle.lock().await;
            self.restore_locked().await;
        }
        self.registration.read().await.active.as_ref().map(|w| w.id)
    }

    async fn restore_locked(&self) {
        if self.restore_attempted.load(Ordering::Acquire) {
            return;
        }
        self.reinstate_stored().await;
        // Set only once done, so the fast path in `restore` sees the result.
        self.restore_attempted.store(true, Ordering::Release);
    }

    async fn reinstate_stored(&self) {
        if self.registration.read().await.newest().is_some() {
            return;
        }

        let record = match self.storage.load_registration().await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Could not read stored registration");
                return;
            }
        };
        match self.reinstate(record).await {
            Ok(id) => info!(worker = %id, "Reinstated worker from storage"),
            Err(e) => warn!(error = %e, "Stored registration not usable"),
        }
    }

    /// Put a persisted worker straight into the active slot. Its generation
    /// was populated when it first installed, so no events run.
    async fn reinstate(&self, record: StoredRegistration) -> Result<ServiceWorkerId> {
        let script_url = Url::parse(&record.script_url)
            .map_err(|e| ServiceWorkerError::ScriptError(format!("stored script url: {e}")))?;
        let config = WorkerConfig::from_json(&record.script)
            .map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))?;
        let cache_name = config.cache_name();
        if !self.storage.has(&cache_name).await? {
            return Err(ServiceWorkerError::NotFound(format!(
                "cache generation {cache_name}"
            )));
        }

        let global = WorkerGlobal::new(
            config,
            script_url.clone(),
            self.storage.clone(),
            self.fetcher.clone(),
        )
        .map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))?;
        drop(global.start());

        let mut worker = ServiceWorker::new(script_url, Bytes::from(record.script), Arc::new(global));
        worker.set_state(ServiceWorkerState::Activated);
        let id = worker.id;
        self.registration.write().await.active = Some(worker);
        self.emit(ContainerEvent::StateChange {
            worker_id: id,
            state: ServiceWorkerState::Activated,
        });
        Ok(id)
    }

    async fn persist(&self, worker: &ServiceWorker) {
        let record = StoredRegistration {
            script_url: worker.script_url.to_string(),
            script: String::from_utf8_lossy(&worker.script).into_owned(),
        };
        if let Err(e) = self.storage.save_registration(&record).await {
            warn!(worker = %worker.id, error = %e, "Could not persist registration");
        }
    }

    async fn update_locked(&self, script_url: Url) -> Result<Option<ServiceWorkerId>> {
        let (config, script) = self.fetch_script(&script_url).await?;

        {
            let mut registration = self.registration.write().await;
            registration.last_update_check = Some(Instant::now());
            if let Some(newest) = registration.newest() {
                if newest.script_url == script_url && newest.script == script {
                    debug!(script = %script_url, "Worker script unchanged");
                    return Ok(None);
                }
            }
        }

        let global = WorkerGlobal::new(
            config,
            script_url.clone(),
            self.storage.clone(),
            self.fetcher.clone(),
        )
        .map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))?;
        // Fire and forget: the version only feeds logs.
        drop(global.start());

        let mut worker = ServiceWorker::new(script_url, script, Arc::new(global));
        worker.set_state(ServiceWorkerState::Installing);
        let id = worker.id;
        let global = worker.global.clone();
        info!(worker = %id, cache = %worker.cache_name, script = %worker.script_url, "Installing worker");

        self.registration.write().await.installing = Some(worker);
        self.emit(ContainerEvent::UpdateFound { worker_id: id });
        self.emit(ContainerEvent::StateChange {
            worker_id: id,
            state: ServiceWorkerState::Installing,
        });

        // Install never fails; a degraded outcome is already logged.
        global.dispatch(WorkerEvent::Install).await;

        let replaced = self.registration.write().await.install_complete();
        if let Some(old) = replaced {
            self.emit(ContainerEvent::StateChange {
                worker_id: old.id,
                state: ServiceWorkerState::Redundant,
            });
        }
        self.emit(ContainerEvent::StateChange {
            worker_id: id,
            state: ServiceWorkerState::Installed,
        });

        if self.should_activate(id).await {
            self.activate_waiting_locked().await;
        } else {
            info!(worker = %id, "Worker installed, waiting for older clients to close");
        }
        Ok(Some(id))
    }

    async fn should_activate(&self, waiting: ServiceWorkerId) -> bool {
        let skip_waiting = {
            let registration = self.registration.read().await;
            match registration.waiting.as_ref() {
                Some(w) if w.id == waiting => w.global.signals().skip_waiting_requested(),
                _ => return false,
            }
        };
        skip_waiting || !self.clients.read().await.any_controlled_by_other(waiting)
    }

    async fn activate_waiting_locked(&self) -> Option<ServiceWorkerId> {
        let gate = self.activation.write().await;

        let (worker, old) = self.registration.write().await.begin_activation()?;
        if let Some(old) = old {
            self.emit(ContainerEvent::StateChange {
                worker_id: old.id,
                state: ServiceWorkerState::Redundant,
            });
        }
        self.emit(ContainerEvent::StateChange {
            worker_id: worker.id,
            state: ServiceWorkerState::Activating,
        });

        worker.global.dispatch(WorkerEvent::Activate).await;

        self.registration.write().await.finish_activation(worker.id);
        self.emit(ContainerEvent::StateChange {
            worker_id: worker.id,
            state: ServiceWorkerState::Activated,
        });
        drop(gate);

        info!(worker = %worker.id, cache = %worker.cache_name, "Worker activated");
        self.persist(&worker).await;

        if worker.global.signals().take_claim() {
            self.claim(worker.id).await;
        }
        Some(worker.id)
    }

    /// Make `worker` the controller of every open client.
    async fn claim(&self, worker: ServiceWorkerId) {
        let changed = self.clients.write().await.claim(worker);
        for client_id in changed {
            self.emit(ContainerEvent::ControllerChange {
                client_id,
                worker_id: worker,
            });
        }
    }

    // ---------- Workers ----------

    pub async fn active_worker(&self) -> Option<ServiceWorker> {
        self.registration.read().await.active.clone()
    }

    pub async fn waiting_worker(&self) -> Option<ServiceWorker> {
        self.registration.read().await.waiting.clone()
    }

    pub async fn installing_worker(&self) -> Option<ServiceWorker> {
        self.registration.read().await.installing.clone()
    }

    async fn worker(&self, target: MessageTarget) -> Option<ServiceWorker> {
        let registration = self.registration.read().await;
        match target {
            MessageTarget::Active => registration.active.clone(),
            MessageTarget::Waiting => registration.waiting.clone(),
            MessageTarget::Installing => registration.installing.clone(),
        }
    }

    // ---------- Messages ----------

    /// Deliver a control message and apply whatever it asked of the host.
    pub async fn post_message(&self, target: MessageTarget, message: Value) -> Result<ControlOutcome> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(worker) = self.worker(target).await else {
            // Another tab may have consumed the slot already.
            debug!(?target, "No worker in slot, message dropped");
            return Ok(ControlOutcome::Ignored(format!("no {target:?} worker")));
        };

        let outcome = match worker.global.dispatch(WorkerEvent::Message(message)).await {
            EventResult::Message(outcome) => outcome,
            other => {
                return Err(ServiceWorkerError::StateError(format!(
                    "unexpected message result: {other:?}"
                )))
            }
        };

        let waiting_skips = self
            .registration
            .read()
            .await
            .waiting
            .as_ref()
            .is_some_and(|w| w.global.signals().skip_waiting_requested());
        if waiting_skips {
            self.activate_waiting_locked().await;
        }

        if worker.global.signals().take_update() {
            match self.update_locked(worker.script_url.clone()).await {
                Ok(Some(id)) => info!(worker = %id, "Update check installed a new worker"),
                Ok(None) => debug!("Update check found no changes"),
                Err(e) => warn!(error = %e, "Update check failed"),
            }
        }

        Ok(outcome)
    }

    // ---------- Fetch ----------

    /// Route a page request.
    ///
    /// Controlled clients go through the active worker; everything else goes
    /// straight to the network.
    pub async fn fetch(&self, client_id: Option<&ClientId>, request: Request) -> Result<FetchOutcome> {
        let worker = {
            let _gate = self.activation.read().await;
            let controlled = match client_id {
                Some(id) => self
                    .clients
                    .read()
                    .await
                    .get(id)
                    .is_some_and(|c| c.controller.is_some()),
                None => false,
            };
            if controlled {
                self.registration.read().await.active.clone()
            } else {
                None
            }
        };

        let Some(worker) = worker else {
            let response = self.fetcher.fetch(request).await?;
            return Ok(FetchOutcome {
                response: FetchResponse {
                    response,
                    source: ResponseSource::Network,
                },
                revalidation: None,
            });
        };

        let mut event = FetchEvent::new(request);
        event.client_id = client_id.cloned();
        match worker.global.dispatch(WorkerEvent::Fetch(event)).await {
            EventResult::Fetched(outcome) => Ok(outcome),
            other => Err(ServiceWorkerError::StateError(format!(
                "unexpected fetch result: {other:?}"
            ))),
        }
    }

    // ---------- Periodic sync ----------

    /// Fire a periodic sync event at the active worker.
    pub async fn dispatch_periodic_sync(&self, tag: &str) -> Option<PopulateReport> {
        let worker = self.active_worker().await?;
        match worker
            .global
            .dispatch(WorkerEvent::PeriodicSync {
                tag: tag.to_string(),
            })
            .await
        {
            EventResult::PeriodicSync(report) => report,
            _ => None,
        }
    }

    /// Fire `tag` every `interval` until the container is dropped.
    ///
    /// Returns `None` when periodic sync is not granted.
    pub fn start_periodic_sync(
        self: &Arc<Self>,
        tag: impl Into<String>,
        interval: Duration,
    ) -> Option<JoinHandle<()>> {
        let tag = tag.into();
        if !self.config.periodic_sync_granted {
            info!(tag = %tag, "Periodic sync not granted, skipping registration");
            return None;
        }

        let container: Weak<Self> = Arc::downgrade(self);
        info!(tag = %tag, ?interval, "Periodic sync registered");
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(container) = container.upgrade() else {
                    break;
                };
                container.dispatch_periodic_sync(&tag).await;
            }
        }))
    }

    // ---------- Clients ----------

    /// Open a page. It is controlled from the start if a worker is active,
    /// including one reinstated from storage.
    pub async fn open_client(&self, url: Url) -> Client {
        let active = self.restore().await;
        let mut clients = self.clients.write().await;
        match active {
            Some(id) => clients.open_controlled(url, id),
            None => clients.open(url),
        }
    }

    pub async fn close_client(&self, id: &ClientId) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    pub async fn client(&self, id: &ClientId) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn clients(&self) -> Vec<Client> {
        self.clients.read().await.all()
    }
}
