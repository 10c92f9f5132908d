//! # ShellCache Service Worker
//!
//! Offline application-shell caching for web dashboards, run as a
//! service-worker-style background worker on a tokio runtime.
//!
//! ## Features
//!
//! - **Versioned generations**: each deployed build caches into its own named
//!   generation; activation deletes every other one.
//! - **Tolerant install**: a single missing asset never aborts caching of the
//!   others.
//! - **Cache-first fetch**: answers from cache immediately and revalidates in a
//!   spawned background task; synthesizes an offline document or a 503 when both
//!   cache and network fail.
//! - **Control channel**: `SKIP_WAITING`, `CHECK_FOR_UPDATES` and
//!   `REFRESH_CACHE` messages from pages.
//! - **Periodic refresh**: best-effort re-population on a timer.
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (navigator.serviceWorker)
//!     │
//!     ├── Registration
//!     │       ├── installing (ServiceWorker + WorkerGlobal)
//!     │       ├── waiting    (ServiceWorker + WorkerGlobal)
//!     │       └── active     (ServiceWorker + WorkerGlobal)
//!     ├── Clients ── ControllerChange ──▶ Page (ReloadGuard)
//!     └── CacheStorage (caches)
//!             └── "shellcache-v3" (Cache)
//!                     └── Request → Response
//!
//! WorkerGlobal
//!     └── EventRouter
//!             ├── install       → InstallHandler → Precacher → CacheStore
//!             ├── activate      → ActivateHandler
//!             ├── fetch         → FetchInterceptor
//!             ├── message       → ControlChannel
//!             └── periodicsync  → PeriodicRefresh
//! ```

use shellcache_common::ShellCacheError;
use shellcache_net::NetError;
use thiserror::Error;

pub mod activate;
pub mod clients;
pub mod config;
pub mod container;
pub mod control;
pub mod dispatcher;
pub mod fetch;
pub mod global;
pub mod install;
pub mod manifest;
pub mod offline;
pub mod page;
pub mod periodic;
pub mod storage;
pub mod store;
pub mod version;

pub use activate::{ActivateHandler, ActivateOutcome};
pub use clients::{Client, ClientId, Clients};
pub use config::{ContainerConfig, WorkerConfig};
pub use container::{
    ContainerEvent, MessageTarget, Registration, ServiceWorker, ServiceWorkerContainer,
    ServiceWorkerId, ServiceWorkerState,
};
pub use control::{ControlChannel, ControlMessage, ControlOutcome};
pub use dispatcher::{EventKind, EventResult, EventRouter, WorkerEvent};
pub use fetch::{
    FetchEvent, FetchInterceptor, FetchOutcome, FetchResponse, ResponseSource, Revalidation,
    RevalidationResult,
};
pub use global::{HostSignals, WorkerGlobal, WorkerHost};
pub use install::{InstallHandler, InstallOutcome, Precacher};
pub use manifest::AssetManifest;
pub use offline::{OfflinePage, OFFLINE_FALLBACK_HEADER};
pub use page::{registration_url, Page, ReloadGuard};
pub use periodic::PeriodicRefresh;
pub use storage::{
    Cache, CacheHandle, CacheStorage, DiskCacheStorage, MemoryCacheStorage, StoredRegistration,
};
pub use store::{CacheStore, DeletionReport, PopulateReport};
pub use version::VersionResolver;

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Invalid state: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] ShellCacheError),
}

/// Result type for service worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
