//! Lifecycle event routing.
//!
//! An [`EventRouter`] maps each [`EventKind`] to one async handler. Handlers
//! receive the event and the [`WorkerHost`] they may signal; they always
//! produce an [`EventResult`], never an error.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use hashbrown::HashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::activate::ActivateOutcome;
use crate::control::ControlOutcome;
use crate::fetch::{FetchEvent, FetchOutcome};
use crate::global::WorkerHost;
use crate::install::InstallOutcome;
use crate::store::PopulateReport;

/// Kind of a worker event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Install,
    Activate,
    Fetch,
    Message,
    PeriodicSync,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Install => "install",
            EventKind::Activate => "activate",
            EventKind::Fetch => "fetch",
            EventKind::Message => "message",
            EventKind::PeriodicSync => "periodicsync",
        };
        f.write_str(name)
    }
}

/// An event delivered to a worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(FetchEvent),
    Message(Value),
    PeriodicSync { tag: String },
}

impl WorkerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WorkerEvent::Install => EventKind::Install,
            WorkerEvent::Activate => EventKind::Activate,
            WorkerEvent::Fetch(_) => EventKind::Fetch,
            WorkerEvent::Message(_) => EventKind::Message,
            WorkerEvent::PeriodicSync { .. } => EventKind::PeriodicSync,
        }
    }
}

/// What a handler produced.
#[derive(Debug)]
pub enum EventResult {
    Installed(InstallOutcome),
    Activated(ActivateOutcome),
    Fetched(FetchOutcome),
    Message(ControlOutcome),
    /// `None` when the tag was not ours.
    PeriodicSync(Option<PopulateReport>),
    Unhandled(EventKind),
}

type EventHandler =
    Box<dyn Fn(WorkerEvent, Arc<dyn WorkerHost>) -> BoxFuture<'static, EventResult> + Send + Sync>;

/// Maps event kinds to handlers.
#[derive(Default)]
pub struct EventRouter {
    handlers: HashMap<EventKind, EventHandler>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `kind` to `handler`, replacing any previous handler.
    pub fn on<F, Fut>(mut self, kind: EventKind, handler: F) -> Self
    where
        F: Fn(WorkerEvent, Arc<dyn WorkerHost>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EventResult> + Send + 'static,
    {
        self.handlers
            .insert(kind, Box::new(move |event, host| Box::pin(handler(event, host))));
        self
    }

    pub fn handles(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub async fn dispatch(&self, event: WorkerEvent, host: Arc<dyn WorkerHost>) -> EventResult {
        let kind = event.kind();
        match self.handlers.get(&kind) {
            Some(handler) => {
                debug!(event = %kind, "Dispatching worker event");
                handler(event, host).await
            }
            None => {
                warn!(event = %kind, "No handler registered");
                EventResult::Unhandled(kind)
            }
        }
    }
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRouter")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::HostSignals;

    fn host() -> Arc<dyn WorkerHost> {
        Arc::new(HostSignals::default())
    }

    #[tokio::test]
    async fn test_unrouted_kind_is_unhandled() {
        let router = EventRouter::new();
        let result = router.dispatch(WorkerEvent::Activate, host()).await;
        assert!(matches!(result, EventResult::Unhandled(EventKind::Activate)));
    }

    #[tokio::test]
    async fn test_routes_by_kind_and_passes_host() {
        let router = EventRouter::new().on(EventKind::PeriodicSync, |event, host| async move {
            host.request_update();
            match event {
                WorkerEvent::PeriodicSync { tag } if tag == "update-cache" => {
                    EventResult::PeriodicSync(Some(PopulateReport::default()))
                }
                _ => EventResult::PeriodicSync(None),
            }
        });
        assert!(router.handles(EventKind::PeriodicSync));
        assert!(!router.handles(EventKind::Install));

        let signals = Arc::new(HostSignals::default());
        let result = router
            .dispatch(
                WorkerEvent::PeriodicSync {
                    tag: "update-cache".to_string(),
                },
                signals.clone(),
            )
            .await;

        assert!(matches!(result, EventResult::PeriodicSync(Some(_))));
        assert!(signals.take_update());
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(EventKind::PeriodicSync.to_string(), "periodicsync");
        assert_eq!(
            WorkerEvent::Message(serde_json::json!({"type": "SKIP_WAITING"})).kind(),
            EventKind::Message
        );
    }
}
