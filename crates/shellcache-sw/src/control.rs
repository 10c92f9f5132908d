//! Control messages from pages.
//!
//! Wire format is a JSON object with a `type` discriminator:
//!
//! | type | effect |
//! |---|---|
//! | `SKIP_WAITING` | promote the waiting generation |
//! | `CHECK_FOR_UPDATES` | re-fetch the worker script |
//! | `REFRESH_CACHE` | re-populate the current generation |
//!
//! Anything else is logged and ignored.

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::global::WorkerHost;
use crate::install::Precacher;
use crate::store::PopulateReport;

/// A parsed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    SkipWaiting,
    CheckForUpdates,
    RefreshCache,
    /// Unrecognized or missing `type`.
    Unknown(String),
}

impl ControlMessage {
    pub const SKIP_WAITING: &'static str = "SKIP_WAITING";
    pub const CHECK_FOR_UPDATES: &'static str = "CHECK_FOR_UPDATES";
    pub const REFRESH_CACHE: &'static str = "REFRESH_CACHE";

    /// Parse a message envelope. Never fails.
    pub fn from_json(value: &Value) -> Self {
        match value.get("type").and_then(Value::as_str) {
            Some(Self::SKIP_WAITING) => Self::SkipWaiting,
            Some(Self::CHECK_FOR_UPDATES) => Self::CheckForUpdates,
            Some(Self::REFRESH_CACHE) => Self::RefreshCache,
            Some(other) => Self::Unknown(other.to_string()),
            None => Self::Unknown(String::new()),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::SkipWaiting => Self::SKIP_WAITING,
            Self::CheckForUpdates => Self::CHECK_FOR_UPDATES,
            Self::RefreshCache => Self::REFRESH_CACHE,
            Self::Unknown(kind) => kind.as_str(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({ "type": self.kind() })
    }
}

/// What handling a control message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    SkipWaitingRequested,
    UpdateRequested,
    /// Result of the refresh, or the error that stopped it.
    Refreshed(Result<PopulateReport, String>),
    Ignored(String),
}

/// The worker's message inbox.
#[derive(Clone)]
pub struct ControlChannel {
    precacher: Precacher,
}

impl ControlChannel {
    pub fn new(precacher: Precacher) -> Self {
        Self { precacher }
    }

    pub async fn handle(&self, message: &Value, host: &dyn WorkerHost) -> ControlOutcome {
        match ControlMessage::from_json(message) {
            ControlMessage::SkipWaiting => {
                info!("Control message: skip waiting");
                host.skip_waiting();
                ControlOutcome::SkipWaitingRequested
            }
            ControlMessage::CheckForUpdates => {
                info!("Control message: check for updates");
                host.request_update();
                ControlOutcome::UpdateRequested
            }
            ControlMessage::RefreshCache => {
                info!(cache = %self.precacher.cache_name(), "Control message: refresh cache");
                match self.precacher.run().await {
                    Ok(report) => ControlOutcome::Refreshed(Ok(report)),
                    Err(e) => {
                        warn!(cache = %self.precacher.cache_name(), error = %e, "Cache refresh failed");
                        ControlOutcome::Refreshed(Err(e.to_string()))
                    }
                }
            }
            ControlMessage::Unknown(kind) => {
                warn!(kind = %kind, "Ignoring unknown control message");
                ControlOutcome::Ignored(kind)
            }
        }
    }
}
