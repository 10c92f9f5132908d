//! Clients: the open pages a generation may control.

use std::fmt;

use hashbrown::HashMap;
use tracing::debug;
use url::Url;

use crate::container::ServiceWorkerId;

/// Identifier of an open page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    fn new() -> Self {
        Self(format!("client-{}", uuid_simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A client (open page).
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,

    /// Client URL.
    pub url: Url,

    /// Controlling worker, if any.
    pub controller: Option<ServiceWorkerId>,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an uncontrolled client.
    pub fn open(&mut self, url: Url) -> Client {
        let client = Client {
            id: ClientId::new(),
            url,
            controller: None,
        };
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Open a client already controlled by `controller`, as a navigation
    /// under an active worker would.
    pub fn open_controlled(&mut self, url: Url, controller: ServiceWorkerId) -> Client {
        let mut client = self.open(url);
        client.controller = Some(controller);
        if let Some(stored) = self.clients.get_mut(&client.id) {
            stored.controller = Some(controller);
        }
        client
    }

    /// Get a client by ID.
    pub fn get(&self, id: &ClientId) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &ClientId) -> Option<Client> {
        self.clients.remove(id)
    }

    /// All clients, ordered by ID.
    pub fn all(&self) -> Vec<Client> {
        let mut clients: Vec<Client> = self.clients.values().cloned().collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        clients
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Whether any client is controlled by a worker other than `except`.
    pub fn any_controlled_by_other(&self, except: ServiceWorkerId) -> bool {
        self.clients
            .values()
            .any(|c| c.controller.is_some_and(|id| id != except))
    }

    /// Make `worker` the controller of every client.
    ///
    /// Returns the clients whose controller actually changed.
    pub fn claim(&mut self, worker: ServiceWorkerId) -> Vec<ClientId> {
        let mut changed: Vec<ClientId> = self
            .clients
            .values_mut()
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect();
        changed.sort();
        debug!(worker = %worker, changed = changed.len(), "Claimed clients");
        changed
    }
}

/// Generate a simple unique ID.
fn uuid_simple() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    format!("{:x}-{:04x}", time, count)
}
