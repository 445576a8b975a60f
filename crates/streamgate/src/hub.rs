//! Scoped owner of per-endpoint clients.
//!
//! A [`StreamHub`] is created once per session (or per view tree) and hands
//! out one [`StreamClient`] per endpoint path, all sharing the same
//! configuration, credentials and entitlement. Dropping the hub, or calling
//! [`StreamHub::shutdown`], tears every connection down.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::access::{AccessGate, Entitlement, OpenGate};
use crate::client::StreamClient;
use crate::config::StreamConfig;
use crate::error::StreamResult;
use crate::transport::Credentials;

/// Per-endpoint get-or-create registry of clients.
pub struct StreamHub {
    config: StreamConfig,
    credentials: Credentials,
    gate: Arc<dyn AccessGate>,
    entitlement: Entitlement,
    clients: Mutex<HashMap<String, Arc<StreamClient>>>,
}

impl std::fmt::Debug for StreamHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHub")
            .field("base_url", &self.config.base_url)
            .field("entitlement", &self.entitlement)
            .field("endpoints", &self.endpoints())
            .finish_non_exhaustive()
    }
}

impl StreamHub {
    /// Create a hub that admits every caller.
    #[must_use]
    pub fn new(config: StreamConfig, credentials: Credentials) -> Self {
        Self {
            config,
            credentials,
            gate: Arc::new(OpenGate),
            entitlement: Entitlement::default(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Gate every client on `entitlement`.
    #[must_use]
    pub fn with_access<G>(mut self, gate: G, entitlement: Entitlement) -> Self
    where
        G: AccessGate + 'static,
    {
        self.gate = Arc::new(gate);
        self.entitlement = entitlement;
        self
    }

    /// Whether clients from this hub may open live connections.
    #[must_use]
    pub fn has_access(&self) -> bool {
        self.gate.has_access(&self.entitlement)
    }

    /// The client for `path`, creating it on first use.
    pub fn client(&self, path: &str) -> Arc<StreamClient> {
        let key = normalize(path);
        let mut clients = self.clients.lock();
        Arc::clone(clients.entry(key).or_insert_with_key(|key| {
            Arc::new(
                StreamClient::new(self.config.clone(), key.clone(), self.credentials.clone())
                    .with_access(self.gate.as_ref(), &self.entitlement),
            )
        }))
    }

    /// The client for `path`, connected.
    ///
    /// # Errors
    ///
    /// Same as [`StreamClient::connect`].
    pub fn connect(&self, path: &str) -> StreamResult<Arc<StreamClient>> {
        let client = self.client(path);
        client.connect()?;
        Ok(client)
    }

    /// Paths with a live client, sorted.
    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.clients.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Disconnect and forget the client for `path`.
    ///
    /// Returns whether a client existed.
    pub fn remove(&self, path: &str) -> bool {
        let Some(client) = self.clients.lock().remove(&normalize(path)) else {
            return false;
        };
        // The socket finishes closing in the background.
        drop(client.disconnect());
        true
    }

    /// Disconnect every client and wait for their sockets to close.
    pub async fn shutdown(&self) {
        let clients: Vec<_> = self.clients.lock().drain().map(|(_, c)| c).collect();
        if clients.is_empty() {
            return;
        }
        info!(count = clients.len(), "shutting down stream clients");
        join_all(clients.iter().map(|client| client.disconnect())).await;
    }
}

impl Drop for StreamHub {
    fn drop(&mut self) {
        let clients = self.clients.get_mut();
        if clients.is_empty() {
            return;
        }
        debug!(count = clients.len(), "hub dropped, disconnecting stream clients");
        // Widgets may still hold their clients; their sockets close anyway.
        for (_, client) in clients.drain() {
            drop(client.disconnect());
        }
    }
}

fn normalize(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}
