//! The streaming client facade.
//!
//! [`StreamClient`] is the only type dashboard widgets need: it owns one
//! connection to one endpoint path and exposes `connect`, `subscribe`,
//! `send`, `disconnect` and `status`.
//!
//! # Example
//!
//! ```no_run
//! use streamgate::{Credentials, EventKind, StreamClient, StreamConfig};
//!
//! # async fn run() -> streamgate::StreamResult<()> {
//! let client = StreamClient::new(
//!     StreamConfig::new("https://api.example.com"),
//!     "/apis/123/overview",
//!     Credentials::token("secret"),
//! );
//!
//! let sub = client.subscribe(EventKind::MetricsUpdate, |envelope| {
//!     println!("{}", envelope.topic);
//! });
//! client.connect()?;
//!
//! // ...
//! sub.unsubscribe();
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::access::{AccessGate, Entitlement};
use crate::config::StreamConfig;
use crate::connection::{Connection, ConnectionHandle, ConnectionShared};
use crate::envelope::Envelope;
use crate::error::{StreamError, StreamResult};
use crate::events::ConnectionEvent;
use crate::registry::{Subscription, SubscriptionRegistry, SubscriptionScope, TopicFilter};
use crate::state::ConnectionState;
use crate::transport::{Credentials, Endpoint};

/// How the caller should obtain data after `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// A live connection is being maintained.
    Live,
    /// Live streaming is not permitted; poll the REST endpoints instead.
    Polling,
}

/// Client for one streaming endpoint.
#[derive(Debug)]
pub struct StreamClient {
    config: StreamConfig,
    path: String,
    credentials: Credentials,
    registry: Arc<SubscriptionRegistry>,
    shared: Arc<ConnectionShared>,
    permitted: bool,
    handle: Mutex<Option<ConnectionHandle>>,
}

impl StreamClient {
    /// Create a client for `path` (e.g. `/apis/123/overview`).
    ///
    /// Nothing is opened until [`StreamClient::connect`] is called.
    #[must_use]
    pub fn new(config: StreamConfig, path: impl Into<String>, credentials: Credentials) -> Self {
        let shared = Arc::new(ConnectionShared::new(config.event_capacity));
        Self {
            config,
            path: path.into(),
            credentials,
            registry: Arc::new(SubscriptionRegistry::new()),
            shared,
            permitted: true,
            handle: Mutex::new(None),
        }
    }

    /// Evaluate `gate` against the caller's entitlement.
    ///
    /// The decision holds for the lifetime of the client.
    #[must_use]
    pub fn with_access<G>(mut self, gate: &G, entitlement: &Entitlement) -> Self
    where
        G: AccessGate + ?Sized,
    {
        self.permitted = gate.has_access(entitlement);
        self
    }

    /// Whether this client may open a live connection at all.
    #[must_use]
    pub const fn is_live_permitted(&self) -> bool {
        self.permitted
    }

    /// Endpoint path this client serves.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Start maintaining a live connection.
    ///
    /// Returns [`Connectivity::Polling`] without opening anything when the
    /// caller's plan does not include streaming. Calling this while a
    /// connection is already live is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::MissingCredential`] if no credential is
    /// available, [`StreamError::Config`] if the configuration is invalid,
    /// [`StreamError::InvalidEndpoint`] if the URL cannot be built, or
    /// [`StreamError::NoRuntime`] outside a tokio runtime.
    pub fn connect(&self) -> StreamResult<Connectivity> {
        if !self.permitted {
            debug!(path = %self.path, "live streaming not permitted, caller should poll");
            return Ok(Connectivity::Polling);
        }

        let mut slot = self.handle.lock();
        // A task that has given up reports `Error` before it exits.
        let running = slot.as_ref().is_some_and(|handle| !handle.is_finished())
            && self.status() != ConnectionState::Error;
        if running {
            return Ok(Connectivity::Live);
        }

        self.config.validate()?;
        let base = self.config.base_url()?;
        let endpoint = Endpoint::resolve(&base, &self.path, &self.credentials)?;
        if let Some(stale) = slot.take() {
            drop(stale.cancel());
        }
        let handle = Connection::spawn(
            endpoint,
            self.config.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.shared),
        )?;
        *slot = Some(handle);
        Ok(Connectivity::Live)
    }

    /// Register `callback` for a topic, or for every topic with `"*"`.
    ///
    /// Legal before `connect`; subscriptions survive reconnects.
    pub fn subscribe<F>(&self, filter: impl Into<TopicFilter>, callback: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = self.registry.add(filter, None, Arc::new(callback));
        Subscription::new(id, &self.registry)
    }

    /// New subscription scope; dropping it removes everything it registered.
    #[must_use]
    pub fn scope(&self) -> SubscriptionScope {
        SubscriptionScope::new(&self.registry)
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    /// Serialize `message` as JSON and send it on the open socket.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::AccessDenied`] when streaming is not permitted,
    /// [`StreamError::NotConnected`] unless the status is `connected`, or
    /// [`StreamError::Serialization`] if encoding fails.
    pub fn send<T>(&self, message: &T) -> StreamResult<()>
    where
        T: Serialize + ?Sized,
    {
        if !self.permitted {
            return Err(StreamError::AccessDenied(
                "plan does not include live streaming".to_string(),
            ));
        }
        if self.status() != ConnectionState::Connected {
            return Err(StreamError::NotConnected);
        }

        let text = serde_json::to_string(message)?;
        self.handle
            .lock()
            .as_ref()
            .ok_or(StreamError::NotConnected)?
            .send(text)
    }

    /// Stop the connection and cancel any pending reconnect.
    ///
    /// The status is `disconnected` as soon as this returns. Await the
    /// returned future to wait for the socket to finish closing.
    pub fn disconnect(&self) -> Disconnect {
        let mut slot = self.handle.lock();
        let task = slot.take().map(ConnectionHandle::cancel);
        self.shared.end();
        drop(slot);
        Disconnect { task }
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionState {
        self.shared.state().current()
    }

    /// Receiver that observes status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state().watch()
    }

    /// Receiver for lifecycle events.
    #[must_use]
    pub fn lifecycle(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.subscribe_events()
    }

    /// Why the client ended up in `error`, if it did.
    #[must_use]
    pub fn failure(&self) -> Option<StreamError> {
        self.shared.failure()
    }
}

/// Completes once a disconnected task has finished closing its socket.
#[derive(Debug)]
pub struct Disconnect {
    task: Option<JoinHandle<()>>,
}

impl Future for Disconnect {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let Some(task) = self.task.as_mut() else {
            return Poll::Ready(());
        };
        match Pin::new(task).poll(cx) {
            Poll::Ready(result) => {
                if let Err(e) = result {
                    if e.is_panic() {
                        warn!(error = %e, "connection task panicked");
                    }
                }
                self.task = None;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
