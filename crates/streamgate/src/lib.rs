//! # streamgate
//!
//! Real-time event-streaming client for the API gateway dashboard.
//!
//! One [`StreamClient`] keeps a WebSocket to one endpoint path alive across
//! network interruptions and fans decoded events out to any number of
//! subscribers sharing that socket:
//!
//! - [`ReconnectConfig`] - Exponential backoff with a retry ceiling
//! - [`TransportSocket`] - Lifecycle of one physical socket
//! - [`SubscriptionRegistry`] - Per-topic callbacks that survive reconnects
//! - [`EventDispatcher`] - Frame decoding and fan-out
//! - [`ConnectionStateMachine`] - `connecting`/`connected`/`disconnected`/`error`
//! - [`AccessGate`] - Plan-based decision between live streaming and polling
//! - [`StreamHub`] - Scoped owner of per-endpoint clients

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod access;
pub mod client;
pub mod config;
mod connection;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod events;
pub mod hub;
pub mod keepalive;
pub mod reconnect;
pub mod registry;
pub mod state;
pub mod transport;

pub use access::{AccessGate, Entitlement, OpenGate, PlanGate, PlanTier, REALTIME_FEATURE};
pub use client::{Connectivity, Disconnect, StreamClient};
pub use config::StreamConfig;
pub use dispatch::{DispatchOutcome, EventDispatcher};
pub use envelope::{
    AlertTriggered, CircuitState, CircuitStateChanged, Envelope, EventKind, MetricsUpdate,
    RateLimitExceeded, RequestLogged, Severity, StreamEvent, UsageUpdate,
};
pub use error::{StreamError, StreamResult};
pub use events::ConnectionEvent;
pub use hub::StreamHub;
pub use keepalive::KeepaliveConfig;
pub use reconnect::{calculate_backoff, ReconnectConfig, RetryState};
pub use registry::{
    Subscription, SubscriptionId, SubscriptionRegistry, SubscriptionScope, TopicFilter, WILDCARD,
};
pub use state::{ConnectionState, ConnectionStateMachine};
pub use transport::{CloseEvent, Credentials, Endpoint, LifecycleEvent, TransportSocket};
