//! Connection state types and the lifecycle state machine.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{StreamError, StreamResult};

/// State of a streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected. Initial state, and terminal after a clean close.
    Disconnected,
    /// Opening a socket.
    Connecting,
    /// Socket open, frames flowing.
    Connected,
    /// Permanently failed (retries exhausted).
    Error,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is allowed.
    ///
    /// A live connection must pass through `Disconnected` before it may
    /// start connecting again.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Connected, Connecting, Disconnected, Error};
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected | Disconnected | Error)
                | (Connected, Disconnected | Error)
                | (Disconnected, Error)
                | (Error, Connecting | Disconnected)
        )
    }

    const fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Error,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Atomic wrapper for connection state.
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU32);

impl AtomicConnectionState {
    /// Create a new atomic state.
    #[must_use]
    pub const fn new(state: ConnectionState) -> Self {
        Self(AtomicU32::new(state as u32))
    }

    /// Load the current state.
    #[must_use]
    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u32(self.0.load(Ordering::SeqCst))
    }

    /// Apply `to` if the current state allows it, returning the previous state.
    fn transition(&self, to: ConnectionState) -> StreamResult<ConnectionState> {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                ConnectionState::from_u32(raw)
                    .can_transition_to(to)
                    .then_some(to as u32)
            })
            .map(ConnectionState::from_u32)
            .map_err(|raw| StreamError::InvalidTransition {
                from: ConnectionState::from_u32(raw),
                to,
            })
    }
}

/// Tracks the lifecycle of one connection and publishes every change.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: AtomicConnectionState,
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    /// Create a state machine in `Disconnected`.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            state: AtomicConnectionState::new(ConnectionState::Disconnected),
            tx,
        }
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> ConnectionState {
        self.state.load()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `to`.
    ///
    /// Transitions to the current state are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidTransition`] if `to` is not reachable
    /// from the current state.
    pub fn transition(&self, to: ConnectionState) -> StreamResult<()> {
        if self.current() == to {
            return Ok(());
        }
        let from = self.state.transition(to)?;
        debug!(%from, %to, "connection state changed");
        self.tx.send_replace(to);
        Ok(())
    }
}
