//! Connection lifecycle events published to observers.

use std::time::Duration;

/// Events emitted by a connection as it moves through its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Socket opened.
    Connected,
    /// Socket closed (or failed to open).
    Disconnected {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// A reconnect has been scheduled.
    Reconnecting {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Reconnection gave up; status is now `error`.
    ReconnectFailed {
        /// Reconnect attempts made.
        attempts: u32,
        /// Reason reported by the last closure.
        reason: String,
    },
}
