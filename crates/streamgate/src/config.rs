//! Client configuration.
//!
//! Configuration for the streaming client, including:
//! - Backend base URL
//! - Connect timeout
//! - Reconnection policy
//! - Keepalive
//! - Lifecycle event buffering

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{StreamError, StreamResult};
use crate::keepalive::KeepaliveConfig;
use crate::reconnect::ReconnectConfig;

const fn default_connect_timeout_ms() -> u64 {
    10_000
}

const fn default_event_capacity() -> usize {
    64
}

/// Main client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Backend base URL (`http`, `https`, `ws` or `wss`).
    pub base_url: String,
    /// Milliseconds to wait for a socket to open.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Buffer size of the lifecycle event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Reconnection policy.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Keepalive settings.
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new("http://localhost:8000")
    }
}

impl StreamConfig {
    /// Configuration for `base_url` with defaults elsewhere.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout_ms: default_connect_timeout_ms(),
            event_capacity: default_event_capacity(),
            reconnect: ReconnectConfig::default(),
            keepalive: KeepaliveConfig::default(),
        }
    }

    /// Set the reconnection policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set keepalive behavior.
    #[must_use]
    pub const fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Set the connect timeout, at millisecond precision.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Connect timeout as a `Duration`.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Parsed base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse.
    pub fn base_url(&self) -> StreamResult<Url> {
        Url::parse(&self.base_url)
            .map_err(|e| StreamError::Config(format!("invalid base_url '{}': {e}", self.base_url)))
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> StreamResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            StreamError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> StreamResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| StreamError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> StreamResult<String> {
        toml::to_string_pretty(self).map_err(|e| StreamError::Config(format!("cannot render TOML: {e}")))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> StreamResult<()> {
        if self.base_url.is_empty() {
            return Err(StreamError::Config("base_url cannot be empty".to_string()));
        }

        let url = self.base_url()?;
        if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(StreamError::Config(
                "base_url must use http, https, ws or wss".to_string(),
            ));
        }
        if url.host_str().is_none() {
            return Err(StreamError::Config("base_url must include a host".to_string()));
        }

        if self.connect_timeout_ms == 0 {
            return Err(StreamError::Config(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.enabled {
            if self.reconnect.base_delay_ms == 0 {
                return Err(StreamError::Config(
                    "reconnect.base_delay_ms must be greater than 0".to_string(),
                ));
            }
            if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
                return Err(StreamError::Config(
                    "reconnect.max_delay_ms must be at least base_delay_ms".to_string(),
                ));
            }
        }

        if self.keepalive.is_enabled() && self.keepalive.max_missed_pongs == 0 {
            return Err(StreamError::Config(
                "keepalive.max_missed_pongs must be greater than 0".to_string(),
            ));
        }

        if self.event_capacity == 0 {
            return Err(StreamError::Config(
                "event_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
