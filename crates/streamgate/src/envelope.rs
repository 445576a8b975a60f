//! Wire envelope and typed event payloads.
//!
//! Every inbound frame is a JSON object of the form
//! `{"type": "...", "timestamp": <epoch ms>, "data": {...}, "user_id": "..."}`.
//! The `type` field is the topic used for routing. Known topics can be
//! decoded further into [`StreamEvent`].

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StreamError, StreamResult};

/// Decoded unit of one inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Topic the event is routed by.
    #[serde(rename = "type")]
    pub topic: String,
    /// Server timestamp in epoch milliseconds.
    pub timestamp: i64,
    /// Topic-specific payload.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Subject the event concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Envelope {
    /// Decode a raw text frame.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Protocol`] if the frame is not a valid envelope.
    pub fn decode(frame: &str) -> StreamResult<Self> {
        let envelope: Self = serde_json::from_str(frame)
            .map_err(|e| StreamError::Protocol(format!("malformed frame: {e}")))?;
        if envelope.topic.is_empty() {
            return Err(StreamError::Protocol("envelope has empty type".to_string()));
        }
        Ok(envelope)
    }

    /// Server timestamp as a `DateTime`, if it is in range.
    #[must_use]
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }

    /// Known event kind for this topic, if any.
    #[must_use]
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_topic(&self.topic)
    }

    /// Deserialize the payload into a caller-chosen type.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Protocol`] if the payload does not match `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> StreamResult<T> {
        serde_json::from_value(Value::Object(self.data.clone())).map_err(|e| {
            StreamError::Protocol(format!("payload for {} does not match: {e}", self.topic))
        })
    }

    /// Decode into the typed event for this topic.
    ///
    /// Unknown topics come back as [`StreamEvent::Other`].
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Protocol`] if a known topic carries a payload
    /// of the wrong shape.
    pub fn event(&self) -> StreamResult<StreamEvent> {
        let Some(kind) = self.kind() else {
            return Ok(StreamEvent::Other {
                topic: self.topic.clone(),
                data: self.data.clone(),
            });
        };
        Ok(match kind {
            EventKind::MetricsUpdate => StreamEvent::MetricsUpdate(self.payload()?),
            EventKind::RequestLogged => StreamEvent::RequestLogged(self.payload()?),
            EventKind::RateLimitExceeded => StreamEvent::RateLimitExceeded(self.payload()?),
            EventKind::CircuitStateChanged => StreamEvent::CircuitStateChanged(self.payload()?),
            EventKind::AlertTriggered => StreamEvent::AlertTriggered(self.payload()?),
            EventKind::UsageUpdate => StreamEvent::UsageUpdate(self.payload()?),
        })
    }
}

/// Topics with a known payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Rolling traffic metrics for one API.
    MetricsUpdate,
    /// A single proxied request.
    RequestLogged,
    /// A consumer hit a rate limit.
    RateLimitExceeded,
    /// A circuit breaker changed state.
    CircuitStateChanged,
    /// An alert rule fired.
    AlertTriggered,
    /// Plan usage counters changed.
    UsageUpdate,
}

impl EventKind {
    /// Every known kind.
    pub const ALL: [Self; 6] = [
        Self::MetricsUpdate,
        Self::RequestLogged,
        Self::RateLimitExceeded,
        Self::CircuitStateChanged,
        Self::AlertTriggered,
        Self::UsageUpdate,
    ];

    /// Wire topic string.
    #[must_use]
    pub const fn as_topic(self) -> &'static str {
        match self {
            Self::MetricsUpdate => "metrics.update",
            Self::RequestLogged => "request.logged",
            Self::RateLimitExceeded => "rate_limit.exceeded",
            Self::CircuitStateChanged => "circuit.state_changed",
            Self::AlertTriggered => "alert.triggered",
            Self::UsageUpdate => "usage.update",
        }
    }

    /// Look up a kind by wire topic.
    #[must_use]
    pub fn from_topic(topic: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_topic() == topic)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_topic())
    }
}

/// Typed view of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// `metrics.update`
    MetricsUpdate(MetricsUpdate),
    /// `request.logged`
    RequestLogged(RequestLogged),
    /// `rate_limit.exceeded`
    RateLimitExceeded(RateLimitExceeded),
    /// `circuit.state_changed`
    CircuitStateChanged(CircuitStateChanged),
    /// `alert.triggered`
    AlertTriggered(AlertTriggered),
    /// `usage.update`
    UsageUpdate(UsageUpdate),
    /// Any topic without a typed payload.
    Other {
        /// Wire topic.
        topic: String,
        /// Raw payload.
        data: Map<String, Value>,
    },
}

/// Rolling traffic metrics for one API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsUpdate {
    /// API the metrics belong to.
    pub api_id: String,
    /// Requests per minute over the current window.
    pub requests_per_minute: f64,
    /// Fraction of requests that failed, 0.0..=1.0.
    pub error_rate: f64,
    /// Median latency.
    pub p50_latency_ms: f64,
    /// Tail latency.
    pub p99_latency_ms: f64,
}

/// A single proxied request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLogged {
    /// Gateway-assigned request id.
    pub request_id: String,
    /// API the request was routed to.
    #[serde(default)]
    pub api_id: String,
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Upstream status code.
    pub status: u16,
    /// Total latency.
    #[serde(default)]
    pub latency_ms: f64,
}

/// A consumer hit a rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitExceeded {
    /// API whose limit was hit.
    pub api_id: String,
    /// Consumer key, when the limit is per-consumer.
    #[serde(default)]
    pub consumer: Option<String>,
    /// Allowed requests per window.
    pub limit: u64,
    /// Window length in seconds.
    pub window_secs: u64,
}

/// Circuit breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Traffic flows.
    Closed,
    /// Traffic is short-circuited.
    Open,
    /// Probing whether the upstream recovered.
    HalfOpen,
}

/// A circuit breaker changed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStateChanged {
    /// API the breaker guards.
    pub api_id: String,
    /// New position.
    pub state: CircuitState,
    /// Previous position, if known.
    #[serde(default)]
    pub previous: Option<CircuitState>,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Needs action now.
    Critical,
}

/// An alert rule fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertTriggered {
    /// Alert rule id.
    pub alert_id: String,
    /// Severity.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
}

/// Plan usage counters changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageUpdate {
    /// Requests consumed in the current billing period.
    pub requests_used: u64,
    /// Plan allowance for the period.
    pub requests_limit: u64,
}
