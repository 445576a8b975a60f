//! Frame decoding and fan-out to subscribers.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::registry::SubscriptionRegistry;

/// Result of handling one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Frame decoded and handed to `delivered` callbacks; `panicked` of them panicked.
    Delivered {
        /// Callbacks invoked.
        delivered: usize,
        /// Callbacks that panicked.
        panicked: usize,
    },
    /// Frame was malformed and dropped.
    Dropped,
}

/// Decodes inbound frames and routes them to registry entries.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    registry: Arc<SubscriptionRegistry>,
}

impl EventDispatcher {
    /// Create a dispatcher over a shared registry.
    #[must_use]
    pub const fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    /// Handle one raw text frame.
    ///
    /// Malformed frames are logged and dropped. Callbacks run synchronously in
    /// registration order; a panicking callback is logged and skipped.
    pub fn on_frame(&self, frame: &str) -> DispatchOutcome {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, len = frame.len(), "dropping malformed frame");
                return DispatchOutcome::Dropped;
            }
        };
        self.dispatch(&envelope)
    }

    /// Deliver an already-decoded envelope.
    pub fn dispatch(&self, envelope: &Envelope) -> DispatchOutcome {
        let mut delivered = 0;
        let mut panicked = 0;

        for entry in self.registry.entries_for(&envelope.topic) {
            // Removed after the snapshot was taken, possibly by an earlier callback.
            if !entry.is_active() {
                continue;
            }
            delivered += 1;
            if panic::catch_unwind(AssertUnwindSafe(|| entry.invoke(envelope))).is_err() {
                panicked += 1;
                warn!(
                    topic = %envelope.topic,
                    subscription = ?entry.id(),
                    "subscriber callback panicked"
                );
            }
        }

        debug!(topic = %envelope.topic, delivered, "frame dispatched");
        DispatchOutcome::Delivered {
            delivered,
            panicked,
        }
    }
}
