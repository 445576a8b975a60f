//! Topic-keyed subscription registry.
//!
//! The registry outlives every socket: reconnecting never touches it. Dispatch
//! works on snapshots, so callbacks may subscribe or unsubscribe while a frame
//! is being delivered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::envelope::{Envelope, EventKind};

/// Topic string that matches every event.
pub const WILDCARD: &str = "*";

/// Subscriber callback. Runs inline on the connection task, so it must not block.
pub type Callback = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicFilter {
    /// One topic.
    Exact(String),
    /// Every topic.
    Wildcard,
}

impl From<&str> for TopicFilter {
    fn from(topic: &str) -> Self {
        if topic == WILDCARD {
            Self::Wildcard
        } else {
            Self::Exact(topic.to_string())
        }
    }
}

impl From<String> for TopicFilter {
    fn from(topic: String) -> Self {
        if topic == WILDCARD {
            Self::Wildcard
        } else {
            Self::Exact(topic)
        }
    }
}

impl From<EventKind> for TopicFilter {
    fn from(kind: EventKind) -> Self {
        Self::Exact(kind.as_topic().to_string())
    }
}

/// Identifier of one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Identifier of a subscription owner (see [`SubscriptionScope`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

/// A registered callback as seen by dispatch.
pub struct RegisteredCallback {
    id: SubscriptionId,
    filter: TopicFilter,
    owner: Option<OwnerId>,
    active: AtomicBool,
    callback: Callback,
}

impl std::fmt::Debug for RegisteredCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredCallback")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("owner", &self.owner)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl RegisteredCallback {
    /// Subscription id.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Whether the subscription is still registered.
    ///
    /// A snapshot may hold entries removed after it was taken; dispatch skips them.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Invoke the callback.
    pub fn invoke(&self, envelope: &Envelope) {
        (self.callback)(envelope);
    }
}

#[derive(Default)]
struct Inner {
    by_topic: HashMap<TopicFilter, Vec<Arc<RegisteredCallback>>>,
    by_id: HashMap<SubscriptionId, TopicFilter>,
}

/// Per-topic sets of subscriber callbacks.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    next_owner: AtomicU64,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.len())
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `filter`.
    pub fn add(
        &self,
        filter: impl Into<TopicFilter>,
        owner: Option<OwnerId>,
        callback: Callback,
    ) -> SubscriptionId {
        let filter = filter.into();
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(RegisteredCallback {
            id,
            filter: filter.clone(),
            owner,
            active: AtomicBool::new(true),
            callback,
        });

        let mut inner = self.inner.lock();
        inner.by_id.insert(id, filter.clone());
        inner.by_topic.entry(filter).or_default().push(entry);
        trace!(?id, "subscription added");
        id
    }

    /// Remove a subscription. Unknown or already-removed ids are ignored.
    ///
    /// Returns whether anything was removed.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let Some(filter) = inner.by_id.remove(&id) else {
            return false;
        };
        if let Some(entries) = inner.by_topic.get_mut(&filter) {
            if let Some(pos) = entries.iter().position(|e| e.id == id) {
                entries.remove(pos).active.store(false, Ordering::Release);
            }
            if entries.is_empty() {
                inner.by_topic.remove(&filter);
            }
        }
        trace!(?id, "subscription removed");
        true
    }

    /// Remove every subscription registered by `owner`.
    ///
    /// Returns the number removed.
    pub fn remove_owner(&self, owner: OwnerId) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = Vec::new();
        inner.by_topic.retain(|_, entries| {
            entries.retain(|entry| {
                if entry.owner == Some(owner) {
                    entry.active.store(false, Ordering::Release);
                    removed.push(entry.id);
                    false
                } else {
                    true
                }
            });
            !entries.is_empty()
        });
        for id in &removed {
            inner.by_id.remove(id);
        }
        removed.len()
    }

    /// Snapshot of the callbacks matching `topic`: exact entries plus
    /// wildcard entries, in registration order.
    #[must_use]
    pub fn entries_for(&self, topic: &str) -> Vec<Arc<RegisteredCallback>> {
        let inner = self.inner.lock();
        let exact = inner.by_topic.get(&TopicFilter::Exact(topic.to_string()));
        let wildcard = inner.by_topic.get(&TopicFilter::Wildcard);

        let mut entries: Vec<_> = exact
            .into_iter()
            .chain(wildcard)
            .flatten()
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    /// Whether no subscriptions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn allocate_owner(&self) -> OwnerId {
        OwnerId(self.next_owner.fetch_add(1, Ordering::Relaxed))
    }
}

/// Handle returned by `subscribe`. Calling [`Subscription::unsubscribe`]
/// removes the callback; dropping the handle does not.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: SubscriptionId,
    registry: Weak<SubscriptionRegistry>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, registry: &Arc<SubscriptionRegistry>) -> Self {
        Self {
            id,
            registry: Arc::downgrade(registry),
        }
    }

    /// Id of the underlying registration.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Stop receiving events. Safe to call more than once, and from inside a callback.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

/// A group of subscriptions owned by one consumer.
///
/// Dropping the scope removes every subscription made through it.
#[derive(Debug)]
pub struct SubscriptionScope {
    owner: OwnerId,
    registry: Weak<SubscriptionRegistry>,
}

impl SubscriptionScope {
    /// Create a scope over `registry`.
    #[must_use]
    pub fn new(registry: &Arc<SubscriptionRegistry>) -> Self {
        Self {
            owner: registry.allocate_owner(),
            registry: Arc::downgrade(registry),
        }
    }

    /// Owner id used for this scope's registrations.
    #[must_use]
    pub const fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Register a callback owned by this scope.
    pub fn subscribe<F>(&self, filter: impl Into<TopicFilter>, callback: F) -> Option<Subscription>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let registry = self.registry.upgrade()?;
        let id = registry.add(filter, Some(self.owner), Arc::new(callback));
        Some(Subscription::new(id, &registry))
    }

    /// Remove every subscription made through this scope.
    pub fn clear(&self) -> usize {
        self.registry
            .upgrade()
            .map_or(0, |registry| registry.remove_owner(self.owner))
    }
}

impl Drop for SubscriptionScope {
    fn drop(&mut self) {
        self.clear();
    }
}
