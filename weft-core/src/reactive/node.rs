//! Graph plumbing shared by every reactive node.
//!
//! A node's public half is a value handle (`StateCell`, `DerivedValue`);
//! its notification half is an [`Observer`]: a unique identity plus the
//! callback to invoke when an upstream value may have changed. Sources
//! keep their observers in a [`SubscriberSet`], an insertion-ordered map
//! keyed by [`NodeId`] so the scheduler can coalesce repeated
//! notifications for the same node into a single delivery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::scheduler::{self, ScheduleMode};

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// A hook that removes one subscription when invoked.
///
/// Sources hand one of these to the evaluating node for every dependency
/// edge established during a run; the node invokes the whole list before
/// its next run to tear the old dependency set down.
pub(crate) type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Release hooks collected during a single evaluation.
pub(crate) type ReleaseList = SmallVec<[ReleaseFn; 4]>;

/// The notification half of a reactive node.
///
/// For a derived value the callback marks it stale and forwards the
/// notification; for an effect it re-runs the body. The callback must be
/// cheap to clone around, so it is always held behind an `Arc`.
pub(crate) struct Observer {
    id: NodeId,
    notify: Box<dyn Fn() + Send + Sync>,
}

impl Observer {
    pub(crate) fn new<F>(id: NodeId, notify: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            id,
            notify: Box::new(notify),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    /// Invoke the notification callback.
    pub(crate) fn fire(&self) {
        (self.notify)();
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer").field("id", &self.id).finish()
    }
}

/// The set of observers subscribed to one source.
///
/// Entries are held strongly: a subscribed computation stays registered
/// until a release hook, a [`Subscription`] drop, or an effect destroy
/// removes it. A notification whose target has since been dropped is an
/// inert no-op.
pub(crate) struct SubscriberSet {
    entries: Arc<RwLock<IndexMap<NodeId, Arc<Observer>>>>,
}

impl SubscriberSet {
    pub(crate) fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(IndexMap::new())),
        }
    }

    /// Register the currently-evaluating observer, if any, and record the
    /// matching release hook into the active tracking scope.
    pub(crate) fn track_current(&self) {
        use super::context::TrackingScope;

        if let Some(observer) = TrackingScope::current_observer() {
            let id = observer.id();
            let inserted = self.entries.write().insert(id, observer).is_none();
            if inserted {
                TrackingScope::record_release(self.release_hook(id));
            }
        }
    }

    /// Add an observer directly, outside the tracking context.
    ///
    /// Returns a [`Subscription`] guard that removes the entry when
    /// dropped or explicitly unsubscribed.
    pub(crate) fn add(&self, observer: Arc<Observer>) -> Subscription {
        let id = observer.id();
        self.entries.write().insert(id, observer);
        Subscription {
            release: Some(self.release_hook(id)),
        }
    }

    /// Hand every current subscriber to the scheduler on the given
    /// channel (or the default channel when `mode` is `None`).
    pub(crate) fn notify(&self, mode: Option<ScheduleMode>) {
        // Snapshot first: callbacks may re-enter this set.
        let observers: Vec<Arc<Observer>> = self.entries.read().values().cloned().collect();
        // Deferred deliveries must not start until every subscriber of
        // this notification has been queued; the scope's end is the
        // flush boundary.
        let _boundary = scheduler::NotifyScope::enter();
        for observer in observers {
            scheduler::schedule(&observer, mode);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn release_hook(&self, id: NodeId) -> ReleaseFn {
        let entries = Arc::downgrade(&self.entries);
        Box::new(move || {
            if let Some(entries) = entries.upgrade() {
                entries.write().shift_remove(&id);
            }
        })
    }
}

impl Clone for SubscriberSet {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl std::fmt::Debug for SubscriberSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberSet")
            .field("len", &self.len())
            .finish()
    }
}

/// Guard for a push-based subscription.
///
/// Dropping the guard (or calling [`unsubscribe`](Self::unsubscribe))
/// removes the callback from the source's subscriber set. Use
/// [`leak`](Self::leak) to keep the subscription for the rest of the
/// process lifetime.
pub struct Subscription {
    release: Option<ReleaseFn>,
}

impl Subscription {
    /// Remove the subscription now.
    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    /// Keep the subscription alive without holding the guard.
    pub fn leak(mut self) {
        self.release = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("live", &self.release.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        let id3 = NodeId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn observer_fire_invokes_callback() {
        let count = Arc::new(AtomicI32::new(0));
        let count_clone = count.clone();

        let observer = Observer::new(NodeId::new(), move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(count.load(Ordering::SeqCst), 0);
        observer.fire();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscription_drop_removes_entry() {
        let set = SubscriberSet::new();
        let observer = Arc::new(Observer::new(NodeId::new(), || {}));

        let subscription = set.add(observer);
        assert_eq!(set.len(), 1);

        drop(subscription);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn leaked_subscription_survives() {
        let set = SubscriberSet::new();
        let observer = Arc::new(Observer::new(NodeId::new(), || {}));

        set.add(observer).leak();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn add_same_observer_twice_keeps_one_entry() {
        let set = SubscriberSet::new();
        let observer = Arc::new(Observer::new(NodeId::new(), || {}));

        let first = set.add(observer.clone());
        let second = set.add(observer);
        assert_eq!(set.len(), 1);

        first.leak();
        second.leak();
        assert_eq!(set.len(), 1);
    }
}
