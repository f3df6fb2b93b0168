//! DerivedValue Implementation
//!
//! A `DerivedValue` is a cached computation over other reactive nodes.
//!
//! # How Derived Values Work
//!
//! 1. A derived value is created stale and with no cached value; the
//!    derivation runs on first read, not at creation.
//!
//! 2. While the derivation runs, every cell or derived value it reads
//!    registers it as a dependent. The resulting release hooks replace
//!    the previous dependency set wholesale, so dependencies discovered
//!    at run time (a branch that stopped reading some cell) are pruned on
//!    the next recomputation.
//!
//! 3. When a dependency changes, the derived value only flips its stale
//!    flag and forwards the notification to its own subscribers.
//!    Recomputation waits for the next read: a derived value nobody
//!    reads costs nothing beyond the flag flip.
//!
//! # Why Laziness Matters
//!
//! - A cell changes
//! - 10 derived values depend on it
//! - Only the ones actually read recompute
//! - The rest stay stale with no wasted work

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::context::TrackedRun;
use super::node::{NodeId, Observer, ReleaseList, SubscriberSet, Subscription};

/// Shared state behind every handle to one derived value.
struct DerivedState<T> {
    /// The cached value (`None` until first computed).
    value: RwLock<Option<T>>,

    /// Whether the cache may be out of date.
    stale: AtomicBool,

    /// Release hooks for the current dependency set.
    releases: Mutex<ReleaseList>,

    /// Observers that depend on this derived value.
    subscribers: SubscriberSet,
}

/// A memoized, lazily-recomputed function of other reactive nodes.
///
/// # Example
///
/// ```rust,ignore
/// let count = StateCell::new(2);
/// let count_for_derived = count.clone();
/// let doubled = DerivedValue::new(move || count_for_derived.get() * 2);
///
/// assert_eq!(doubled.get(), 4);
/// count.set(5);
/// assert_eq!(doubled.get(), 10);
/// ```
pub struct DerivedValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Unique identifier for this derived value.
    id: NodeId,

    state: Arc<DerivedState<T>>,

    /// The derivation function.
    compute: Arc<dyn Fn() -> T + Send + Sync>,

    /// The invalidation observer registered with upstream sources.
    observer: Arc<Observer>,
}

impl<T> DerivedValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new derived value from a pure derivation function.
    ///
    /// The derivation does not run until the first read.
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let id = NodeId::new();
        let state = Arc::new(DerivedState {
            value: RwLock::new(None),
            stale: AtomicBool::new(true),
            releases: Mutex::new(ReleaseList::new()),
            subscribers: SubscriberSet::new(),
        });

        // The observer holds only a weak reference: a derived value that
        // has been dropped while still registered upstream fires as an
        // inert no-op until the entry is released.
        let weak = Arc::downgrade(&state);
        let observer = Arc::new(Observer::new(id, move || {
            if let Some(state) = weak.upgrade() {
                Self::invalidate(&state);
            }
        }));

        Self {
            id,
            state,
            compute: Arc::new(compute),
            observer,
        }
    }

    /// Get the derived value's unique ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the current value, recomputing first if stale.
    ///
    /// If called while another computation is evaluating, that
    /// computation is registered as a dependent of this derived value
    /// (derived values can depend on derived values).
    pub fn get(&self) -> T {
        self.state.subscribers.track_current();

        if self.state.stale.load(Ordering::SeqCst) {
            self.recompute();
        }

        self.state
            .value
            .read()
            .clone()
            .expect("fresh derived value must be cached")
    }

    /// Check whether the cache is out of date.
    pub fn is_stale(&self) -> bool {
        self.state.stale.load(Ordering::SeqCst)
    }

    /// Check whether the derivation has run at least once.
    pub fn has_value(&self) -> bool {
        self.state.value.read().is_some()
    }

    /// Register a push-based subscriber, independent of the tracking
    /// context. The callback sees the cached value as of each delivery,
    /// which may predate recomputation; it is skipped entirely if the
    /// derivation has never run.
    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let state = Arc::downgrade(&self.state);
        let observer = Arc::new(Observer::new(NodeId::new(), move || {
            if let Some(state) = state.upgrade() {
                let cached = state.value.read().clone();
                if let Some(value) = cached {
                    f(&value);
                }
            }
        }));
        self.state.subscribers.add(observer)
    }

    /// Get the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.subscribers.len()
    }

    /// Invalidation entry point: mark stale and forward the notification
    /// without recomputing.
    fn invalidate(state: &DerivedState<T>) {
        if !state.stale.swap(true, Ordering::SeqCst) {
            state.subscribers.notify(None);
        }
    }

    /// Re-run the derivation, rebuilding the dependency set.
    fn recompute(&self) {
        // Tear down the previous dependency set first; the run below
        // re-establishes exactly the edges it actually reads.
        let old: ReleaseList = std::mem::take(&mut *self.state.releases.lock());
        for release in old {
            release();
        }

        // The guard commits the new release hooks even if the
        // derivation panics: a partial run's edges stay prunable.
        let value = {
            let _tracking = TrackedRun::enter(self.observer.clone(), &self.state.releases);
            (self.compute)()
        };

        *self.state.value.write() = Some(value);
        self.state.stale.store(false, Ordering::SeqCst);
    }
}

impl<T> Clone for DerivedValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state: Arc::clone(&self.state),
            compute: Arc::clone(&self.compute),
            observer: Arc::clone(&self.observer),
        }
    }
}

impl<T> Debug for DerivedValue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedValue")
            .field("id", &self.id)
            .field("stale", &self.is_stale())
            .field("has_value", &self.has_value())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
