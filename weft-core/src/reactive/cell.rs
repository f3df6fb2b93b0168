//! StateCell Implementation
//!
//! A `StateCell` is the fundamental reactive primitive. It holds a value
//! and tracks which computations depend on it.
//!
//! # How Cells Work
//!
//! 1. When a cell is read while a computation is evaluating, the cell
//!    registers that computation as a subscriber.
//!
//! 2. When the cell's value changes, every subscriber is handed to the
//!    scheduler for notification.
//!
//! 3. Writing a value equal to the current one is a no-op: no
//!    notification is delivered. Equality is `PartialEq` on the stored
//!    value. This is a contract, not an optimization detail: a value
//!    mutated in place through interior mutability, without a `set`,
//!    never notifies; updates must flow through the write operation.
//!
//! # Sharing
//!
//! A cell is a clonable handle over `Arc`-shared state: clones observe
//! and mutate the same value. Reads never mutate the value, and the cell
//! is never destroyed implicitly: whoever holds a handle owns it.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;

use super::node::{NodeId, Observer, SubscriberSet, Subscription};
use crate::scheduler::ScheduleMode;

/// A reactive state cell holding a value of type `T`.
///
/// # Example
///
/// ```rust,ignore
/// let count = StateCell::new(0);
///
/// // Read the value
/// let value = count.get();
///
/// // Update the value (notifies subscribers if it changed)
/// count.set(5);
/// ```
pub struct StateCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Unique identifier for this cell.
    id: NodeId,

    /// The current value.
    value: Arc<RwLock<T>>,

    /// Observers that depend on this cell.
    subscribers: SubscriberSet,
}

impl<T> StateCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a new cell with the given initial value.
    pub fn new(value: T) -> Self {
        Self {
            id: NodeId::new(),
            value: Arc::new(RwLock::new(value)),
            subscribers: SubscriberSet::new(),
        }
    }

    /// Get the cell's unique ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the current value.
    ///
    /// If called while a computation is evaluating, this also registers
    /// the computation as a subscriber of this cell.
    pub fn get(&self) -> T {
        self.subscribers.track_current();
        self.value.read().clone()
    }

    /// Get the current value without establishing a dependency.
    pub fn get_untracked(&self) -> T {
        self.value.read().clone()
    }

    /// Set a new value and notify subscribers on the default channel.
    ///
    /// No-op when `value` compares equal to the current value.
    pub fn set(&self, value: T) {
        self.write(value, None);
    }

    /// Set a new value, notifying subscribers on a specific channel.
    pub fn set_in(&self, value: T, mode: ScheduleMode) {
        self.write(value, Some(mode));
    }

    /// Update the value using a function of the current value.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let new_value = {
            let guard = self.value.read();
            f(&guard)
        };
        self.set(new_value);
    }

    /// Register a push-based subscriber, independent of the tracking
    /// context. The callback receives the cell's value as of each
    /// delivery.
    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let value = Arc::downgrade(&self.value);
        let observer = Arc::new(Observer::new(NodeId::new(), move || {
            if let Some(value) = value.upgrade() {
                let current = value.read().clone();
                f(&current);
            }
        }));
        self.subscribers.add(observer)
    }

    /// Get the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn write(&self, value: T, mode: Option<ScheduleMode>) {
        {
            let mut guard = self.value.write();
            if *guard == value {
                return;
            }
            *guard = value;
        }
        // The lock is released before notifying: subscribers are free to
        // read (or even write) this cell from their callbacks.
        self.subscribers.notify(mode);
    }
}

impl<T> Clone for StateCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            value: Arc::clone(&self.value),
            subscribers: self.subscribers.clone(),
        }
    }
}

impl<T> Debug for StateCell<T>
where
    T: Clone + PartialEq + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCell")
            .field("id", &self.id)
            .field("value", &self.get_untracked())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
