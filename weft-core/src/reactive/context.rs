//! Tracking Context
//!
//! The tracking context records which computation is currently running.
//! This enables automatic dependency tracking: when a cell or derived
//! value is read, the source can register the current computation as a
//! dependent without the caller wiring anything up by hand.
//!
//! # Implementation
//!
//! A thread-local stack holds one frame per computation that is currently
//! evaluating. Entering a scope pushes a frame; the computation runs; the
//! scope's drop pops the frame again. The stack supports nested
//! evaluations (a derived value read from inside an effect, a derived
//! value depending on another derived value) and is empty at rest.
//!
//! Each frame also accumulates the release hooks handed out by the
//! sources the computation reads. The computation takes the collected
//! hooks before leaving the scope and invokes them ahead of its next run,
//! which is what makes dependency sets fully dynamic: edges that were not
//! re-established during the latest run disappear.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::Mutex;

use super::node::{NodeId, Observer, ReleaseFn, ReleaseList};

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<Frame>> = RefCell::new(Vec::new());
}

/// An entry in the tracking stack.
struct Frame {
    /// The observer of the computation that is evaluating.
    observer: Arc<Observer>,
    /// Release hooks for the dependency edges established so far.
    releases: ReleaseList,
}

/// Guard that pops the tracking frame when dropped.
///
/// This keeps the stack balanced even if the computation panics.
pub(crate) struct TrackingScope {
    id: NodeId,
}

impl TrackingScope {
    /// Enter a new tracking frame for the given observer.
    ///
    /// While the frame is on top of the stack, any source that is read
    /// registers the observer as a dependent.
    pub(crate) fn enter(observer: Arc<Observer>) -> Self {
        let id = observer.id();
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(Frame {
                observer,
                releases: ReleaseList::new(),
            });
        });

        Self { id }
    }

    /// Check whether any computation is currently being tracked.
    pub(crate) fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| !stack.borrow().is_empty())
    }

    /// Get the observer of the innermost evaluating computation, if any.
    pub(crate) fn current_observer() -> Option<Arc<Observer>> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().map(|frame| frame.observer.clone()))
    }

    /// Record a release hook for a dependency edge established during the
    /// current evaluation. Called by sources when they register the
    /// current observer.
    pub(crate) fn record_release(release: ReleaseFn) {
        CONTEXT_STACK.with(|stack| {
            if let Some(frame) = stack.borrow_mut().last_mut() {
                frame.releases.push(release);
            }
        });
    }

    /// Take the release hooks collected in this scope's frame.
    ///
    /// Must be called before the scope is dropped.
    pub(crate) fn take_releases(&self) -> ReleaseList {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.last_mut() {
                Some(frame) => {
                    debug_assert_eq!(
                        frame.observer.id(),
                        self.id,
                        "TrackingScope mismatch while draining releases"
                    );
                    std::mem::take(&mut frame.releases)
                }
                None => ReleaseList::new(),
            }
        })
    }
}

/// Tracking scope that commits its release hooks to a node's list when
/// the run ends, whether the body returned or panicked.
///
/// A run that unwinds partway through has already registered edges
/// upstream; their hooks must land in the node's release list anyway,
/// or those edges could never be pruned by a later successful run.
pub(crate) struct TrackedRun<'a> {
    scope: TrackingScope,
    releases: &'a Mutex<ReleaseList>,
}

impl<'a> TrackedRun<'a> {
    pub(crate) fn enter(observer: Arc<Observer>, releases: &'a Mutex<ReleaseList>) -> Self {
        Self {
            scope: TrackingScope::enter(observer),
            releases,
        }
    }
}

impl Drop for TrackedRun<'_> {
    fn drop(&mut self) {
        let collected = self.scope.take_releases();
        if !collected.is_empty() {
            self.releases.lock().extend(collected);
        }
    }
}

impl Drop for TrackingScope {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            // Catch mismatched enter/drop pairs early in debug builds.
            if let Some(frame) = popped {
                debug_assert_eq!(
                    frame.observer.id(),
                    self.id,
                    "TrackingScope mismatch: expected {:?}, got {:?}",
                    self.id,
                    frame.observer.id()
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observer() -> Arc<Observer> {
        Arc::new(Observer::new(NodeId::new(), || {}))
    }

    #[test]
    fn scope_tracks_observer() {
        let obs = observer();
        let id = obs.id();

        assert!(!TrackingScope::is_active());
        assert!(TrackingScope::current_observer().is_none());

        {
            let _scope = TrackingScope::enter(obs);

            assert!(TrackingScope::is_active());
            assert_eq!(TrackingScope::current_observer().map(|o| o.id()), Some(id));
        }

        // Frame is gone after the scope drops.
        assert!(!TrackingScope::is_active());
        assert!(TrackingScope::current_observer().is_none());
    }

    #[test]
    fn scope_collects_releases() {
        let scope = TrackingScope::enter(observer());

        TrackingScope::record_release(Box::new(|| {}));
        TrackingScope::record_release(Box::new(|| {}));
        TrackingScope::record_release(Box::new(|| {}));

        let releases = scope.take_releases();
        assert_eq!(releases.len(), 3);

        // Draining twice yields nothing new.
        assert!(scope.take_releases().is_empty());
    }

    #[test]
    fn nested_scopes() {
        let outer = observer();
        let inner = observer();
        let outer_id = outer.id();
        let inner_id = inner.id();

        {
            let _outer_scope = TrackingScope::enter(outer);
            assert_eq!(
                TrackingScope::current_observer().map(|o| o.id()),
                Some(outer_id)
            );

            {
                let _inner_scope = TrackingScope::enter(inner);
                assert_eq!(
                    TrackingScope::current_observer().map(|o| o.id()),
                    Some(inner_id)
                );
            }

            // After the inner scope drops, the outer frame is current again.
            assert_eq!(
                TrackingScope::current_observer().map(|o| o.id()),
                Some(outer_id)
            );
        }

        assert!(TrackingScope::current_observer().is_none());
    }

    #[test]
    fn tracked_run_commits_releases_on_unwind() {
        let releases = Mutex::new(ReleaseList::new());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _run = TrackedRun::enter(observer(), &releases);
            TrackingScope::record_release(Box::new(|| {}));
            panic!("body failure");
        }));

        // The hook landed in the destination and the stack is balanced.
        assert!(result.is_err());
        assert_eq!(releases.lock().len(), 1);
        assert!(!TrackingScope::is_active());
    }

    #[test]
    fn tracked_run_commits_releases_on_return() {
        let releases = Mutex::new(ReleaseList::new());

        {
            let _run = TrackedRun::enter(observer(), &releases);
            TrackingScope::record_release(Box::new(|| {}));
            TrackingScope::record_release(Box::new(|| {}));
        }

        assert_eq!(releases.lock().len(), 2);
    }

    #[test]
    fn releases_attach_to_the_innermost_frame() {
        let outer_scope = TrackingScope::enter(observer());

        {
            let inner_scope = TrackingScope::enter(observer());
            TrackingScope::record_release(Box::new(|| {}));
            assert_eq!(inner_scope.take_releases().len(), 1);
        }

        assert!(outer_scope.take_releases().is_empty());
    }
}
