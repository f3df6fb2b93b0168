//! Effect Implementation
//!
//! An `Effect` is a side-effecting computation that re-runs whenever its
//! dependencies change.
//!
//! # Differences from DerivedValue
//!
//! - Derived values return a value; effects do not.
//! - Derived values are lazy (recompute on read); effects are eager
//!   (invalidation re-executes the body directly).
//!
//! # Cleanup
//!
//! The body may return a cleanup callable. At most one cleanup is
//! pending at any time: it runs immediately before the next body run and
//! exactly once on [`destroy`](Effect::destroy), never both.
//!
//! ```rust,ignore
//! let connection = StateCell::new("db-1".to_string());
//! let connection_for_effect = connection.clone();
//! let effect = Effect::new(move || {
//!     let handle = open(&connection_for_effect.get());
//!     move || handle.close()
//! });
//! // ... later
//! effect.destroy();
//! ```
//!
//! # Failure Semantics
//!
//! A panic in the body or a cleanup propagates to whoever triggered the
//! run: the creator, or the writer whose notification cascaded here
//! synchronously. The scheduler isolates panics raised during deferred
//! flushes instead, so one failing effect does not starve the rest of a
//! flush.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::context::TrackedRun;
use super::node::{NodeId, Observer, ReleaseList};

/// A deferred teardown action returned by an effect body.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Conversion from an effect body's return value into an optional
/// cleanup. Lets a body return nothing, a closure, or an explicit
/// `Option<Cleanup>`. The `Marker` parameter keeps the three shapes
/// from overlapping in trait resolution; callers never name it.
pub trait IntoCleanup<Marker> {
    fn into_cleanup(self) -> Option<Cleanup>;
}

#[doc(hidden)]
pub struct NoCleanupMarker;

#[doc(hidden)]
pub struct ExplicitCleanupMarker;

#[doc(hidden)]
pub struct FnCleanupMarker;

impl IntoCleanup<NoCleanupMarker> for () {
    fn into_cleanup(self) -> Option<Cleanup> {
        None
    }
}

impl IntoCleanup<ExplicitCleanupMarker> for Option<Cleanup> {
    fn into_cleanup(self) -> Option<Cleanup> {
        self
    }
}

impl<F> IntoCleanup<FnCleanupMarker> for F
where
    F: FnOnce() + Send + 'static,
{
    fn into_cleanup(self) -> Option<Cleanup> {
        Some(Box::new(self))
    }
}

/// Shared state behind every handle to one effect.
struct EffectState {
    id: NodeId,

    /// Cleared by `destroy`; a queued re-run observed afterwards is a
    /// no-op.
    active: AtomicBool,

    /// The effect body. Held in a mutex so a re-entrant notification
    /// (the body writing a cell it itself observes, delivered on the
    /// sync channel) is detected and skipped instead of recursing.
    body: Mutex<Box<dyn FnMut() -> Option<Cleanup> + Send>>,

    /// The pending cleanup from the most recent run, if any.
    cleanup: Mutex<Option<Cleanup>>,

    /// Release hooks for the current dependency set.
    releases: Mutex<ReleaseList>,

    /// Number of completed runs.
    run_count: AtomicUsize,
}

/// An eagerly re-run side-effecting reaction to reactive changes.
///
/// # Example
///
/// ```rust,ignore
/// let count = StateCell::new(0);
/// let count_for_effect = count.clone();
///
/// let effect = Effect::new(move || {
///     println!("count is {}", count_for_effect.get());
/// });
///
/// count.set(5); // prints: "count is 5"
/// effect.destroy();
/// count.set(9); // prints nothing
/// ```
pub struct Effect {
    state: Arc<EffectState>,
    observer: Arc<Observer>,
}

impl Effect {
    /// Create a new effect. The body runs once, synchronously, to
    /// produce the side effect and establish its initial dependencies.
    pub fn new<M, R, F>(body: F) -> Self
    where
        R: IntoCleanup<M>,
        F: FnMut() -> R + Send + 'static,
    {
        let effect = Self::new_lazy(body);
        effect.execute();
        effect
    }

    /// Create a new effect without running it.
    ///
    /// The effect has no dependencies until [`execute`](Self::execute)
    /// is called, so it will not re-run on its own.
    pub fn new_lazy<M, R, F>(body: F) -> Self
    where
        R: IntoCleanup<M>,
        F: FnMut() -> R + Send + 'static,
    {
        let mut body = body;
        let state = Arc::new(EffectState {
            id: NodeId::new(),
            active: AtomicBool::new(true),
            body: Mutex::new(Box::new(move || body().into_cleanup())),
            cleanup: Mutex::new(None),
            releases: Mutex::new(ReleaseList::new()),
            run_count: AtomicUsize::new(0),
        });

        let id = state.id;
        let weak_state = Arc::downgrade(&state);
        let observer = Arc::new_cyclic(|weak_observer: &Weak<Observer>| {
            let weak_observer = weak_observer.clone();
            Observer::new(id, move || {
                if let (Some(state), Some(observer)) =
                    (weak_state.upgrade(), weak_observer.upgrade())
                {
                    run_effect(&state, &observer);
                }
            })
        });

        Self { state, observer }
    }

    /// Get the effect's unique ID.
    pub fn id(&self) -> NodeId {
        self.state.id
    }

    /// Run the effect body now, re-tracking dependencies.
    ///
    /// No-op once destroyed, or when called from inside the body itself.
    pub fn execute(&self) {
        run_effect(&self.state, &self.observer);
    }

    /// Destroy the effect.
    ///
    /// Invokes the pending cleanup (if any), releases the dependency
    /// set, and makes every queued or future re-run a no-op. Idempotent.
    pub fn destroy(&self) {
        if self.state.active.swap(false, Ordering::SeqCst) {
            let cleanup = self.state.cleanup.lock().take();
            if let Some(cleanup) = cleanup {
                cleanup();
            }
            let releases: ReleaseList = std::mem::take(&mut *self.state.releases.lock());
            for release in releases {
                release();
            }
        }
    }

    /// Check whether the effect is still live.
    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Get the number of completed runs.
    pub fn run_count(&self) -> usize {
        self.state.run_count.load(Ordering::SeqCst)
    }
}

fn run_effect(state: &Arc<EffectState>, observer: &Arc<Observer>) {
    if !state.active.load(Ordering::SeqCst) {
        return;
    }

    // Re-entrancy guard: the body is already running on this thread.
    let Some(mut body) = state.body.try_lock() else {
        return;
    };

    // Cleanup from the previous run fires before the body, every run.
    let cleanup = state.cleanup.lock().take();
    if let Some(cleanup) = cleanup {
        cleanup();
    }

    let old: ReleaseList = std::mem::take(&mut *state.releases.lock());
    for release in old {
        release();
    }

    // The guard commits the new release hooks even if the body panics:
    // a partial run's edges stay registered and prunable, and the
    // effect keeps re-running on later changes.
    let cleanup = {
        let _tracking = TrackedRun::enter(Arc::clone(observer), &state.releases);
        (*body)()
    };
    drop(body);

    state.run_count.fetch_add(1, Ordering::SeqCst);

    if state.active.load(Ordering::SeqCst) {
        *state.cleanup.lock() = cleanup;
    } else if let Some(cleanup) = cleanup {
        // Destroyed from inside its own run: the returned cleanup would
        // otherwise never fire.
        cleanup();
    }
}

impl Clone for Effect {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            observer: Arc::clone(&self.observer),
        }
    }
}

impl Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.state.id)
            .field("active", &self.is_active())
            .field("run_count", &self.run_count())
            .finish()
    }
}
