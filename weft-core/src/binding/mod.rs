//! Weak Binding Lifecycle
//!
//! A binding ties an effect to the liveness of an external owner (a UI
//! node, a document handle, any resource managed outside the reactive
//! graph). The binding holds only a weak reference: it never keeps the
//! owner alive, and its own lifetime is capped by the owner's.
//!
//! Every run of the bound effect first upgrades the weak reference.
//! While the owner is alive the body runs with a borrow of it. Once the
//! owner is gone, the run instead retires the binding through the same
//! teardown path as [`Binding::destroy`]: pending cleanup fires, the
//! effect deactivates, and the registry entry disappears. Detection is
//! best-effort: it happens on the next notification delivery, never
//! before the owner is actually unreachable. Callers that know the
//! owner's lifetime should still call [`Binding::destroy`] or
//! [`dispose_all`] explicitly.
//!
//! A process-wide registry maps each live owner to its active bindings,
//! which is what lets [`dispose_all`] tear everything down synchronously
//! instead of waiting for writes to trickle through.

use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use tracing::debug;

use crate::reactive::node::NodeId;
use crate::reactive::{Cleanup, Effect, IntoCleanup};

struct BindingEntry {
    node: NodeId,
    effect: Effect,
}

/// Owner allocation address → active bindings.
///
/// Keys stay valid for as long as any binding holds its `Weak` to the
/// owner (the weak count pins the allocation), and entries are removed
/// on retirement, so a key is never left pointing at a reused address.
static REGISTRY: OnceLock<DashMap<usize, Vec<BindingEntry>>> = OnceLock::new();

fn registry() -> &'static DashMap<usize, Vec<BindingEntry>> {
    REGISTRY.get_or_init(DashMap::new)
}

/// Handle to a bound effect.
///
/// Dropping the handle does nothing: the binding stays alive in the
/// registry until destroyed explicitly, its owner is disposed, or its
/// owner is reclaimed.
pub struct Binding {
    key: usize,
    effect: Effect,
}

impl Binding {
    /// Tear the binding down now: pending cleanup fires, future re-runs
    /// become no-ops, the registry forgets it. Idempotent.
    pub fn destroy(&self) {
        self.effect.destroy();
        remove_entry(self.key, self.effect.id());
    }

    /// Check whether the binding is still live.
    pub fn is_active(&self) -> bool {
        self.effect.is_active()
    }

    /// Get the ID of the underlying effect.
    pub fn id(&self) -> NodeId {
        self.effect.id()
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("id", &self.effect.id())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Bind a reactive effect to `owner`.
///
/// The body runs once immediately (the owner is known to be alive) and
/// re-runs like any effect when its tracked dependencies change, as long
/// as the owner is still around. It may return a cleanup callable with
/// the usual effect semantics.
pub fn bind<T, M, R, F>(owner: &Arc<T>, body: F) -> Binding
where
    T: Send + Sync + 'static,
    R: IntoCleanup<M>,
    F: FnMut(&T) -> R + Send + 'static,
{
    bind_weak(Arc::downgrade(owner), body)
}

/// Bind a reactive effect to an owner already held weakly.
///
/// If the owner is gone by the time this is called, the result is an
/// inert, inactive binding; creation racing reclamation is expected and
/// must not be fatal.
pub fn bind_weak<T, M, R, F>(owner: Weak<T>, body: F) -> Binding
where
    T: Send + Sync + 'static,
    R: IntoCleanup<M>,
    F: FnMut(&T) -> R + Send + 'static,
{
    let key = Weak::as_ptr(&owner) as usize;

    if owner.strong_count() == 0 {
        let effect = Effect::new_lazy(|| {});
        effect.destroy();
        return Binding { key, effect };
    }

    let mut body = body;
    // The effect needs its own handle to retire itself once the owner
    // vanishes; the slot is filled right after construction.
    let handle: Arc<OnceLock<Effect>> = Arc::new(OnceLock::new());
    let handle_for_body = Arc::clone(&handle);

    let effect = Effect::new(move || -> Option<Cleanup> {
        match owner.upgrade() {
            Some(target) => body(&target).into_cleanup(),
            None => {
                if let Some(effect) = handle_for_body.get() {
                    debug!(node = ?effect.id(), "owner reclaimed, retiring binding");
                    effect.destroy();
                    remove_entry(key, effect.id());
                }
                None
            }
        }
    });

    let _ = handle.set(effect.clone());
    registry().entry(key).or_default().push(BindingEntry {
        node: effect.id(),
        effect: effect.clone(),
    });

    Binding { key, effect }
}

/// Synchronously destroy every binding registered to `owner`.
pub fn dispose_all<T>(owner: &Arc<T>)
where
    T: Send + Sync + 'static,
{
    let key = Arc::as_ptr(owner) as usize;
    if let Some((_, entries)) = registry().remove(&key) {
        debug!(count = entries.len(), "disposing owner bindings");
        for entry in entries {
            entry.effect.destroy();
        }
    }
}

/// Get the number of bindings currently registered to `owner`.
pub fn active_bindings<T>(owner: &Arc<T>) -> usize
where
    T: Send + Sync + 'static,
{
    let key = Arc::as_ptr(owner) as usize;
    registry().get(&key).map(|entries| entries.len()).unwrap_or(0)
}

fn remove_entry(key: usize, node: NodeId) {
    if let Some(mut entries) = registry().get_mut(&key) {
        entries.retain(|entry| entry.node != node);
    }
    registry().remove_if(&key, |_, entries| entries.is_empty());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::StateCell;
    use crate::scheduler;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn binding_runs_while_owner_lives() {
        scheduler::clear();
        let owner = Arc::new("panel".to_string());
        let cell = StateCell::new(0);
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let (cell_for_body, log_clone) = (cell.clone(), log.clone());
        let binding = bind(&owner, move |target: &String| {
            log_clone
                .lock()
                .push(format!("{}={}", target, cell_for_body.get()));
        });

        assert_eq!(log.lock().as_slice(), ["panel=0"]);
        assert_eq!(active_bindings(&owner), 1);

        cell.set(3);
        assert_eq!(log.lock().as_slice(), ["panel=0", "panel=3"]);

        binding.destroy();
        assert!(!binding.is_active());
        assert_eq!(active_bindings(&owner), 0);

        cell.set(9);
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn dead_owner_retires_binding_on_next_delivery() {
        scheduler::clear();
        let owner = Arc::new(7u32);
        let cell = StateCell::new(0);
        let cleanups = Arc::new(AtomicI32::new(0));

        let (cell_for_body, cleanups_clone) = (cell.clone(), cleanups.clone());
        let binding = bind(&owner, move |_target: &u32| {
            cell_for_body.get();
            let cleanups_inner = cleanups_clone.clone();
            move || {
                cleanups_inner.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(binding.is_active());
        drop(owner);

        // The next delivery finds the owner gone and retires the
        // binding: pending cleanup fires, the effect deactivates.
        cell.set(1);
        assert!(!binding.is_active());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        // Nothing further happens on later writes.
        cell.set(2);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bind_weak_to_dead_owner_degrades_to_no_op() {
        scheduler::clear();
        let owner = Arc::new(1u8);
        let weak = Arc::downgrade(&owner);
        drop(owner);

        let runs = Arc::new(AtomicI32::new(0));
        let runs_clone = runs.clone();
        let binding = bind_weak(weak, move |_target: &u8| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!binding.is_active());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dispose_all_tears_down_every_binding() {
        scheduler::clear();
        let owner = Arc::new("window".to_string());
        let cell = StateCell::new(0);
        let runs = Arc::new(AtomicI32::new(0));

        let bindings: Vec<Binding> = (0..3)
            .map(|_| {
                let (cell_for_body, runs_clone) = (cell.clone(), runs.clone());
                bind(&owner, move |_target: &String| {
                    cell_for_body.get();
                    runs_clone.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(active_bindings(&owner), 3);

        dispose_all(&owner);
        assert_eq!(active_bindings(&owner), 0);
        assert!(bindings.iter().all(|b| !b.is_active()));

        cell.set(5);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
