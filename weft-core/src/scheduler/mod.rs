//! Notification Scheduler
//!
//! The scheduler decouples "a dependency changed" from "dependents are
//! notified". Every notification travels on one of three channels:
//!
//! - **sync**: delivered inline, as part of the write that triggered it.
//! - **micro** (the default): deliveries are coalesced into a pending
//!   queue and drained at the end of the current synchronous execution
//!   unit (the triggering write itself, or the outermost [`batch`]
//!   scope). A write queues all of its subscribers before the drain
//!   starts, and a node queued several times runs once.
//! - **manual**: deliveries queue up until an explicit [`flush`], for
//!   hosts that drive their own cadence (e.g. a render loop).
//!
//! # Re-entrancy
//!
//! Each deferred channel is an explicit idle → flushing → idle state
//! machine. A notification scheduled while its channel is flushing joins
//! the next generation of the same drain rather than starting a nested
//! flush; the drain loops until no generation remains. This is what
//! keeps a diamond-shaped graph convergent: both invalidations land
//! before the downstream effect's single coalesced run.
//!
//! # Error Isolation
//!
//! A panic raised by a callback during a deferred drain is caught,
//! logged via `tracing`, and does not stop the remaining callbacks of
//! that drain. Sync deliveries outside a batch propagate panics to the
//! writer.
//!
//! # Threading
//!
//! Scheduler state (queues, flags, default mode) is thread-local:
//! evaluation is single-threaded and cooperative, and a graph must not
//! be driven from two threads at once.

use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::reactive::node::{NodeId, Observer};

/// The notification channel a write delivers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleMode {
    /// Deliver inline, before the write returns.
    Sync,
    /// Coalesce and deliver at the end of the current execution unit.
    #[default]
    Micro,
    /// Queue until an explicit `flush()`.
    Manual,
}

impl fmt::Display for ScheduleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScheduleMode::Sync => "sync",
            ScheduleMode::Micro => "micro",
            ScheduleMode::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Error returned when parsing a [`ScheduleMode`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown schedule mode `{0}`, expected `sync`, `micro`, or `manual`")]
pub struct ParseScheduleModeError(String);

impl FromStr for ScheduleMode {
    type Err = ParseScheduleModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(ScheduleMode::Sync),
            "micro" => Ok(ScheduleMode::Micro),
            "manual" => Ok(ScheduleMode::Manual),
            other => Err(ParseScheduleModeError(other.to_string())),
        }
    }
}

/// A point-in-time view of the scheduler's queues and flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub pending_sync: usize,
    pub pending_micro: usize,
    pub pending_manual: usize,
    pub flushing_sync: bool,
    pub flushing_micro: bool,
    pub batching: bool,
}

type PendingQueue = IndexMap<NodeId, Arc<Observer>>;

struct SchedulerState {
    default_mode: ScheduleMode,
    pending_sync: PendingQueue,
    pending_micro: PendingQueue,
    pending_manual: PendingQueue,
    flushing_sync: bool,
    flushing_micro: bool,
    batch_depth: usize,
    notify_depth: usize,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            default_mode: ScheduleMode::default(),
            pending_sync: PendingQueue::new(),
            pending_micro: PendingQueue::new(),
            pending_manual: PendingQueue::new(),
            flushing_sync: false,
            flushing_micro: false,
            batch_depth: 0,
            notify_depth: 0,
        }
    }
}

thread_local! {
    static STATE: RefCell<SchedulerState> = RefCell::new(SchedulerState::new());
}

/// Set the channel used by writes that do not pick one explicitly.
/// Per-thread, like the rest of the scheduler state.
pub fn set_default_mode(mode: ScheduleMode) {
    STATE.with(|state| state.borrow_mut().default_mode = mode);
}

/// Get the current default channel.
pub fn default_mode() -> ScheduleMode {
    STATE.with(|state| state.borrow().default_mode)
}

/// Queue a notification on the given channel (or the default).
///
/// Called by `SubscriberSet::notify` for every subscriber of a changed
/// source.
pub(crate) fn schedule(observer: &Arc<Observer>, mode: Option<ScheduleMode>) {
    let mode = mode.unwrap_or_else(default_mode);
    trace!(node = ?observer.id(), %mode, "scheduling notification");

    match mode {
        ScheduleMode::Sync => {
            let deferred = STATE.with(|state| {
                let mut state = state.borrow_mut();
                if state.batch_depth > 0 {
                    state
                        .pending_sync
                        .entry(observer.id())
                        .or_insert_with(|| Arc::clone(observer));
                    true
                } else {
                    false
                }
            });
            if !deferred {
                // Inline is the sync contract; panics reach the writer.
                observer.fire();
            }
        }
        ScheduleMode::Micro => {
            let flush_now = STATE.with(|state| {
                let mut state = state.borrow_mut();
                state
                    .pending_micro
                    .entry(observer.id())
                    .or_insert_with(|| Arc::clone(observer));
                !state.flushing_micro
                    && !state.flushing_sync
                    && state.batch_depth == 0
                    && state.notify_depth == 0
            });
            if flush_now {
                flush_micro();
            }
        }
        ScheduleMode::Manual => {
            STATE.with(|state| {
                let mut state = state.borrow_mut();
                state
                    .pending_manual
                    .entry(observer.id())
                    .or_insert_with(|| Arc::clone(observer));
            });
        }
    }
}

/// Marks one source's notification fan-out.
///
/// Micro deliveries queued while any scope is open stay queued; the
/// outermost scope runs the flush when it ends. This is what makes a
/// write atomic from the queue's point of view: every subscriber of
/// the write is pending before the first one fires, so a single
/// unbatched write to a shared source still converges into one
/// delivery per downstream node.
pub(crate) struct NotifyScope;

impl NotifyScope {
    pub(crate) fn enter() -> Self {
        STATE.with(|state| state.borrow_mut().notify_depth += 1);
        Self
    }
}

impl Drop for NotifyScope {
    fn drop(&mut self) {
        let flush = STATE.with(|state| {
            let mut state = state.borrow_mut();
            state.notify_depth = state.notify_depth.saturating_sub(1);
            state.notify_depth == 0
                && !state.flushing_micro
                && !state.flushing_sync
                && state.batch_depth == 0
                && !state.pending_micro.is_empty()
        });
        if flush {
            flush_micro();
        }
    }
}

/// Run `f` with flush boundaries suspended.
///
/// Writes inside the scope accumulate into the pending queues; the
/// outermost `batch` call drains the sync queue and then the micro queue
/// on the way out, so several writes that transitively affect the same
/// node converge into a single delivery. Nested calls are flattened:
/// they run `f` directly.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    struct DepthGuard;
    impl Drop for DepthGuard {
        fn drop(&mut self) {
            STATE.with(|state| state.borrow_mut().batch_depth -= 1);
        }
    }

    let outermost = STATE.with(|state| {
        let mut state = state.borrow_mut();
        state.batch_depth += 1;
        state.batch_depth == 1
    });

    let result = {
        // If `f` panics the guard still rebalances the depth; pending
        // work stays queued and remains drainable via `flush()`.
        let _guard = DepthGuard;
        f()
    };

    if outermost {
        drain_sync();
        flush_micro();
    }
    result
}

/// Force every channel to drain synchronously, regardless of mode.
///
/// Manual-mode work queued during the drain stays queued for the next
/// explicit flush.
pub fn flush() {
    drain_sync();
    drain_manual();
    flush_micro();
}

/// Drop all pending notifications and reset channel states.
///
/// Intended for host teardown and test isolation; queued work is
/// discarded, not delivered.
pub fn clear() {
    STATE.with(|state| {
        let mut state = state.borrow_mut();
        state.pending_sync.clear();
        state.pending_micro.clear();
        state.pending_manual.clear();
        state.flushing_sync = false;
        state.flushing_micro = false;
        state.batch_depth = 0;
        state.notify_depth = 0;
    });
}

/// Get a snapshot of queue depths and channel states.
pub fn stats() -> SchedulerStats {
    STATE.with(|state| {
        let state = state.borrow();
        SchedulerStats {
            pending_sync: state.pending_sync.len(),
            pending_micro: state.pending_micro.len(),
            pending_manual: state.pending_manual.len(),
            flushing_sync: state.flushing_sync,
            flushing_micro: state.flushing_micro,
            batching: state.batch_depth > 0,
        }
    })
}

/// Drain the micro queue, generation by generation, until quiescent.
fn flush_micro() {
    let entered = STATE.with(|state| {
        let mut state = state.borrow_mut();
        if state.flushing_micro {
            false
        } else {
            state.flushing_micro = true;
            true
        }
    });
    if !entered {
        return;
    }

    struct FlushGuard;
    impl Drop for FlushGuard {
        fn drop(&mut self) {
            STATE.with(|state| state.borrow_mut().flushing_micro = false);
        }
    }
    let _guard = FlushGuard;

    loop {
        let generation = STATE.with(|state| std::mem::take(&mut state.borrow_mut().pending_micro));
        if generation.is_empty() {
            break;
        }
        debug!(tasks = generation.len(), "draining micro channel");
        for (_, observer) in generation {
            fire_isolated(&observer);
        }
    }
}

/// Drain sync notifications deferred by a batch. Caught per callback:
/// one failing subscriber must not block the rest of the boundary flush.
fn drain_sync() {
    let entered = STATE.with(|state| {
        let mut state = state.borrow_mut();
        if state.flushing_sync {
            false
        } else {
            state.flushing_sync = true;
            true
        }
    });
    if !entered {
        return;
    }

    struct FlushGuard;
    impl Drop for FlushGuard {
        fn drop(&mut self) {
            STATE.with(|state| state.borrow_mut().flushing_sync = false);
        }
    }
    let _guard = FlushGuard;

    loop {
        let generation = STATE.with(|state| std::mem::take(&mut state.borrow_mut().pending_sync));
        if generation.is_empty() {
            break;
        }
        debug!(tasks = generation.len(), "draining sync channel");
        for (_, observer) in generation {
            fire_isolated(&observer);
        }
    }
}

/// Drain the manual queue once. Arrivals during the drain wait for the
/// next explicit flush.
fn drain_manual() {
    let queue = STATE.with(|state| std::mem::take(&mut state.borrow_mut().pending_manual));
    if queue.is_empty() {
        return;
    }
    debug!(tasks = queue.len(), "draining manual channel");
    for (_, observer) in queue {
        fire_isolated(&observer);
    }
}

fn fire_isolated(observer: &Arc<Observer>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| observer.fire())) {
        error!(
            node = ?observer.id(),
            panic = panic_message(payload.as_ref()),
            "subscriber panicked during flush"
        );
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::StateCell;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn counting_cell() -> (StateCell<i32>, Arc<AtomicI32>) {
        let cell = StateCell::new(0);
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        cell.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        })
        .leak();
        (cell, calls)
    }

    #[test]
    fn micro_writes_coalesce_inside_batch() {
        clear();
        let (cell, calls) = counting_cell();

        batch(|| {
            cell.set(1);
            cell.set(2);
            cell.set(3);
            // Nothing delivered yet.
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        });

        // Three writes, one delivery.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn micro_write_outside_batch_delivers_before_returning() {
        clear();
        let (cell, calls) = counting_cell();

        cell.set(1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats().pending_micro, 0);
    }

    #[test]
    fn sync_write_delivers_inline() {
        clear();
        set_default_mode(ScheduleMode::Sync);
        let (cell, calls) = counting_cell();

        cell.set(1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        set_default_mode(ScheduleMode::Micro);
    }

    #[test]
    fn manual_mode_waits_for_flush() {
        clear();
        let (cell, calls) = counting_cell();

        cell.set_in(1, ScheduleMode::Manual);
        cell.set_in(2, ScheduleMode::Manual);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(stats().pending_manual, 1);

        flush();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats().pending_manual, 0);

        flush();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_batches_flatten() {
        clear();
        let (cell, calls) = counting_cell();

        let result = batch(|| {
            cell.set(1);
            let inner = batch(|| {
                cell.set(2);
                // Still batching: the inner scope must not flush.
                assert_eq!(calls.load(Ordering::SeqCst), 0);
                "inner"
            });
            assert_eq!(inner, "inner");
            assert_eq!(calls.load(Ordering::SeqCst), 0);
            "outer"
        });

        assert_eq!(result, "outer");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!stats().batching);
    }

    #[test]
    fn panicking_subscriber_does_not_block_the_flush() {
        clear();
        let cell = StateCell::new(0);
        let survivor = Arc::new(AtomicI32::new(0));

        cell.subscribe(|_| {
            panic!("subscriber failure");
        })
        .leak();
        let survivor_clone = survivor.clone();
        cell.subscribe(move |_| {
            survivor_clone.fetch_add(1, Ordering::SeqCst);
        })
        .leak();

        // Micro flush isolates the panic and keeps draining.
        cell.set(1);
        assert_eq!(survivor.load(Ordering::SeqCst), 1);
        assert!(!stats().flushing_micro);
    }

    #[test]
    fn clear_discards_pending_work() {
        clear();
        let (cell, calls) = counting_cell();

        cell.set_in(1, ScheduleMode::Manual);
        assert_eq!(stats().pending_manual, 1);

        clear();
        flush();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn mode_round_trips_through_strings() {
        for mode in [ScheduleMode::Sync, ScheduleMode::Micro, ScheduleMode::Manual] {
            assert_eq!(mode.to_string().parse::<ScheduleMode>(), Ok(mode));
        }
        assert!("eager".parse::<ScheduleMode>().is_err());
    }

    #[test]
    fn default_mode_is_micro() {
        assert_eq!(ScheduleMode::default(), ScheduleMode::Micro);
    }
}
