//! Weft Core
//!
//! This crate provides the core runtime for the Weft fine-grained
//! reactive framework. It implements:
//!
//! - Reactive primitives (state cells, derived values, effects)
//! - A notification scheduler with sync, deferred, and manual channels
//! - A weak-ownership binding lifecycle for externally-owned resources
//!
//! Rendering layers, templates, and application-level binding sugar live
//! outside this crate; they consume the runtime by reading and writing
//! cells and by registering bindings against their own resources.
//!
//! # Architecture
//!
//! - `reactive`: dependency tracking and the three node kinds
//! - `scheduler`: batching, flush channels, and error isolation
//! - `binding`: effects tied to the liveness of an external owner
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_core::{batch, DerivedValue, Effect, StateCell};
//!
//! let count = StateCell::new(0);
//!
//! let count_for_doubled = count.clone();
//! let doubled = DerivedValue::new(move || count_for_doubled.get() * 2);
//!
//! let effect = Effect::new(move || {
//!     println!("doubled is {}", doubled.get());
//! }); // prints: "doubled is 0"
//!
//! batch(|| {
//!     count.set(2);
//!     count.set(5);
//! }); // prints once: "doubled is 10"
//!
//! effect.destroy();
//! ```

pub mod binding;
pub mod reactive;
pub mod scheduler;

pub use binding::{active_bindings, bind, bind_weak, dispose_all, Binding};
pub use reactive::{Cleanup, DerivedValue, Effect, IntoCleanup, NodeId, StateCell, Subscription};
pub use scheduler::{
    batch, default_mode, flush, set_default_mode, ParseScheduleModeError, ScheduleMode,
    SchedulerStats,
};
