//! Reactive Primitives
//!
//! This module implements the dependency-tracking core: state cells,
//! derived values, and effects.
//!
//! # Concepts
//!
//! ## State Cells
//!
//! A [`StateCell`] is a container for mutable state. When a cell is read
//! while a derived value or effect is evaluating, the cell automatically
//! registers that computation as a dependent. When the cell's value
//! changes, dependents are notified through the scheduler.
//!
//! ## Derived Values
//!
//! A [`DerivedValue`] is a memoized computation over other reactive
//! nodes. It recomputes lazily, on the next read after a dependency
//! changed, and rebuilds its dependency set from scratch on every run,
//! so conditional reads prune edges that are no longer taken.
//!
//! ## Effects
//!
//! An [`Effect`] is a side-effecting computation that re-runs eagerly
//! whenever a dependency changes. Effects synchronize reactive state
//! with external systems and may return a cleanup that runs before each
//! re-run and on destruction.
//!
//! # Implementation Notes
//!
//! Dependency detection uses a thread-local tracking stack: while a
//! computation evaluates, every source it reads registers the
//! computation as a subscriber and hands back a release hook for the
//! edge. This "automatic dependency tracking" approach is the one used
//! by SolidJS, Vue 3, and Leptos.

mod cell;
mod context;
mod derived;
mod effect;
pub(crate) mod node;

pub use cell::StateCell;
pub use derived::DerivedValue;
pub use effect::{Cleanup, Effect, IntoCleanup};
#[doc(hidden)]
pub use effect::{ExplicitCleanupMarker, FnCleanupMarker, NoCleanupMarker};
pub use node::{NodeId, Subscription};
