//! Filament: a single-threaded cooperative fiber engine.
//!
//! # Overview
//!
//! Filament runs many logically-concurrent tasks on one OS thread. Each task
//! executes on its own fixed-size stack (a *fiber*) and can voluntarily
//! suspend itself while blocked on an external event; it is resumed when that
//! event fires. The engine owns the whole fiber lifecycle: allocating stacks,
//! pooling idle fibers, dispatching ready fibers, marshalling tasks submitted
//! from other OS threads onto the owning thread, and routing task panics to a
//! user callback.
//!
//! # Core guarantees
//!
//! - **Cooperative, single-threaded**: fibers of one engine never run in
//!   parallel with each other; the only suspension points are [`suspend`],
//!   [`run_in_main_context`], [`yield_now`], and task completion
//! - **Bounded memory**: resident stack memory is bounded by
//!   `stack_size * (active fibers + max_fibers_pool_size)`
//! - **Panic isolation**: a panicking task never unwinds into the scheduler;
//!   the payload is captured and routed to a finally hook or the exception
//!   callback
//! - **Cross-thread submission**: [`RemoteHandle`] and [`FiberWaker`] are the
//!   only `Send` surfaces; everything else is owning-thread only
//!
//! # Module structure
//!
//! - [`types`]: identifiers, fiber states, task results
//! - [`options`]: engine configuration
//! - [`stack`]: fiber stack allocation (plain heap or guard-paged)
//! - [`context`]: machine-context save/restore and fresh-stack setup
//! - [`remote`]: cross-thread submission handles and wakers
//! - [`loop_controller`]: host-loop integration surface
//! - [`manager`]: the [`FiberManager`] facade and the run loop
//! - [`error`]: error types
//!
//! Internally, `fiber` holds the per-task record, `queue` the intrusive
//! ready queue and pool free-list, `pool` the bounded fiber reuse, and
//! `locals` the copy-inherited fiber-local storage.
//!
//! # Example
//!
//! ```
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use std::sync::Arc;
//! use filament::{FiberManager, EngineOptions, SimpleLoopController};
//!
//! let manager = FiberManager::new(
//!     Arc::new(SimpleLoopController::new()),
//!     EngineOptions::default(),
//! );
//! let count = Rc::new(Cell::new(0));
//! for _ in 0..5 {
//!     let count = count.clone();
//!     manager.add_task(move || count.set(count.get() + 1));
//! }
//! manager.loop_until_no_ready();
//! assert_eq!(count.get(), 5);
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod context;
pub mod error;
mod fiber;
mod locals;
pub mod loop_controller;
pub mod manager;
pub mod options;
mod pool;
mod queue;
pub mod remote;
pub mod stack;
pub mod tracing_compat;
pub mod types;
mod util;

#[doc(hidden)]
pub mod test_utils;

pub use error::{Error, ErrorKind};
pub use loop_controller::{LoopController, SimpleLoopController};
pub use manager::{
    add_task, add_task_finally, on_fiber, run_in_main_context, suspend, with_local, yield_now,
    FiberManager,
};
pub use options::EngineOptions;
pub use remote::{FiberWaker, RemoteHandle};
pub use types::{FiberId, FiberState, PanicPayload, TaskResult};
