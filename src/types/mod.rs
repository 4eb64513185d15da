//! Core types: identifiers, fiber states, task results.

mod id;
mod result;
mod state;

pub use id::FiberId;
pub use result::{PanicPayload, TaskResult};
pub use state::FiberState;
