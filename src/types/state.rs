//! Fiber lifecycle states.

use core::fmt;

/// The lifecycle state of a fiber.
///
/// Exactly one of the following holds for each non-invalid fiber: it is in
/// the ready queue, it is the running fiber, or it is suspended and held only
/// by an external waker. Pooled fibers are `Invalid` and retain their stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FiberState {
    /// No task bound; the fiber sits in the free pool.
    #[default]
    Invalid,
    /// A task is bound and the initial context is set up, but the fiber has
    /// never been switched into.
    NotStarted,
    /// Runnable; the fiber sits in the ready queue.
    Ready,
    /// Currently executing on its own stack.
    Running,
    /// Suspended in [`suspend`](crate::suspend); detached from the scheduler
    /// until an external waker fires.
    Awaiting,
    /// Returned to the main context for a bounded main-context call or a
    /// cooperative yield; will be resumed by the loop.
    Yielded,
    /// The task ran to completion; the fiber is about to be reset.
    Completed,
}

impl FiberState {
    /// Returns true if the fiber may be switched into from the main context.
    #[must_use]
    pub const fn is_runnable(self) -> bool {
        matches!(self, Self::NotStarted | Self::Ready | Self::Yielded)
    }

    /// Returns true if the fiber holds a live task (any non-pooled state).
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Invalid)
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invalid => "invalid",
            Self::NotStarted => "not-started",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Awaiting => "awaiting",
            Self::Yielded => "yielded",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_invalid() {
        assert_eq!(FiberState::default(), FiberState::Invalid);
    }

    #[test]
    fn runnable_states() {
        assert!(FiberState::NotStarted.is_runnable());
        assert!(FiberState::Ready.is_runnable());
        assert!(FiberState::Yielded.is_runnable());
        assert!(!FiberState::Awaiting.is_runnable());
        assert!(!FiberState::Invalid.is_runnable());
        assert!(!FiberState::Completed.is_runnable());
    }

    #[test]
    fn live_states() {
        assert!(!FiberState::Invalid.is_live());
        assert!(FiberState::Running.is_live());
        assert!(FiberState::Awaiting.is_live());
    }
}
