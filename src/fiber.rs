//! The per-task fiber record.
//!
//! A [`Fiber`] owns one stack and the saved machine context of its paused
//! execution, carries the type-erased task slots the scheduler dispatches
//! on, and embeds the intrusive links used by the ready queue and the pool
//! free-list. Fibers live in the engine's arena; queues refer to them by
//! [`FiberId`] only.

use crate::context::{init_context, MachineContext};
use crate::locals::LocalsMap;
use crate::remote::FiberWaker;
use crate::stack::FiberStack;
use crate::types::{FiberId, FiberState, PanicPayload};

/// A type-erased task body, run once on the fiber stack.
pub(crate) type TaskFn = Box<dyn FnOnce()>;

/// A lifetime-erased main-context function; see the await and main-bounce
/// protocols in [`manager`](crate::manager) for the validity rules.
pub(crate) type RawMainFn = *mut (dyn FnMut() + 'static);

/// A lifetime-erased wait function receiving the suspended fiber's waker.
pub(crate) type RawWaitFn = *mut (dyn FnMut(FiberWaker) + 'static);

/// Queue tag value meaning "not in any queue".
pub(crate) const QUEUE_TAG_NONE: u8 = 0;

/// One task in flight (or one pooled idle stack).
pub(crate) struct Fiber {
    /// Lifecycle state; also encodes pool membership (`Invalid`).
    pub state: FiberState,
    /// The owned stack. Retained while pooled.
    pub stack: FiberStack,
    /// Saved machine context; meaningful in every paused live state.
    pub context: MachineContext,
    /// The task body, taken by the trampoline on first entry.
    pub task: Option<TaskFn>,
    /// Run on the main context immediately before the first switch-in.
    pub ready_fn: Option<TaskFn>,
    /// Run on the main context after completion, consuming the result.
    pub finally_fn: Option<TaskFn>,
    /// Wait function installed by a suspend, run once on the main context.
    pub await_fn: Option<RawWaitFn>,
    /// Deferred function installed by a main-context bounce.
    pub immediate_fn: Option<RawMainFn>,
    /// Fiber-local cells, copy-inherited by child tasks at submission.
    pub locals: LocalsMap,
    /// Panic captured by the trampoline, if the task escaped with one.
    pub panic: Option<PanicPayload>,
    /// Bumped on every reset; wakers carry the epoch they were issued under
    /// so a wake aimed at a finished task cannot hit the slot's next tenant.
    pub epoch: u64,
    /// Next fiber in whatever queue this fiber is linked into.
    pub next_in_queue: Option<FiberId>,
    /// Previous fiber in whatever queue this fiber is linked into.
    pub prev_in_queue: Option<FiberId>,
    /// Which queue the links belong to; [`QUEUE_TAG_NONE`] when unlinked.
    pub queue_tag: u8,
}

impl Fiber {
    /// Creates an idle fiber owning `stack`.
    pub fn new(stack: FiberStack) -> Self {
        Self {
            state: FiberState::Invalid,
            stack,
            context: MachineContext::default(),
            task: None,
            ready_fn: None,
            finally_fn: None,
            await_fn: None,
            immediate_fn: None,
            locals: LocalsMap::new(),
            panic: None,
            epoch: 0,
            next_in_queue: None,
            prev_in_queue: None,
            queue_tag: QUEUE_TAG_NONE,
        }
    }

    /// Binds a fresh task onto an idle fiber and points its context at the
    /// trampoline, transitioning `Invalid` → `NotStarted`.
    pub fn prepare(&mut self, task: TaskFn, entry: extern "C" fn() -> !) {
        debug_assert_eq!(self.state, FiberState::Invalid, "prepare on a live fiber");
        debug_assert!(self.task.is_none());
        self.task = Some(task);
        self.context = init_context(&self.stack, entry);
        self.state = FiberState::NotStarted;
    }

    /// Clears every per-task slot and returns the fiber to `Invalid`,
    /// keeping the stack for reuse. Outstanding wakers are invalidated by
    /// the epoch bump.
    pub fn reset(&mut self) {
        debug_assert!(!self.is_in_queue(), "reset while queued");
        self.state = FiberState::Invalid;
        self.task = None;
        self.ready_fn = None;
        self.finally_fn = None;
        self.await_fn = None;
        self.immediate_fn = None;
        self.locals = LocalsMap::new();
        self.panic = None;
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// Returns true if this fiber is linked into some queue.
    #[must_use]
    pub const fn is_in_queue(&self) -> bool {
        self.queue_tag != QUEUE_TAG_NONE
    }

    /// Returns true if this fiber is linked into the queue with `tag`.
    #[must_use]
    pub const fn is_in_queue_tag(&self, tag: u8) -> bool {
        self.queue_tag == tag
    }

    /// Links this fiber into a queue.
    pub fn set_queue_links(&mut self, prev: Option<FiberId>, next: Option<FiberId>, tag: u8) {
        self.prev_in_queue = prev;
        self.next_in_queue = next;
        self.queue_tag = tag;
    }

    /// Unlinks this fiber from its queue.
    pub fn clear_queue_links(&mut self) {
        self.prev_in_queue = None;
        self.next_in_queue = None;
        self.queue_tag = QUEUE_TAG_NONE;
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("state", &self.state)
            .field("epoch", &self.epoch)
            .field("queue_tag", &self.queue_tag)
            .field("has_task", &self.task.is_some())
            .field("has_finally", &self.finally_fn.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stack::{StackAllocator, MIN_STACK_SIZE};

    pub(crate) extern "C" fn unreachable_entry() -> ! {
        unreachable!("test fiber was switched into");
    }

    pub(crate) fn idle_fiber() -> Fiber {
        Fiber::new(StackAllocator::Heap.allocate(MIN_STACK_SIZE).unwrap())
    }

    #[test]
    fn prepare_transitions_to_not_started() {
        let mut fiber = idle_fiber();
        fiber.prepare(Box::new(|| {}), unreachable_entry);
        assert_eq!(fiber.state, FiberState::NotStarted);
        assert!(fiber.task.is_some());
    }

    #[test]
    fn reset_clears_slots_and_bumps_epoch() {
        let mut fiber = idle_fiber();
        fiber.prepare(Box::new(|| {}), unreachable_entry);
        fiber.state = FiberState::Completed;
        fiber.panic = Some(PanicPayload::new("boom"));
        let epoch = fiber.epoch;

        fiber.reset();
        assert_eq!(fiber.state, FiberState::Invalid);
        assert!(fiber.task.is_none());
        assert!(fiber.panic.is_none());
        assert_eq!(fiber.epoch, epoch + 1);
    }

    #[test]
    fn queue_links_roundtrip() {
        let mut fiber = idle_fiber();
        assert!(!fiber.is_in_queue());

        let other = FiberId::new_for_test(4, 0);
        fiber.set_queue_links(Some(other), None, 1);
        assert!(fiber.is_in_queue());
        assert!(fiber.is_in_queue_tag(1));
        assert!(!fiber.is_in_queue_tag(2));

        fiber.clear_queue_links();
        assert!(!fiber.is_in_queue());
    }
}
