//! Cross-thread submission and wake queues.
//!
//! Two lock-free MPSC queues connect other threads to the engine: one for
//! newly submitted tasks, one for wake-ups of existing fibers. Any thread
//! may produce; only the owning thread drains, during the run loop. A push
//! while the engine appears idle asks the [`LoopController`] to get the loop
//! running again; the `loop_scheduled` flag keeps that to one request per
//! wakeup.

use crate::locals::LocalsMap;
use crate::loop_controller::LoopController;
use crate::manager;
use crate::tracing_compat::trace;
use crate::types::FiberId;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A wake aimed at one suspension of one fiber.
///
/// The epoch pins the wake to the task that installed it; a stale wake
/// (fiber slot since recycled) is dropped instead of hitting the next
/// tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WakeTarget {
    pub id: FiberId,
    pub epoch: u64,
}

/// A task submitted from a non-owning thread, consumed exactly once when the
/// loop drains the queue and promotes it into a fiber.
pub(crate) struct RemoteTask {
    pub func: Box<dyn FnOnce() + Send>,
    /// Snapshot of the submitting fiber's locals, when the submitter was a
    /// fiber of this engine.
    pub locals: Option<LocalsMap>,
}

impl std::fmt::Debug for RemoteTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTask")
            .field("inherits_locals", &self.locals.is_some())
            .finish()
    }
}

/// The `Send + Sync` half of an engine: remote queues, the loop-scheduled
/// flag, and the controller hook.
pub(crate) struct RemoteShared {
    tasks: SegQueue<RemoteTask>,
    ready: SegQueue<WakeTarget>,
    loop_scheduled: AtomicBool,
    controller: Arc<dyn LoopController>,
}

impl RemoteShared {
    pub fn new(controller: Arc<dyn LoopController>) -> Self {
        Self {
            tasks: SegQueue::new(),
            ready: SegQueue::new(),
            loop_scheduled: AtomicBool::new(false),
            controller,
        }
    }

    /// Returns true if either remote queue holds undrained work.
    pub fn has_pending(&self) -> bool {
        !self.tasks.is_empty() || !self.ready.is_empty()
    }

    /// Pops one queued remote task; owning thread only.
    pub fn pop_task(&self) -> Option<RemoteTask> {
        self.tasks.pop()
    }

    /// Pops one queued remote wake; owning thread only.
    pub fn pop_ready(&self) -> Option<WakeTarget> {
        self.ready.pop()
    }

    /// Clears the scheduled flag at loop entry, so work arriving during or
    /// after this run re-arms scheduling.
    pub fn clear_loop_scheduled(&self) {
        self.loop_scheduled.store(false, Ordering::Release);
    }

    /// Requests a loop run from the owning thread, at most once per wakeup.
    pub fn ensure_loop_scheduled(&self) {
        if !self.loop_scheduled.swap(true, Ordering::AcqRel) {
            self.controller.schedule();
        }
    }

    /// Requests a loop run from any thread, at most once per wakeup.
    pub fn ensure_loop_scheduled_remote(&self) {
        if !self.loop_scheduled.swap(true, Ordering::AcqRel) {
            self.controller.schedule_thread_safe();
        }
    }

    /// Enqueues a task from any thread and gets the loop scheduled.
    pub fn push_task(&self, task: RemoteTask) {
        self.tasks.push(task);
        self.ensure_loop_scheduled_remote();
    }

    /// Enqueues a wake from any thread and gets the loop scheduled.
    pub fn push_ready(&self, target: WakeTarget) {
        trace!(fiber = ?target.id, "cross-thread wake enqueued");
        self.ready.push(target);
        self.ensure_loop_scheduled_remote();
    }
}

impl std::fmt::Debug for RemoteShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteShared")
            .field("tasks", &self.tasks.len())
            .field("ready", &self.ready.len())
            .field(
                "loop_scheduled",
                &self.loop_scheduled.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// A cloneable, `Send` handle for submitting tasks to an engine from any
/// thread.
///
/// Tasks from one producer thread start in submission order; no order is
/// guaranteed between producers. When the submitter is itself a fiber of the
/// target engine, the child inherits a snapshot of its fiber-local data.
#[derive(Clone)]
pub struct RemoteHandle {
    shared: Arc<RemoteShared>,
}

impl RemoteHandle {
    pub(crate) fn new(shared: Arc<RemoteShared>) -> Self {
        Self { shared }
    }

    /// Adds a new task to be executed on the engine's thread. Safe to call
    /// from any thread.
    pub fn add_task_remote<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let locals = manager::locals_snapshot_for(&self.shared);
        self.shared.push_task(RemoteTask {
            func: Box::new(func),
            locals,
        });
    }
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle").finish_non_exhaustive()
    }
}

/// A single-shot handle that resumes one suspended fiber.
///
/// Handed to the wait function of [`suspend`](crate::suspend); whoever ends
/// up owning it calls [`wake`](Self::wake) exactly once when the awaited
/// event fires. Safe to invoke from the owning thread (direct ready-queue
/// insert) or any other thread (remote ready queue plus a schedule request).
pub struct FiberWaker {
    shared: Arc<RemoteShared>,
    target: WakeTarget,
}

impl FiberWaker {
    pub(crate) fn new(shared: Arc<RemoteShared>, target: WakeTarget) -> Self {
        Self { shared, target }
    }

    /// Returns the identity of the fiber this waker resumes.
    #[must_use]
    pub fn fiber_id(&self) -> FiberId {
        self.target.id
    }

    /// Makes the suspended fiber runnable again.
    ///
    /// Consuming the waker makes double-wakes unrepresentable; the tolerated
    /// race is only between this call and the wait function returning, and
    /// the engine handles both orders.
    pub fn wake(self) {
        if manager::try_local_wake(&self.shared, self.target) {
            return;
        }
        self.shared.push_ready(self.target);
    }
}

impl std::fmt::Debug for FiberWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberWaker")
            .field("fiber", &self.target.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_controller::SimpleLoopController;

    fn shared() -> (Arc<RemoteShared>, Arc<SimpleLoopController>) {
        let controller = Arc::new(SimpleLoopController::new());
        (Arc::new(RemoteShared::new(controller.clone())), controller)
    }

    fn target(index: u32, epoch: u64) -> WakeTarget {
        WakeTarget {
            id: FiberId::new_for_test(index, 0),
            epoch,
        }
    }

    #[test]
    fn push_schedules_once_until_cleared() {
        let (shared, controller) = shared();

        shared.push_ready(target(0, 0));
        shared.push_ready(target(1, 0));
        assert_eq!(controller.request_count(), 1);

        shared.clear_loop_scheduled();
        shared.push_ready(target(2, 0));
        assert_eq!(controller.request_count(), 2);
    }

    #[test]
    fn has_pending_reflects_both_queues() {
        let (shared, _) = shared();
        assert!(!shared.has_pending());

        shared.push_task(RemoteTask {
            func: Box::new(|| {}),
            locals: None,
        });
        assert!(shared.has_pending());
        assert!(shared.pop_task().is_some());
        assert!(!shared.has_pending());
    }

    #[test]
    fn producer_fifo_order() {
        let (shared, _) = shared();
        for i in 0..4u64 {
            shared.push_ready(target(i as u32, i));
        }
        for i in 0..4u64 {
            assert_eq!(shared.pop_ready().unwrap().epoch, i);
        }
    }

    #[test]
    fn handles_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RemoteHandle>();
        assert_send_sync::<FiberWaker>();
    }
}
