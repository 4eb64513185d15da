//! The engine facade and the run loop.
//!
//! A [`FiberManager`] owns the fiber arena, the ready queue, the pool, and
//! the saved main context, and drives every fiber from
//! [`loop_until_no_ready`](FiberManager::loop_until_no_ready). One manager is
//! affined to the OS thread that created it; a thread-local pointer names the
//! engine while its loop is on the stack, which is how the free functions
//! ([`add_task`], [`suspend`], [`with_local`], ...) and the trampoline find
//! their engine.
//!
//! # Stack discipline
//!
//! Execution is on the main context exactly when `active_fiber` is `None`.
//! Every switch re-resolves its context pointers immediately before the
//! jump, and no `RefCell` borrow is ever held across a switch, so fiber code
//! is free to re-enter the engine. Wait functions and main-context bounces
//! are lifetime-erased closures living on the suspended fiber's stack; each
//! is invoked exactly once, on the main context, before that stack can
//! resume or unwind. Suspended fiber frames keep references into the engine,
//! which therefore lives behind a stable heap allocation inside the movable
//! facade.

use crate::context::{switch_context, MachineContext};
use crate::fiber::{Fiber, RawMainFn, RawWaitFn, TaskFn};
use crate::locals::{self, LocalsMap};
use crate::loop_controller::LoopController;
use crate::options::EngineOptions;
use crate::pool::FiberPool;
use crate::queue::{FiberQueue, QUEUE_TAG_READY};
use crate::remote::{FiberWaker, RemoteHandle, RemoteShared, RemoteTask, WakeTarget};
use crate::stack::StackAllocator;
use crate::tracing_compat::{debug, error, trace};
use crate::types::{FiberId, FiberState, PanicPayload, TaskResult};
use crate::util::Arena;
use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, ThreadId};

thread_local! {
    /// The engine whose loop is on this thread's stack, if any.
    static CURRENT_ENGINE: Cell<*const Engine> = const { Cell::new(std::ptr::null()) };
}

/// Callback invoked when a task panics and has no finally hook.
type ExceptionCallback = Box<dyn FnMut(PanicPayload, &str)>;

/// Mutable engine state, all owned by the owning thread.
struct EngineCore {
    fibers: Arena<Fiber>,
    ready: FiberQueue,
    pool: FiberPool,
    allocator: StackAllocator,
    /// The machine context of the loop itself; switch-outs resume it.
    main_context: MachineContext,
    /// Non-`None` exactly while execution is on a fiber stack.
    active_fiber: Option<FiberId>,
    /// Like `active_fiber`, but also set while the engine runs a fiber's
    /// ready/await/immediate/finally function on the main context.
    current_fiber: Option<FiberId>,
    fibers_allocated: usize,
    fibers_active: usize,
    stack_high_watermark: usize,
}

/// The engine proper. Boxed inside [`FiberManager`] so its address stays
/// stable while fiber stacks hold references across suspensions.
struct Engine {
    core: RefCell<EngineCore>,
    remote: Arc<RemoteShared>,
    exception_callback: RefCell<Option<ExceptionCallback>>,
    options: EngineOptions,
    owner: ThreadId,
}

/// Single-threaded cooperative task execution engine.
///
/// Allows semi-parallel task execution on one thread. Each task runs on its
/// own fiber and can notify the manager that it is blocked (via
/// [`suspend`](Self::suspend)); its fiber is paused until an external party
/// fires the [`FiberWaker`] it registered.
///
/// All methods are owning-thread only unless documented otherwise; use
/// [`remote_handle`](Self::remote_handle) to submit from other threads. The
/// manager must not be dropped while fibers are outstanding.
pub struct FiberManager {
    engine: Box<Engine>,
}

impl FiberManager {
    /// Creates an engine bound to the current thread.
    ///
    /// The `controller` is asked to get the loop running whenever work
    /// becomes runnable; the host is expected to respond by calling
    /// [`loop_until_no_ready`](Self::loop_until_no_ready).
    #[must_use]
    pub fn new(controller: Arc<dyn LoopController>, mut options: EngineOptions) -> Self {
        options.normalize();
        let allocator = StackAllocator::from_options(&options);
        Self {
            engine: Box::new(Engine {
                core: RefCell::new(EngineCore {
                    fibers: Arena::new(),
                    ready: FiberQueue::new(QUEUE_TAG_READY),
                    pool: FiberPool::new(options.max_fibers_pool_size),
                    allocator,
                    main_context: MachineContext::default(),
                    active_fiber: None,
                    current_fiber: None,
                    fibers_allocated: 0,
                    fibers_active: 0,
                    stack_high_watermark: 0,
                }),
                remote: Arc::new(RemoteShared::new(controller)),
                exception_callback: RefCell::new(None),
                options,
                owner: thread::current().id(),
            }),
        }
    }

    /// Adds a new task to be executed. Owning thread only.
    ///
    /// If called from a fiber, the child inherits a snapshot of the caller's
    /// fiber-local data.
    pub fn add_task<F>(&self, func: F)
    where
        F: FnOnce() + 'static,
    {
        self.engine.add_task(Box::new(func));
    }

    /// Like [`add_task`](Self::add_task), but `ready_fn` runs on the main
    /// context immediately before the fiber's first switch-in.
    pub fn add_task_ready_fn<F, G>(&self, func: F, ready_fn: G)
    where
        F: FnOnce() + 'static,
        G: FnOnce() + 'static,
    {
        self.engine
            .add_task_ready_fn(Box::new(func), Box::new(ready_fn));
    }

    /// Adds a new task; when it completes, `finally` runs on the main
    /// context with the task's value or captured panic. Owning thread only.
    ///
    /// A panic in `func` is consumed by the [`TaskResult`] and does not
    /// reach the exception callback.
    pub fn add_task_finally<T, F, G>(&self, func: F, finally: G)
    where
        T: 'static,
        F: FnOnce() -> T + 'static,
        G: FnOnce(TaskResult<T>) + 'static,
    {
        self.engine.add_task_finally(func, finally);
    }

    /// Returns a `Send + Sync` handle for submitting tasks from any thread.
    #[must_use]
    pub fn remote_handle(&self) -> RemoteHandle {
        RemoteHandle::new(Arc::clone(&self.engine.remote))
    }

    /// Suspends the calling fiber until the [`FiberWaker`] handed to
    /// `wait_fn` is fired. Owning thread, fiber context only.
    ///
    /// `wait_fn` runs exactly once on the main context after the fiber has
    /// switched out; it must register the waker with some wake source and
    /// return without blocking. The waker may fire even before `wait_fn`
    /// returns; both orders resume the fiber exactly once.
    pub fn suspend<F>(&self, wait_fn: F)
    where
        F: FnOnce(FiberWaker),
    {
        self.engine.suspend(wait_fn);
    }

    /// Runs `func` on the main context and returns its result.
    ///
    /// From a fiber this bounces to the main stack, runs `func`, and
    /// switches back on the same loop iteration. Off-fiber it is a plain
    /// call. Owning thread only.
    pub fn run_in_main_context<F, R>(&self, func: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.engine.run_in_main_context(func)
    }

    /// Moves the calling fiber to the back of the ready queue and returns
    /// control to the loop. A no-op off-fiber. Owning thread only.
    pub fn yield_now(&self) {
        self.engine.yield_now();
    }

    /// Runs `f` against the fiber-local datum of type `T`, lazily
    /// default-constructing it on first access. Owning thread only.
    ///
    /// On a fiber this resolves to that fiber's cell (the one children
    /// snapshot at submission); off-fiber it resolves to a process-wide
    /// thread-local cell. Use the same `T` for a given datum throughout a
    /// fiber's lifetime, and do not nest access to the same `T`.
    pub fn with_local<T, R>(&self, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Clone + Default + Send + 'static,
    {
        self.engine.with_local(f)
    }

    /// Replaces the callback invoked when a task panics with no finally
    /// hook. Without one, such a panic aborts the process.
    pub fn set_exception_callback<F>(&self, callback: F)
    where
        F: FnMut(PanicPayload, &str) + 'static,
    {
        self.engine.assert_owner("set_exception_callback");
        *self.engine.exception_callback.borrow_mut() = Some(Box::new(callback));
    }

    /// Keeps running ready fibers until none are runnable. Owning thread
    /// only; the host loop calls this in response to its controller.
    ///
    /// Returns true if outstanding work remains: fibers suspended in
    /// [`suspend`](Self::suspend), or remote submissions that arrived during
    /// the drain (in which case another run is also scheduled).
    pub fn loop_until_no_ready(&self) -> bool {
        self.engine.loop_until_no_ready()
    }

    /// Returns true if there are outstanding tasks: live fibers, or remote
    /// submissions not yet drained.
    #[must_use]
    pub fn has_tasks(&self) -> bool {
        self.engine.core.borrow().fibers_active > 0 || self.engine.remote.has_pending()
    }

    /// How many fiber objects (and stacks) this manager has allocated.
    #[must_use]
    pub fn fibers_allocated(&self) -> usize {
        self.engine.core.borrow().fibers_allocated
    }

    /// How many allocated fibers currently sit in the free pool.
    #[must_use]
    pub fn fibers_pool_size(&self) -> usize {
        self.engine.core.borrow().pool.size()
    }

    /// The largest observed per-fiber stack usage in bytes. Only advances
    /// when [`debug_record_stack_used`](EngineOptions::debug_record_stack_used)
    /// is set.
    #[must_use]
    pub fn stack_high_watermark(&self) -> usize {
        self.engine.core.borrow().stack_high_watermark
    }

    /// Returns true if execution is currently on a fiber stack.
    #[must_use]
    pub fn has_active_fiber(&self) -> bool {
        self.engine.has_active_fiber()
    }
}

impl std::fmt::Debug for FiberManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.engine.core.borrow();
        f.debug_struct("FiberManager")
            .field("fibers_allocated", &core.fibers_allocated)
            .field("fibers_active", &core.fibers_active)
            .field("fibers_pooled", &core.pool.size())
            .field("ready", &core.ready.len())
            .finish_non_exhaustive()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let core = self.core.borrow();
        debug_assert_eq!(
            core.fibers_active, 0,
            "engine dropped with fibers outstanding"
        );
        debug_assert_eq!(
            core.fibers.len(),
            core.pool.size(),
            "only pooled fibers may remain at teardown"
        );
    }
}

impl Engine {
    fn assert_owner(&self, operation: &str) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "{operation} called from a non-owning thread"
        );
    }

    fn has_active_fiber(&self) -> bool {
        self.core.borrow().active_fiber.is_some()
    }

    fn add_task(&self, task: TaskFn) {
        self.assert_owner("add_task");
        let locals = self.current_locals_snapshot();
        self.enqueue_new_fiber(task, None, None, locals);
        self.remote.ensure_loop_scheduled();
    }

    fn add_task_ready_fn(&self, task: TaskFn, ready_fn: TaskFn) {
        self.assert_owner("add_task_ready_fn");
        let locals = self.current_locals_snapshot();
        self.enqueue_new_fiber(task, None, Some(ready_fn), locals);
        self.remote.ensure_loop_scheduled();
    }

    fn add_task_finally<T, F, G>(&self, func: F, finally: G)
    where
        T: 'static,
        F: FnOnce() -> T + 'static,
        G: FnOnce(TaskResult<T>) + 'static,
    {
        self.assert_owner("add_task_finally");
        let result_slot: Rc<RefCell<Option<TaskResult<T>>>> = Rc::new(RefCell::new(None));
        let task_slot = Rc::clone(&result_slot);

        // The task wraps its own result; the trampoline's panic capture
        // never triggers, so the exception callback stays out of the path.
        let task = move || {
            let result = match catch_unwind(AssertUnwindSafe(func)) {
                Ok(value) => TaskResult::Ok(value),
                Err(payload) => TaskResult::Panicked(PanicPayload::from_unwind(payload.as_ref())),
            };
            *task_slot.borrow_mut() = Some(result);
        };
        let finally = move || {
            let result = result_slot
                .borrow_mut()
                .take()
                .expect("finally ran before its task completed");
            finally(result);
        };

        let locals = self.current_locals_snapshot();
        self.enqueue_new_fiber(Box::new(task), Some(Box::new(finally)), None, locals);
        self.remote.ensure_loop_scheduled();
    }

    fn suspend<F>(&self, wait_fn: F)
    where
        F: FnOnce(FiberWaker),
    {
        self.assert_owner("suspend");
        let mut wait_fn = Some(wait_fn);
        let mut call = move |waker: FiberWaker| {
            (wait_fn.take().expect("wait function invoked twice"))(waker);
        };
        {
            let core = &mut *self.core.borrow_mut();
            let id = core.active_fiber.expect("suspend called outside a fiber");
            let fiber = core
                .fibers
                .get_mut(id.arena_index())
                .expect("active fiber missing from arena");
            let erased: &mut dyn FnMut(FiberWaker) = &mut call;
            // Lifetime-erased: this frame stays alive until the wake fires,
            // and the loop consumes the pointer before then.
            let raw: RawWaitFn = unsafe { std::mem::transmute(erased) };
            fiber.await_fn = Some(raw);
            fiber.state = FiberState::Awaiting;
            trace!(fiber = ?id, "fiber awaiting");
        }
        self.switch_out_current();
    }

    fn run_in_main_context<F, R>(&self, func: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.assert_owner("run_in_main_context");
        if !self.has_active_fiber() {
            return func();
        }

        let mut func = Some(func);
        let mut out: Option<R> = None;
        {
            let mut call = || {
                out = Some((func.take().expect("main-context function invoked twice"))());
            };
            {
                let core = &mut *self.core.borrow_mut();
                let id = core.active_fiber.expect("active fiber vanished");
                let fiber = core
                    .fibers
                    .get_mut(id.arena_index())
                    .expect("active fiber missing from arena");
                let erased: &mut dyn FnMut() = &mut call;
                // Lifetime-erased: the loop runs this exactly once before
                // switching back into this frame.
                let raw: RawMainFn = unsafe { std::mem::transmute(erased) };
                fiber.immediate_fn = Some(raw);
                fiber.state = FiberState::Yielded;
            }
            self.switch_out_current();
        }
        out.expect("main-context function did not run")
    }

    fn yield_now(&self) {
        self.assert_owner("yield_now");
        {
            let core = &mut *self.core.borrow_mut();
            let Some(id) = core.active_fiber else {
                return;
            };
            let fiber = core
                .fibers
                .get_mut(id.arena_index())
                .expect("active fiber missing from arena");
            fiber.state = FiberState::Yielded;
        }
        self.switch_out_current();
    }

    fn with_local<T, R>(&self, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Clone + Default + Send + 'static,
    {
        self.assert_owner("with_local");
        let current = self.core.borrow().current_fiber;
        let Some(id) = current else {
            return locals::with_fallback_local(f);
        };

        let ty = TypeId::of::<T>();
        let mut cell = {
            let core = &mut *self.core.borrow_mut();
            core.fibers
                .get_mut(id.arena_index())
                .expect("current fiber missing from arena")
                .locals
                .take_cell(ty)
        }
        .unwrap_or_else(locals::new_cell::<T>);

        // The cell is detached while `f` runs so the closure may re-enter
        // the engine (submit tasks, touch other locals) freely.
        let result = f(locals::cell_value_mut::<T>(cell.as_mut())
            .expect("fiber-local cell holds a different type"));

        let core = &mut *self.core.borrow_mut();
        core.fibers
            .get_mut(id.arena_index())
            .expect("current fiber missing from arena")
            .locals
            .put_cell(ty, cell);
        result
    }

    fn loop_until_no_ready(&self) -> bool {
        self.assert_owner("loop_until_no_ready");
        self.remote.clear_loop_scheduled();
        let _binding = EngineBinding::bind(self);

        loop {
            self.drain_remote();
            let next = {
                let core = &mut *self.core.borrow_mut();
                core.ready.pop_front(&mut core.fibers)
            };
            let Some(id) = next else { break };
            self.run_ready_fiber(id);
        }

        let waiting = self.core.borrow().fibers_active > 0;
        if self.remote.has_pending() {
            // Work slipped in after the final drain; make sure the host
            // comes back for it.
            self.remote.ensure_loop_scheduled();
            return true;
        }
        waiting
    }

    /// Snapshot of the current fiber's locals, for child inheritance.
    fn current_locals_snapshot(&self) -> Option<LocalsMap> {
        let core = self.core.borrow();
        let id = core.current_fiber?;
        let fiber = core.fibers.get(id.arena_index())?;
        if fiber.locals.is_empty() {
            None
        } else {
            Some(fiber.locals.snapshot())
        }
    }

    /// Acquires a fiber, binds the task slots, and queues it ready.
    fn enqueue_new_fiber(
        &self,
        task: TaskFn,
        finally: Option<TaskFn>,
        ready_fn: Option<TaskFn>,
        locals: Option<LocalsMap>,
    ) {
        let core = &mut *self.core.borrow_mut();
        let (id, fresh) = core
            .pool
            .acquire(&mut core.fibers, core.allocator, &self.options)
            .unwrap_or_else(|e| panic!("fiber allocation failed: {e}"));
        if fresh {
            core.fibers_allocated += 1;
        }
        core.fibers_active += 1;

        let fiber = core
            .fibers
            .get_mut(id.arena_index())
            .expect("acquired fiber missing from arena");
        fiber.prepare(task, fiber_entry);
        fiber.finally_fn = finally;
        fiber.ready_fn = ready_fn;
        if let Some(locals) = locals {
            fiber.locals = locals;
        }
        core.ready.push_back(id, &mut core.fibers);
        trace!(fiber = ?id, fresh, "task queued");
    }

    /// Promotes queued remote work into local state.
    fn drain_remote(&self) {
        while let Some(task) = self.remote.pop_task() {
            let RemoteTask { func, locals } = task;
            self.enqueue_new_fiber(func, None, None, locals);
        }
        while let Some(target) = self.remote.pop_ready() {
            self.ready_insert(target);
        }
    }

    /// Makes an awaiting fiber ready. Returns false for a stale target.
    fn ready_insert(&self, target: WakeTarget) -> bool {
        let core = &mut *self.core.borrow_mut();
        debug_assert!(
            !core.ready.contains(target.id, &core.fibers),
            "wake of already-queued fiber {:?}",
            target.id
        );
        {
            let Some(fiber) = core.fibers.get_mut(target.id.arena_index()) else {
                debug_assert!(false, "wake of destroyed fiber {:?}", target.id);
                return false;
            };
            if fiber.epoch != target.epoch {
                debug_assert!(false, "wake of recycled fiber {:?}", target.id);
                return false;
            }
            debug_assert_eq!(fiber.state, FiberState::Awaiting, "wake of non-awaiting fiber");
            fiber.state = FiberState::Ready;
        }
        core.ready.push_back(target.id, &mut core.fibers);
        trace!(fiber = ?target.id, "fiber woken");
        true
    }

    /// Runs one ready fiber until it completes, suspends, or yields.
    fn run_ready_fiber(&self, id: FiberId) {
        let ready_fn = {
            let core = &mut *self.core.borrow_mut();
            core.fibers
                .get_mut(id.arena_index())
                .and_then(|fiber| fiber.ready_fn.take())
        };
        if let Some(ready_fn) = ready_fn {
            self.run_on_behalf(id, ready_fn);
        }

        loop {
            self.switch_in(id);

            let state = self
                .core
                .borrow()
                .fibers
                .get(id.arena_index())
                .map(|fiber| fiber.state)
                .expect("fiber vanished during its run");

            match state {
                FiberState::Completed => {
                    self.complete_fiber(id);
                    return;
                }
                FiberState::Awaiting => {
                    self.run_await_fn(id);
                    return;
                }
                FiberState::Yielded => {
                    let immediate = {
                        let core = &mut *self.core.borrow_mut();
                        core.fibers
                            .get_mut(id.arena_index())
                            .and_then(|fiber| fiber.immediate_fn.take())
                    };
                    if let Some(raw) = immediate {
                        // Main-context bounce: run the deferred function
                        // here, then resume the fiber on this iteration.
                        self.run_on_behalf(id, || unsafe { (&mut *raw)() });
                    } else {
                        // Cooperative yield: back of the queue.
                        let core = &mut *self.core.borrow_mut();
                        if let Some(fiber) = core.fibers.get_mut(id.arena_index()) {
                            fiber.state = FiberState::Ready;
                        }
                        core.ready.push_back(id, &mut core.fibers);
                        return;
                    }
                }
                other => unreachable!("fiber returned control in state {other}"),
            }
        }
    }

    /// Swaps the main context out and the fiber's context in; returns when
    /// the fiber yields back.
    fn switch_in(&self, id: FiberId) {
        let (save, resume) = {
            let core = &mut *self.core.borrow_mut();
            debug_assert!(core.active_fiber.is_none(), "switch-in while on a fiber");
            core.active_fiber = Some(id);
            core.current_fiber = Some(id);
            let save: *mut MachineContext = &raw mut core.main_context;
            let fiber = core
                .fibers
                .get_mut(id.arena_index())
                .expect("switch-in of missing fiber");
            debug_assert!(fiber.state.is_runnable(), "switch-in of {} fiber", fiber.state);
            fiber.state = FiberState::Running;
            let resume: *const MachineContext = &raw const fiber.context;
            (save, resume)
        };
        // No borrow is held across the switch; the fiber re-borrows freely.
        unsafe { switch_context(save, resume) };
        let core = &mut *self.core.borrow_mut();
        core.active_fiber = None;
        core.current_fiber = None;
    }

    /// Stashes the active fiber's machine state and restores the main
    /// context. Called on the fiber stack, with the fiber's state already
    /// set to `Awaiting`, `Yielded`, or `Completed`.
    fn switch_out_current(&self) {
        let (save, resume) = {
            let core = &mut *self.core.borrow_mut();
            let id = core.active_fiber.expect("switch-out on the main context");
            let fiber = core
                .fibers
                .get_mut(id.arena_index())
                .expect("active fiber missing from arena");
            debug_assert!(
                matches!(
                    fiber.state,
                    FiberState::Awaiting | FiberState::Yielded | FiberState::Completed
                ),
                "switch-out of {} fiber",
                fiber.state
            );
            let save: *mut MachineContext = &raw mut fiber.context;
            let resume: *const MachineContext = &raw const core.main_context;
            (save, resume)
        };
        unsafe { switch_context(save, resume) };
        // Resumed: back on this fiber's stack, active again.
    }

    /// Runs a fiber's main-context function with `current_fiber` naming it,
    /// so locals and child inheritance resolve to the right fiber.
    fn run_on_behalf<R>(&self, id: FiberId, f: impl FnOnce() -> R) -> R {
        self.core.borrow_mut().current_fiber = Some(id);
        let result = f();
        self.core.borrow_mut().current_fiber = None;
        result
    }

    /// Hands the suspended fiber's waker to its wait function.
    fn run_await_fn(&self, id: FiberId) {
        let (raw, epoch) = {
            let core = &mut *self.core.borrow_mut();
            let fiber = core
                .fibers
                .get_mut(id.arena_index())
                .expect("awaiting fiber missing from arena");
            (
                fiber
                    .await_fn
                    .take()
                    .expect("awaiting fiber without a wait function"),
                fiber.epoch,
            )
        };
        let waker = FiberWaker::new(Arc::clone(&self.remote), WakeTarget { id, epoch });
        self.run_on_behalf(id, || unsafe { (&mut *raw)(waker) });
    }

    /// Post-completion handling: finally hook or exception callback, then
    /// reset and release to the pool.
    fn complete_fiber(&self, id: FiberId) {
        let (finally, panic) = {
            let core = &mut *self.core.borrow_mut();
            let fiber = core
                .fibers
                .get_mut(id.arena_index())
                .expect("completed fiber missing from arena");
            (fiber.finally_fn.take(), fiber.panic.take())
        };

        if let Some(finally) = finally {
            self.run_on_behalf(id, finally);
        } else if let Some(payload) = panic {
            self.report_exception(payload);
        }

        let core = &mut *self.core.borrow_mut();
        if self.options.debug_record_stack_used {
            let used = core
                .fibers
                .get(id.arena_index())
                .map_or(0, |fiber| fiber.stack.used_bytes());
            if used > core.stack_high_watermark {
                core.stack_high_watermark = used;
            }
        }

        let fiber = core
            .fibers
            .get_mut(id.arena_index())
            .expect("completed fiber missing from arena");
        fiber.reset();
        core.fibers_active -= 1;
        let kept = core.pool.release(id, &mut core.fibers);
        if !kept {
            core.fibers_allocated -= 1;
        }
        debug_assert_eq!(
            core.fibers_allocated,
            core.fibers_active + core.pool.size(),
            "fiber accounting drifted"
        );
        debug!(fiber = ?id, kept, "fiber completed");
    }

    /// Routes an escaped task panic to the user callback; aborts without one.
    fn report_exception(&self, payload: PanicPayload) {
        let taken = self.exception_callback.borrow_mut().take();
        if let Some(mut callback) = taken {
            callback(payload, "running task");
            let mut slot = self.exception_callback.borrow_mut();
            if slot.is_none() {
                *slot = Some(callback);
            }
        } else {
            error!(payload = %payload, "uncaught task panic with no exception callback");
            std::process::abort();
        }
    }
}

/// RAII binding of the thread-local engine pointer for a loop run.
struct EngineBinding {
    prev: *const Engine,
}

impl EngineBinding {
    fn bind(engine: &Engine) -> Self {
        let prev = CURRENT_ENGINE.get();
        debug_assert!(prev.is_null(), "engine loop re-entered");
        CURRENT_ENGINE.set(std::ptr::from_ref(engine));
        Self { prev }
    }
}

impl Drop for EngineBinding {
    fn drop(&mut self) {
        CURRENT_ENGINE.set(self.prev);
    }
}

/// The engine bound on this thread, while its loop is on the stack.
///
/// The `'static` is a loan: the engine lives in a stable heap allocation
/// owned by a [`FiberManager`] that outlives every fiber, and callers only
/// hold the reference for the duration of their own call or fiber run.
fn current_ref() -> Option<&'static Engine> {
    let ptr = CURRENT_ENGINE.get();
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

fn current_expect(operation: &str) -> &'static Engine {
    current_ref()
        .unwrap_or_else(|| panic!("{operation} requires a fiber engine running on this thread"))
}

/// The trampoline every fiber starts in: runs the bound task on the fiber
/// stack, captures any panic, and performs the final switch-out. Never
/// returns.
extern "C" fn fiber_entry() -> ! {
    let engine = current_expect("fiber entry");

    let task = {
        let core = &mut *engine.core.borrow_mut();
        let id = core.active_fiber.expect("fiber entry on the main context");
        core.fibers
            .get_mut(id.arena_index())
            .expect("active fiber missing from arena")
            .task
            .take()
            .expect("fiber started without a task")
    };

    let result = catch_unwind(AssertUnwindSafe(task));

    {
        let core = &mut *engine.core.borrow_mut();
        let id = core.active_fiber.expect("fiber entry lost its fiber");
        let fiber = core
            .fibers
            .get_mut(id.arena_index())
            .expect("active fiber missing from arena");
        if let Err(payload) = result {
            fiber.panic = Some(PanicPayload::from_unwind(payload.as_ref()));
        }
        fiber.state = FiberState::Completed;
    }

    engine.switch_out_current();
    unreachable!("completed fiber was resumed");
}

// ── free functions, resolved through the thread-local engine ─────────────

/// Adds a new task to the engine running on this thread.
///
/// # Panics
///
/// Panics if no engine loop is on this thread's stack.
pub fn add_task<F>(func: F)
where
    F: FnOnce() + 'static,
{
    current_expect("add_task").add_task(Box::new(func));
}

/// Adds a new task with a finally hook to the engine running on this thread.
///
/// # Panics
///
/// Panics if no engine loop is on this thread's stack.
pub fn add_task_finally<T, F, G>(func: F, finally: G)
where
    T: 'static,
    F: FnOnce() -> T + 'static,
    G: FnOnce(TaskResult<T>) + 'static,
{
    current_expect("add_task_finally").add_task_finally(func, finally);
}

/// Suspends the calling fiber; see [`FiberManager::suspend`].
///
/// # Panics
///
/// Panics if no engine loop is on this thread's stack.
pub fn suspend<F>(wait_fn: F)
where
    F: FnOnce(FiberWaker),
{
    current_expect("suspend").suspend(wait_fn);
}

/// Runs `func` on the main context; a plain call when no engine is running
/// on this thread. See [`FiberManager::run_in_main_context`].
pub fn run_in_main_context<F, R>(func: F) -> R
where
    F: FnOnce() -> R,
{
    match current_ref() {
        Some(engine) => engine.run_in_main_context(func),
        None => func(),
    }
}

/// Accesses a fiber-local datum; falls back to a thread-local cell when no
/// engine or fiber is current. See [`FiberManager::with_local`].
pub fn with_local<T, R>(f: impl FnOnce(&mut T) -> R) -> R
where
    T: Clone + Default + Send + 'static,
{
    match current_ref() {
        Some(engine) => engine.with_local(f),
        None => locals::with_fallback_local(f),
    }
}

/// Reschedules the calling fiber behind other ready work; a no-op when not
/// on a fiber.
pub fn yield_now() {
    if let Some(engine) = current_ref() {
        engine.yield_now();
    }
}

/// Returns true iff the caller is running in a fiber's context.
#[must_use]
pub fn on_fiber() -> bool {
    current_ref().is_some_and(Engine::has_active_fiber)
}

// ── crate-internal hooks used by the remote half ─────────────────────────

/// Direct ready-queue insert when the waker fires on the owning thread with
/// `shared`'s engine bound; skips the remote queue.
pub(crate) fn try_local_wake(shared: &Arc<RemoteShared>, target: WakeTarget) -> bool {
    let Some(engine) = current_ref() else {
        return false;
    };
    if !Arc::ptr_eq(&engine.remote, shared) {
        return false;
    }
    engine.ready_insert(target)
}

/// Snapshot of the submitting fiber's locals, when the submitter is a fiber
/// of `shared`'s engine.
pub(crate) fn locals_snapshot_for(shared: &Arc<RemoteShared>) -> Option<LocalsMap> {
    let engine = current_ref()?;
    if !Arc::ptr_eq(&engine.remote, shared) {
        return None;
    }
    engine.current_locals_snapshot()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_controller::SimpleLoopController;
    use crate::test_utils::init_test_logging;
    use std::cell::Cell as StdCell;

    fn manager_with(options: EngineOptions) -> FiberManager {
        init_test_logging();
        FiberManager::new(Arc::new(SimpleLoopController::new()), options)
    }

    fn manager() -> FiberManager {
        manager_with(EngineOptions::default())
    }

    #[test]
    fn tasks_complete_and_counters_settle() {
        let m = manager();
        let count = Rc::new(StdCell::new(0));
        for _ in 0..5 {
            let count = Rc::clone(&count);
            m.add_task(move || count.set(count.get() + 1));
        }

        let waiting = m.loop_until_no_ready();
        assert!(!waiting);
        assert_eq!(count.get(), 5);
        assert!(!m.has_tasks());
        assert!(m.fibers_allocated() <= 5);
        assert_eq!(
            m.fibers_allocated(),
            m.fibers_pool_size(),
            "all fibers back in the pool"
        );
    }

    #[test]
    fn loop_is_idempotent_when_idle() {
        let m = manager();
        m.add_task(|| {});
        assert!(!m.loop_until_no_ready());

        let allocated = m.fibers_allocated();
        assert!(!m.loop_until_no_ready());
        assert_eq!(m.fibers_allocated(), allocated);
    }

    #[test]
    fn sequential_tasks_reuse_one_fiber() {
        let m = manager_with(EngineOptions::new().with_max_fibers_pool_size(2));
        for _ in 0..10 {
            m.add_task(|| {});
            m.loop_until_no_ready();
        }
        assert_eq!(m.fibers_allocated(), 1);
        assert!(m.fibers_pool_size() <= 2);
    }

    #[test]
    fn pool_cap_bounds_allocation() {
        let m = manager_with(EngineOptions::new().with_max_fibers_pool_size(2));
        for _ in 0..10 {
            m.add_task(|| {});
        }
        m.loop_until_no_ready();
        assert!(m.fibers_pool_size() <= 2);
        assert_eq!(m.fibers_allocated(), m.fibers_pool_size());
    }

    #[test]
    fn nested_add_task_starts_after_parent_yields() {
        let m = manager();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = Rc::clone(&order);
        m.add_task(move || {
            o.borrow_mut().push("parent");
            let o2 = Rc::clone(&o);
            super::add_task(move || o2.borrow_mut().push("child"));
            o.borrow_mut().push("parent-end");
        });
        m.loop_until_no_ready();

        assert_eq!(*order.borrow(), ["parent", "parent-end", "child"]);
    }

    #[test]
    fn ready_fn_runs_on_main_before_first_switch_in() {
        let m = manager();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = Rc::clone(&order);
        let o2 = Rc::clone(&order);
        m.add_task_ready_fn(
            move || o.borrow_mut().push("task"),
            move || {
                assert!(!on_fiber());
                o2.borrow_mut().push("ready");
            },
        );
        m.loop_until_no_ready();

        assert_eq!(*order.borrow(), ["ready", "task"]);
    }

    #[test]
    fn run_in_main_context_bounces_and_returns() {
        let m = manager();
        let observed = Rc::new(StdCell::new(0));

        let obs = Rc::clone(&observed);
        m.add_task(move || {
            let value = run_in_main_context(|| {
                assert!(!on_fiber());
                5
            });
            assert!(on_fiber());
            obs.set(value);
        });
        m.loop_until_no_ready();

        assert_eq!(observed.get(), 5);
    }

    #[test]
    fn run_in_main_context_off_fiber_is_direct() {
        let m = manager();
        assert_eq!(m.run_in_main_context(|| 7), 7);
    }

    #[test]
    fn yielding_fibers_interleave() {
        let m = manager();
        let order = Rc::new(RefCell::new(Vec::new()));

        for name in ["a", "b"] {
            let o = Rc::clone(&order);
            m.add_task(move || {
                o.borrow_mut().push(format!("{name}1"));
                yield_now();
                o.borrow_mut().push(format!("{name}2"));
            });
        }
        m.loop_until_no_ready();

        assert_eq!(*order.borrow(), ["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn suspend_and_same_thread_wake() {
        let m = manager();
        let waker_slot: Rc<RefCell<Option<FiberWaker>>> = Rc::new(RefCell::new(None));
        let value = Rc::new(StdCell::new(0));
        let shared = Rc::new(StdCell::new(0));

        let slot = Rc::clone(&waker_slot);
        let out = Rc::clone(&value);
        let shared_in = Rc::clone(&shared);
        m.add_task(move || {
            suspend(|waker| {
                *slot.borrow_mut() = Some(waker);
            });
            out.set(shared_in.get());
        });

        // First run parks the fiber; the loop reports outstanding work.
        assert!(m.loop_until_no_ready());
        assert!(m.has_tasks());

        shared.set(42);
        waker_slot.borrow_mut().take().unwrap().wake();
        assert!(!m.loop_until_no_ready());
        assert_eq!(value.get(), 42);
        assert!(!m.has_tasks());
    }

    #[test]
    fn wake_during_wait_fn_resumes_same_run() {
        let m = manager();
        let resumed = Rc::new(StdCell::new(false));

        let flag = Rc::clone(&resumed);
        m.add_task(move || {
            // The waker fires before the wait function returns; the loop
            // must still resume the fiber exactly once.
            suspend(FiberWaker::wake);
            flag.set(true);
        });
        assert!(!m.loop_until_no_ready());
        assert!(resumed.get());
    }

    #[test]
    fn finally_receives_value() {
        let m = manager();
        let got = Rc::new(StdCell::new(0));

        let out = Rc::clone(&got);
        m.add_task_finally(
            || 40 + 2,
            move |result: TaskResult<i32>| {
                assert!(!on_fiber());
                out.set(result.unwrap());
            },
        );
        m.loop_until_no_ready();
        assert_eq!(got.get(), 42);
    }

    #[test]
    fn finally_receives_panic_without_callback_invocation() {
        let m = manager();
        let callback_hits = Rc::new(StdCell::new(0));
        let got = Rc::new(RefCell::new(String::new()));

        let hits = Rc::clone(&callback_hits);
        m.set_exception_callback(move |_, _| hits.set(hits.get() + 1));

        let out = Rc::clone(&got);
        m.add_task_finally(
            || -> i32 { panic!("error code 7") },
            move |result: TaskResult<i32>| {
                *out.borrow_mut() = result.into_result().unwrap_err().message().to_string();
            },
        );
        m.loop_until_no_ready();

        assert_eq!(*got.borrow(), "error code 7");
        assert_eq!(callback_hits.get(), 0);
    }

    #[test]
    fn exception_callback_sees_uncaught_panic() {
        let m = manager();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&seen);
        m.set_exception_callback(move |payload, description| {
            log.borrow_mut()
                .push(format!("{description}: {}", payload.message()));
        });

        m.add_task(|| panic!("boom"));
        m.loop_until_no_ready();

        assert_eq!(*seen.borrow(), ["running task: boom"]);
        // The engine keeps running after a reported panic.
        m.add_task(|| {});
        assert!(!m.loop_until_no_ready());
    }

    #[test]
    fn locals_inherited_by_children_as_snapshot() {
        let m = manager();
        let child_saw = Rc::new(StdCell::new(0u64));

        let out = Rc::clone(&child_saw);
        m.add_task(move || {
            with_local::<u64, _>(|v| *v = 99);
            let out2 = Rc::clone(&out);
            add_task(move || {
                out2.set(with_local::<u64, _>(|v| *v));
            });
            // Mutating after submission must not affect the child.
            with_local::<u64, _>(|v| *v = 1);
        });
        m.loop_until_no_ready();

        assert_eq!(child_saw.get(), 99);
    }

    #[test]
    fn locals_off_fiber_use_thread_fallback() {
        let m = manager();
        m.with_local::<u32, _>(|v| *v += 1);
        let observed = m.with_local::<u32, _>(|v| *v);
        assert!(observed >= 1);
    }

    #[test]
    fn stack_watermark_monotonic_when_recording() {
        let m = manager_with(EngineOptions::new().with_debug_record_stack_used(true));
        assert_eq!(m.stack_high_watermark(), 0);

        m.add_task(|| {
            let buffer = [0u8; 512];
            std::hint::black_box(&buffer);
        });
        m.loop_until_no_ready();
        let first = m.stack_high_watermark();
        assert!(first >= 512);

        m.add_task(|| {});
        m.loop_until_no_ready();
        assert!(m.stack_high_watermark() >= first);
    }

    #[test]
    #[should_panic(expected = "requires a fiber engine")]
    fn free_add_task_without_engine_panics() {
        super::add_task(|| {});
    }

    #[test]
    fn has_active_fiber_tracks_context() {
        let m = manager();
        assert!(!m.has_active_fiber());
        let seen = Rc::new(StdCell::new(false));

        let out = Rc::clone(&seen);
        m.add_task(move || out.set(on_fiber()));
        m.loop_until_no_ready();

        assert!(seen.get());
        assert!(!m.has_active_fiber());
    }
}
