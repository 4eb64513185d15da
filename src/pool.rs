//! Bounded reuse of idle fibers.
//!
//! Stack allocation is the expensive part of starting a task, so finished
//! fibers park here with their stacks intact, state `Invalid`, and no task
//! bound. The pool is capped: a release beyond the cap destroys the fiber
//! instead, which keeps total resident stack memory bounded by
//! `stack_size * (active + max_fibers_pool_size)`.

use crate::error::Error;
use crate::fiber::Fiber;
use crate::options::EngineOptions;
use crate::queue::{FiberStackList, QUEUE_TAG_POOL};
use crate::stack::StackAllocator;
use crate::types::{FiberId, FiberState};
use crate::util::Arena;

/// The free-list of idle, stack-bearing fibers.
#[derive(Debug)]
pub(crate) struct FiberPool {
    free: FiberStackList,
    max_size: usize,
}

impl FiberPool {
    /// Creates an empty pool with the given cap.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            free: FiberStackList::new(QUEUE_TAG_POOL),
            max_size,
        }
    }

    /// Number of pooled fibers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.free.len()
    }

    /// Pops a pooled fiber or allocates a fresh one.
    ///
    /// Returns the fiber's id and whether it was newly allocated (so the
    /// caller can maintain the allocation counter).
    pub fn acquire(
        &mut self,
        arena: &mut Arena<Fiber>,
        allocator: StackAllocator,
        options: &EngineOptions,
    ) -> Result<(FiberId, bool), Error> {
        if let Some(id) = self.free.pop(arena) {
            debug_assert_eq!(arena.get(id.arena_index()).map(|f| f.state), Some(FiberState::Invalid));
            return Ok((id, false));
        }

        let mut stack = allocator.allocate(options.stack_size)?;
        if options.debug_record_stack_used {
            stack.fill_sentinel();
        }
        let id = FiberId::from_arena(arena.insert(Fiber::new(stack)));
        Ok((id, true))
    }

    /// Returns a finished, already-reset fiber to the pool.
    ///
    /// Returns true if the fiber was kept; false if the cap was reached and
    /// the fiber (and its stack) was destroyed.
    pub fn release(&mut self, id: FiberId, arena: &mut Arena<Fiber>) -> bool {
        debug_assert_eq!(
            arena.get(id.arena_index()).map(|f| f.state),
            Some(FiberState::Invalid),
            "release of a live fiber"
        );

        if self.free.len() < self.max_size {
            self.free.push(id, arena);
            true
        } else {
            arena.remove(id.arena_index());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_setup(max: usize) -> (FiberPool, Arena<Fiber>, StackAllocator, EngineOptions) {
        let mut options = EngineOptions::default();
        options.normalize();
        (
            FiberPool::new(max),
            Arena::new(),
            StackAllocator::Heap,
            options,
        )
    }

    #[test]
    fn acquire_allocates_when_empty() {
        let (mut pool, mut arena, alloc, options) = pool_setup(2);
        let (id, fresh) = pool.acquire(&mut arena, alloc, &options).unwrap();
        assert!(fresh);
        assert!(arena.get(id.arena_index()).is_some());
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn release_then_acquire_reuses() {
        let (mut pool, mut arena, alloc, options) = pool_setup(2);
        let (id, _) = pool.acquire(&mut arena, alloc, &options).unwrap();

        assert!(pool.release(id, &mut arena));
        assert_eq!(pool.size(), 1);

        let (id2, fresh) = pool.acquire(&mut arena, alloc, &options).unwrap();
        assert_eq!(id2, id);
        assert!(!fresh);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn cap_destroys_excess() {
        let (mut pool, mut arena, alloc, options) = pool_setup(1);
        let (a, _) = pool.acquire(&mut arena, alloc, &options).unwrap();
        let (b, _) = pool.acquire(&mut arena, alloc, &options).unwrap();

        assert!(pool.release(a, &mut arena));
        assert!(!pool.release(b, &mut arena));
        assert_eq!(pool.size(), 1);
        assert!(arena.get(b.arena_index()).is_none());
        assert!(arena.get(a.arena_index()).is_some());
    }

    #[test]
    fn zero_cap_pools_nothing() {
        let (mut pool, mut arena, alloc, options) = pool_setup(0);
        let (id, _) = pool.acquire(&mut arena, alloc, &options).unwrap();
        assert!(!pool.release(id, &mut arena));
        assert_eq!(arena.len(), 0);
    }
}
