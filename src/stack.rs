//! Fiber stack allocation.
//!
//! Two allocator variants sit behind one enum: a plain heap allocator and a
//! guard-paged allocator that places one inaccessible page immediately below
//! the stack's low address, so overflow faults instead of silently corrupting
//! adjacent memory. Stacks grow downward on all supported targets.
//!
//! When stack-usage recording is enabled, freshly allocated stacks are filled
//! with a sentinel pattern; [`FiberStack::used_bytes`] scans from the low end
//! for the first overwritten byte to compute the deepest use so far.

use crate::error::{Error, ErrorKind};
use crate::options::EngineOptions;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

/// Smallest stack the engine will allocate.
pub const MIN_STACK_SIZE: usize = 4 * 1024;

/// Byte pattern used to detect the deepest stack use.
pub(crate) const STACK_SENTINEL: u8 = 0xAB;

/// How a stack's memory was obtained, which decides how it is returned.
#[derive(Debug)]
enum Backing {
    Heap(Layout),
    Mmap,
}

/// One fiber stack: an owned buffer, optionally preceded by a guard page.
#[derive(Debug)]
pub struct FiberStack {
    base: NonNull<u8>,
    total: usize,
    guard: usize,
    backing: Backing,
}

impl FiberStack {
    /// Lowest usable address (just above the guard page, if any).
    #[must_use]
    pub fn usable_base(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.guard) }
    }

    /// Number of usable bytes.
    #[must_use]
    pub const fn usable_len(&self) -> usize {
        self.total - self.guard
    }

    /// One past the highest usable address; the initial stack pointer starts
    /// here and grows downward.
    #[must_use]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.total) }
    }

    /// Fills the usable range with the sentinel pattern.
    pub(crate) fn fill_sentinel(&mut self) {
        unsafe {
            std::ptr::write_bytes(self.usable_base(), STACK_SENTINEL, self.usable_len());
        }
    }

    /// Scans from the low end for the first non-sentinel byte and returns the
    /// deepest number of bytes ever used.
    ///
    /// Only meaningful after [`fill_sentinel`](Self::fill_sentinel); the scan
    /// reflects the historical maximum for this stack, not the current frame.
    #[must_use]
    pub(crate) fn used_bytes(&self) -> usize {
        let base = self.usable_base();
        let len = self.usable_len();
        for offset in 0..len {
            if unsafe { *base.add(offset) } != STACK_SENTINEL {
                return len - offset;
            }
        }
        0
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        match self.backing {
            Backing::Heap(layout) => unsafe {
                dealloc(self.base.as_ptr(), layout);
            },
            Backing::Mmap => unsafe {
                libc::munmap(self.base.as_ptr().cast::<libc::c_void>(), self.total);
            },
        }
    }
}

/// Allocates fixed-size fiber stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackAllocator {
    /// Plain heap allocation, 16-byte aligned.
    Heap,
    /// `mmap`-backed allocation with a `PROT_NONE` page below the stack.
    GuardPaged,
}

impl StackAllocator {
    /// Picks the allocator variant requested by the options.
    #[must_use]
    pub fn from_options(options: &EngineOptions) -> Self {
        if options.guard_pages {
            Self::GuardPaged
        } else {
            Self::Heap
        }
    }

    /// Allocates one stack of at least `size` usable bytes.
    pub fn allocate(self, size: usize) -> Result<FiberStack, Error> {
        debug_assert!(size >= MIN_STACK_SIZE);
        match self {
            Self::Heap => allocate_heap(size),
            Self::GuardPaged => allocate_guarded(size),
        }
    }
}

fn allocate_heap(size: usize) -> Result<FiberStack, Error> {
    let layout = Layout::from_size_align(size, 16)
        .map_err(|_| Error::new(ErrorKind::StackAllocation).with_context("invalid stack layout"))?;
    let ptr = unsafe { alloc(layout) };
    let base = NonNull::new(ptr)
        .ok_or_else(|| Error::new(ErrorKind::StackAllocation).with_context("heap exhausted"))?;
    Ok(FiberStack {
        base,
        total: size,
        guard: 0,
        backing: Backing::Heap(layout),
    })
}

fn allocate_guarded(size: usize) -> Result<FiberStack, Error> {
    let page = page_size();
    let usable = size.div_ceil(page) * page;
    let total = usable + page;

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            total,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::new(ErrorKind::StackAllocation).with_context("mmap failed"));
    }
    let base = NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| Error::new(ErrorKind::StackAllocation).with_context("mmap returned null"))?;

    // Revoke access to the lowest page; stacks grow down toward it.
    let rc = unsafe { libc::mprotect(ptr, page, libc::PROT_NONE) };
    if rc != 0 {
        unsafe {
            libc::munmap(ptr, total);
        }
        return Err(Error::new(ErrorKind::StackAllocation).with_context("mprotect failed"));
    }

    Ok(FiberStack {
        base,
        total,
        guard: page,
        backing: Backing::Mmap,
    })
}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(sz).unwrap_or(4096)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_stack_basic() {
        let stack = StackAllocator::Heap.allocate(MIN_STACK_SIZE).unwrap();
        assert_eq!(stack.usable_len(), MIN_STACK_SIZE);
        assert_eq!(stack.top() as usize - stack.usable_base() as usize, MIN_STACK_SIZE);
    }

    #[test]
    fn sentinel_scan_tracks_deepest_use() {
        let mut stack = StackAllocator::Heap.allocate(MIN_STACK_SIZE).unwrap();
        stack.fill_sentinel();
        assert_eq!(stack.used_bytes(), 0);

        // Touch 100 bytes down from the top, as a growing stack would.
        unsafe {
            let p = stack.top().sub(100);
            *p = 0x01;
        }
        assert_eq!(stack.used_bytes(), 100);

        // Shallower touches do not lower the watermark.
        unsafe {
            let p = stack.top().sub(50);
            *p = 0x02;
        }
        assert_eq!(stack.used_bytes(), 100);
    }

    #[test]
    fn guarded_stack_rounds_to_pages() {
        let stack = StackAllocator::GuardPaged.allocate(MIN_STACK_SIZE).unwrap();
        assert!(stack.usable_len() >= MIN_STACK_SIZE);
        assert_eq!(stack.usable_len() % page_size(), 0);
        // The guard page sits below the usable range.
        assert_eq!(stack.usable_base() as usize - stack.base.as_ptr() as usize, page_size());
    }

    #[test]
    fn guarded_stack_is_writable() {
        let mut stack = StackAllocator::GuardPaged.allocate(MIN_STACK_SIZE).unwrap();
        stack.fill_sentinel();
        unsafe {
            let p = stack.top().sub(64);
            *p = 0x5A;
        }
        assert_eq!(stack.used_bytes(), 64);
    }

    #[test]
    fn from_options_picks_variant() {
        let heap = StackAllocator::from_options(&EngineOptions::default());
        assert_eq!(heap, StackAllocator::Heap);

        let opts = EngineOptions::new().with_guard_pages(true);
        assert_eq!(StackAllocator::from_options(&opts), StackAllocator::GuardPaged);
    }
}
