//! Fiber-local storage.
//!
//! Each fiber carries a small table of cells keyed by type identity. A cell
//! is lazily default-constructed on first access and deep-copied into child
//! fibers at submission time, so a task tree shares a snapshot lineage
//! rather than live state. Off-fiber access resolves to a process-wide
//! thread-local table instead.
//!
//! Access goes through [`FiberManager::with_local`](crate::FiberManager::with_local)
//! or the free function [`with_local`](crate::with_local); the contract is
//! one type tag per datum for the lifetime of a fiber.

use smallvec::SmallVec;
use std::any::{Any, TypeId};
use std::cell::RefCell;

/// A type-erased fiber-local cell.
///
/// `Send` because cells ride inside cross-thread task records when a fiber
/// submits work to another engine thread.
pub(crate) trait LocalCell: Any + Send {
    /// Deep-copies the cell for inheritance by a child fiber.
    fn clone_cell(&self) -> Box<dyn LocalCell>;
    /// Downcast access to the concrete cell.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct CellSlot<T>(T);

impl<T: Clone + Default + Send + 'static> LocalCell for CellSlot<T> {
    fn clone_cell(&self) -> Box<dyn LocalCell> {
        Box::new(CellSlot(self.0.clone()))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// The per-fiber table of local cells.
///
/// A small association list: fibers typically hold zero or one locals, so a
/// linear scan beats hashing.
#[derive(Default)]
pub(crate) struct LocalsMap {
    cells: SmallVec<[(TypeId, Box<dyn LocalCell>); 2]>,
}

impl LocalsMap {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no cell has been created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Removes and returns the cell for `ty`, if present.
    pub fn take_cell(&mut self, ty: TypeId) -> Option<Box<dyn LocalCell>> {
        let pos = self.cells.iter().position(|(t, _)| *t == ty)?;
        Some(self.cells.swap_remove(pos).1)
    }

    /// Installs `cell` for `ty`, replacing any existing cell.
    pub fn put_cell(&mut self, ty: TypeId, cell: Box<dyn LocalCell>) {
        if let Some(entry) = self.cells.iter_mut().find(|(t, _)| *t == ty) {
            entry.1 = cell;
        } else {
            self.cells.push((ty, cell));
        }
    }

    /// Deep-copies every cell; the child's lineage starts from this snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self {
            cells: self
                .cells
                .iter()
                .map(|(ty, cell)| (*ty, cell.clone_cell()))
                .collect(),
        }
    }
}

impl Clone for LocalsMap {
    fn clone(&self) -> Self {
        self.snapshot()
    }
}

impl std::fmt::Debug for LocalsMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalsMap")
            .field("cells", &self.cells.len())
            .finish()
    }
}

/// Creates a freshly default-constructed cell for `T`.
#[must_use]
pub(crate) fn new_cell<T: Clone + Default + Send + 'static>() -> Box<dyn LocalCell> {
    Box::new(CellSlot(T::default()))
}

/// Borrows the concrete value out of a type-erased cell.
pub(crate) fn cell_value_mut<T: Clone + Default + Send + 'static>(
    cell: &mut dyn LocalCell,
) -> Option<&mut T> {
    cell.as_any_mut()
        .downcast_mut::<CellSlot<T>>()
        .map(|slot| &mut slot.0)
}

thread_local! {
    /// Fallback table used when a local is accessed with no fiber running.
    static FALLBACK_LOCALS: RefCell<LocalsMap> = RefCell::new(LocalsMap::new());
}

/// Runs `f` against the thread-local fallback cell for `T`.
pub(crate) fn with_fallback_local<T, R>(f: impl FnOnce(&mut T) -> R) -> R
where
    T: Clone + Default + Send + 'static,
{
    let ty = TypeId::of::<T>();
    let mut cell = FALLBACK_LOCALS
        .with(|map| map.borrow_mut().take_cell(ty))
        .unwrap_or_else(new_cell::<T>);
    let result = f(cell_value_mut::<T>(cell.as_mut()).expect("fiber-local type tag mismatch"));
    FALLBACK_LOCALS.with(|map| map.borrow_mut().put_cell(ty, cell));
    result
}
