//! Generational slot arena backing fiber storage.
//!
//! Fibers live in arena slots so that queues can refer to them by index
//! instead of by pointer; the intrusive ready queue and pool free-list store
//! only indices. A slot is vacated when a fiber is destroyed (not when it is
//! pooled), and its generation counter bumps so stale indices are detected
//! instead of aliasing the slot's next occupant.
//!
//! Vacant slot indices are kept on a side stack, so reuse picks the most
//! recently vacated slot and insertion never walks the entry table.

use core::fmt;

/// Key to an arena slot, packing the slot index into the low half and the
/// slot's generation into the high half.
///
/// Two keys for the same slot compare unequal once the slot has been
/// recycled, which is what makes stale-reference detection work.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaIndex(u64);

impl ArenaIndex {
    /// Builds a key from its parts (primarily for testing).
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    /// The slot index half of the key.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation half of the key.
    #[must_use]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaIndex({}v{})", self.index(), self.generation())
    }
}

/// One slot: its current generation, and the occupant if any.
///
/// A vacant entry keeps the generation that the *next* occupant will be
/// issued under; the bump happens at vacate time.
#[derive(Debug)]
struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// A slot arena with generation-checked keys.
///
/// Lookups verify both halves of the key, so a key outlives its value only
/// as a detectably-dead reference, never as an accessor of the slot's next
/// occupant.
#[derive(Debug)]
pub struct Arena<T> {
    entries: Vec<Entry<T>>,
    /// Indices of vacant entries, most recently vacated on top.
    vacant: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Creates a new empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            vacant: Vec::new(),
        }
    }

    /// Returns the number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len() - self.vacant.len()
    }

    /// Inserts a value, reusing the most recently vacated slot if one
    /// exists, and returns its key.
    pub fn insert(&mut self, value: T) -> ArenaIndex {
        if let Some(index) = self.vacant.pop() {
            let entry = &mut self.entries[index as usize];
            debug_assert!(entry.value.is_none(), "vacant stack listed a full slot");
            entry.value = Some(value);
            return ArenaIndex::new(index, entry.generation);
        }

        let index = u32::try_from(self.entries.len()).expect("fiber arena exhausted");
        self.entries.push(Entry {
            generation: 0,
            value: Some(value),
        });
        ArenaIndex::new(index, 0)
    }

    /// Removes and returns the value under `key`.
    ///
    /// Returns `None` for a stale or vacant key. The slot's generation bumps
    /// at vacate time, so every outstanding copy of the key goes dead.
    pub fn remove(&mut self, key: ArenaIndex) -> Option<T> {
        let entry = self.entries.get_mut(key.index() as usize)?;
        if entry.generation != key.generation() {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.vacant.push(key.index());
        Some(value)
    }

    /// Returns a reference to the value under `key`, if the key is current.
    #[must_use]
    pub fn get(&self, key: ArenaIndex) -> Option<&T> {
        let entry = self.entries.get(key.index() as usize)?;
        if entry.generation != key.generation() {
            return None;
        }
        entry.value.as_ref()
    }

    /// Returns a mutable reference to the value under `key`, if the key is
    /// current.
    pub fn get_mut(&mut self, key: ArenaIndex) -> Option<&mut T> {
        let entry = self.entries.get_mut(key.index() as usize)?;
        if entry.generation != key.generation() {
            return None;
        }
        entry.value.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_packs_and_unpacks() {
        let key = ArenaIndex::new(7, 3);
        assert_eq!(key.index(), 7);
        assert_eq!(key.generation(), 3);
        assert_eq!(format!("{key:?}"), "ArenaIndex(7v3)");
    }

    #[test]
    fn insert_and_get() {
        let mut arena = Arena::new();
        let key = arena.insert("alpha");
        assert_eq!(arena.get(key), Some(&"alpha"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn remove_bumps_generation() {
        let mut arena = Arena::new();
        let key = arena.insert(10);
        assert_eq!(arena.remove(key), Some(10));
        assert_eq!(arena.len(), 0);

        // Slot is reused under a new generation; the old key is dead.
        let key2 = arena.insert(20);
        assert_eq!(key2.index(), key.index());
        assert_ne!(key2.generation(), key.generation());
        assert!(arena.get(key).is_none());
        assert_eq!(arena.get(key2), Some(&20));
    }

    #[test]
    fn stale_remove_is_none() {
        let mut arena = Arena::new();
        let key = arena.insert(1);
        assert_eq!(arena.remove(key), Some(1));
        assert_eq!(arena.remove(key), None);
    }

    #[test]
    fn get_mut_mutates_in_place() {
        let mut arena = Arena::new();
        let key = arena.insert(vec![1]);
        arena.get_mut(key).unwrap().push(2);
        assert_eq!(arena.get(key), Some(&vec![1, 2]));
    }

    #[test]
    fn reuse_prefers_most_recently_vacated() {
        let mut arena = Arena::new();
        let a = arena.insert('a');
        let b = arena.insert('b');
        arena.remove(a);
        arena.remove(b);
        let c = arena.insert('c');
        assert_eq!(c.index(), b.index());
    }

    #[test]
    fn len_tracks_mixed_operations() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        let _b = arena.insert(2);
        assert_eq!(arena.len(), 2);

        arena.remove(a);
        assert_eq!(arena.len(), 1);

        let _c = arena.insert(3);
        let _d = arena.insert(4);
        assert_eq!(arena.len(), 3);
    }
}
