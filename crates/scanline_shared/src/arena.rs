//! Fixed capacity record storage
//!
//! An [`Arena`] is sized once when it is created and never grows. Records are handed out in
//! contiguous runs by [`Arena::reserve`], start out as `T::default()` and keep their address
//! until the arena is dropped, so indices into it can be kept as weak references.

use std::ops::{Index, IndexMut, Range};

use log::debug;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ArenaError {
    #[error("arena exhausted: requested {requested} records, {available} available")]
    Exhausted { requested: usize, available: usize },
}

/// Fixed capacity storage for records of type `T`.
pub struct Arena<T> {
    slots: Box<[T]>,
    /// Number of records handed out so far
    used: usize,
}

impl<T: Default> Arena<T> {
    /// Creates an arena able to hold `capacity` records. All storage is allocated up front.
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| T::default()).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            used: 0,
        }
    }

    /// Reserves `count` zero initialised records and returns their index range.
    pub fn reserve(&mut self, count: usize) -> Result<Range<usize>, ArenaError> {
        let available = self.slots.len() - self.used;
        if count > available {
            return Err(ArenaError::Exhausted {
                requested: count,
                available,
            });
        }

        let start = self.used;
        self.used += count;
        debug!(
            "Reserved {} record(s) of {}, {} left",
            count,
            std::any::type_name::<T>(),
            self.slots.len() - self.used
        );

        Ok(start..self.used)
    }
}

impl<T> Arena<T> {
    /// Total number of records this arena can hold.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of records reserved so far.
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Returns a reserved record.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots[..self.used].get(index)
    }

    /// Returns a reserved record mutably.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots[..self.used].get_mut(index)
    }

    /// Iterates over the reserved records.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots[..self.used].iter()
    }

    /// Iterates mutably over the reserved records.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots[..self.used].iter_mut()
    }
}

impl<T> Index<usize> for Arena<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        assert!(index < self.used, "Arena index {index} was never reserved");
        &self.slots[index]
    }
}

impl<T> IndexMut<usize> for Arena<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        assert!(index < self.used, "Arena index {index} was never reserved");
        &mut self.slots[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Record {
        id: u32,
        flag: bool,
    }

    #[test]
    fn reserved_records_start_zeroed() {
        let mut arena = Arena::<Record>::with_capacity(4);
        let range = arena.reserve(3).unwrap();

        assert_eq!(range, 0..3);
        assert!(arena.iter().all(|r| r.id == 0 && !r.flag));
    }

    #[test]
    fn addresses_are_stable_across_reservations() {
        let mut arena = Arena::<Record>::with_capacity(8);
        arena.reserve(1).unwrap();
        arena[0].id = 7;
        let first = &arena[0] as *const Record;

        arena.reserve(5).unwrap();

        assert_eq!(first, &arena[0] as *const Record);
        assert_eq!(arena[0].id, 7);
    }

    #[test]
    fn reserve_past_capacity_fails() {
        let mut arena = Arena::<Record>::with_capacity(2);
        arena.reserve(1).unwrap();

        assert_eq!(
            arena.reserve(2),
            Err(ArenaError::Exhausted {
                requested: 2,
                available: 1
            })
        );
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn unreserved_records_are_not_reachable() {
        let mut arena = Arena::<Record>::with_capacity(4);
        arena.reserve(1).unwrap();

        assert!(arena.get(1).is_none());
        assert!(arena.get_mut(0).is_some());
    }
}
