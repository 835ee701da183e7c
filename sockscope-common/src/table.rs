//! Fixed-capacity keyed tables.
//!
//! Every component in this crate talks to its peers only through a
//! [`KeyedTable`]. In the kernel the implementation is a BPF hash map; on the
//! host it is [`FixedTable`], which mirrors the map semantics closely enough to
//! exercise the correlation logic in plain unit tests:
//!
//! - each operation touches exactly one key and is atomic for that key
//! - `update` on an existing key overwrites it (last write wins)
//! - `update` on a new key fails once the table is at capacity

use core::cell::RefCell;

/// Reason an insert did not take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// The table already holds its maximum number of keys.
    Full,
    /// The backing store refused the write (kernel map error code).
    Rejected(i64),
}

pub trait KeyedTable<K, V> {
    /// Copies the value stored under `key`.
    fn lookup(&self, key: &K) -> Option<V>;

    /// Inserts or overwrites `key`.
    fn update(&self, key: &K, value: &V) -> Result<(), TableError>;

    /// Runs `f` against the stored value in place.
    fn with_entry_mut<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R>;

    /// Deletes `key`, returning whether it was present.
    fn remove(&self, key: &K) -> bool;

    fn contains_key(&self, key: &K) -> bool {
        self.with_entry_mut(key, |_| ()).is_some()
    }
}

/// Bounded table backed by an inline array. No allocation; `N` is the hard
/// capacity.
pub struct FixedTable<K, V, const N: usize> {
    slots: RefCell<[Option<(K, V)>; N]>,
}

impl<K: Copy + PartialEq, V: Copy, const N: usize> FixedTable<K, V, N> {
    pub const fn new() -> Self {
        Self {
            slots: RefCell::new([None; N]),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every entry. `f` must not call back into this table.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for (k, v) in self.slots.borrow().iter().flatten() {
            f(k, v);
        }
    }

    fn position(slots: &[Option<(K, V)>; N], key: &K) -> Option<usize> {
        slots
            .iter()
            .position(|s| matches!(s, Some((k, _)) if k == key))
    }
}

impl<K: Copy + PartialEq, V: Copy, const N: usize> Default for FixedTable<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + PartialEq, V: Copy, const N: usize> KeyedTable<K, V> for FixedTable<K, V, N> {
    fn lookup(&self, key: &K) -> Option<V> {
        let slots = self.slots.borrow();
        Self::position(&slots, key).and_then(|i| slots[i].map(|(_, v)| v))
    }

    fn update(&self, key: &K, value: &V) -> Result<(), TableError> {
        let mut slots = self.slots.borrow_mut();
        if let Some(i) = Self::position(&slots, key) {
            slots[i] = Some((*key, *value));
            return Ok(());
        }
        match slots.iter().position(Option::is_none) {
            Some(i) => {
                slots[i] = Some((*key, *value));
                Ok(())
            }
            None => Err(TableError::Full),
        }
    }

    fn with_entry_mut<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut slots = self.slots.borrow_mut();
        let i = Self::position(&slots, key)?;
        slots[i].as_mut().map(|(_, v)| f(v))
    }

    fn remove(&self, key: &K) -> bool {
        let mut slots = self.slots.borrow_mut();
        match Self::position(&slots, key) {
            Some(i) => {
                slots[i] = None;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_overwrites_existing_key() {
        let table: FixedTable<u32, u64, 4> = FixedTable::new();
        table.update(&1, &10).unwrap();
        table.update(&1, &20).unwrap();
        assert_eq!(table.lookup(&1), Some(20));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_insert_rejected_when_full() {
        let table: FixedTable<u32, u64, 2> = FixedTable::new();
        table.update(&1, &1).unwrap();
        table.update(&2, &2).unwrap();
        assert_eq!(table.update(&3, &3), Err(TableError::Full));
        // existing keys can still be rewritten at capacity
        assert!(table.update(&2, &22).is_ok());
        assert_eq!(table.lookup(&2), Some(22));
        assert_eq!(table.lookup(&3), None);
    }

    #[test]
    fn test_remove_frees_slot() {
        let table: FixedTable<u32, u64, 1> = FixedTable::new();
        table.update(&1, &1).unwrap();
        assert!(table.remove(&1));
        assert!(!table.remove(&1));
        assert!(table.update(&2, &2).is_ok());
    }

    #[test]
    fn test_with_entry_mut_edits_in_place() {
        let table: FixedTable<u32, u64, 2> = FixedTable::new();
        table.update(&7, &1).unwrap();
        let bumped = table.with_entry_mut(&7, |v| {
            *v += 1;
            *v
        });
        assert_eq!(bumped, Some(2));
        assert_eq!(table.with_entry_mut(&8, |v| *v), None);
        assert!(table.contains_key(&7));
        assert!(!table.contains_key(&8));
    }
}
