//! Entry -> exit argument relay keyed by thread.
//!
//! A thread cannot be inside two calls of the same kind at once, so one slot
//! per [`ThreadKey`] is enough. An entry left behind by a missed exit is simply
//! overwritten by the next entry on that thread.

use core::marker::PhantomData;

use crate::{table::KeyedTable, tuple::ThreadKey};

pub struct ArgRelay<'a, T, P> {
    table: &'a T,
    _payload: PhantomData<P>,
}

impl<'a, T, P> ArgRelay<'a, T, P>
where
    T: KeyedTable<ThreadKey, P>,
    P: Copy,
{
    pub const fn new(table: &'a T) -> Self {
        Self {
            table,
            _payload: PhantomData,
        }
    }

    /// Records the entry arguments. Returns false when the table refused the
    /// insert, which downstream is indistinguishable from a missed entry.
    pub fn on_entry(&self, key: ThreadKey, payload: &P) -> bool {
        self.table.update(&key, payload).is_ok()
    }

    /// Takes the entry arguments. The slot is always cleared.
    pub fn on_exit(&self, key: ThreadKey) -> Option<P> {
        let payload = self.table.lookup(&key);
        self.table.remove(&key);
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::FixedTable;

    #[test]
    fn test_exit_consumes_once() {
        let table: FixedTable<ThreadKey, u32, 8> = FixedTable::new();
        let relay = ArgRelay::new(&table);
        let key = ThreadKey::new(10, 11);

        assert!(relay.on_entry(key, &3));
        assert_eq!(relay.on_exit(key), Some(3));
        assert_eq!(relay.on_exit(key), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_stale_entry_is_superseded() {
        let table: FixedTable<ThreadKey, u32, 8> = FixedTable::new();
        let relay = ArgRelay::new(&table);
        let key = ThreadKey::new(10, 11);

        relay.on_entry(key, &1);
        relay.on_entry(key, &2);
        assert_eq!(relay.on_exit(key), Some(2));
        assert!(table.is_empty());
    }

    #[test]
    fn test_exit_without_entry_is_noop() {
        let table: FixedTable<ThreadKey, u32, 8> = FixedTable::new();
        let relay = ArgRelay::new(&table);
        relay.on_entry(ThreadKey::new(1, 1), &9);

        assert_eq!(relay.on_exit(ThreadKey::new(2, 2)), None);
        assert_eq!(table.lookup(&ThreadKey::new(1, 1)), Some(9));
    }

    #[test]
    fn test_one_sided_traffic_is_bounded() {
        const CAPACITY: usize = 16;
        let table: FixedTable<ThreadKey, u32, CAPACITY> = FixedTable::new();
        let relay = ArgRelay::new(&table);

        // entries whose exits never fire
        let mut accepted = 0;
        for tid in 0..1000u32 {
            if relay.on_entry(ThreadKey::new(7, tid), &tid) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, table.capacity());
        assert_eq!(table.len(), table.capacity());

        // orphans stay readable and can still be consumed
        assert_eq!(relay.on_exit(ThreadKey::new(7, 3)), Some(3));
        // the freed slot serves an unrelated thread end to end
        let other = ThreadKey::new(99, 1);
        assert!(relay.on_entry(other, &42));
        assert_eq!(relay.on_exit(other), Some(42));
        // a rejected key never shows up
        assert_eq!(relay.on_exit(ThreadKey::new(7, 500)), None);
        assert!(table.len() <= table.capacity());
    }
}
