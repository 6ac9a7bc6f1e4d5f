//! Open-addressed value table.
//!
//! Linear probing over a power-of-two slot array at a 0.75 load factor.
//! Unoccupied slots carry the kwargs sentinel as their key; deleted slots
//! additionally set the tombstone flag so probe chains stay intact. One table
//! type backs dict entries, instance fields, class methods, and module
//! globals.
//!
//! Key hashing and equality are structural (see `hash.rs`); the table never
//! re-enters the VM, which keeps resizing and GC traversal free of managed
//! side effects.

use crate::{
    hash::hash_value,
    heap::Heap,
    value::{EMPTY_KEY, Value, values_equal},
};

const MIN_CAPACITY: usize = 8;
/// Numerator/denominator of the grow threshold: resize past 3/4 full.
const LOAD_NUM: usize = 3;
const LOAD_DEN: usize = 4;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Entry {
    pub key: Value,
    pub value: Value,
    tombstone: bool,
}

impl Entry {
    const EMPTY: Self = Self {
        key: EMPTY_KEY,
        value: Value::None,
        tombstone: false,
    };

    fn is_vacant(&self) -> bool {
        matches!(self.key, Value::Kwargs(_))
    }
}

/// Open-addressed mapping from values to values.
#[derive(Debug, Default)]
pub(crate) struct Table {
    entries: Vec<Entry>,
    /// Occupied slots (live entries only).
    live: usize,
    /// Occupied plus tombstoned slots; drives the load-factor check.
    used: usize,
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Looks up `key`, returning its value if present.
    #[must_use]
    pub fn get(&self, heap: &Heap, key: Value) -> Option<Value> {
        if self.live == 0 {
            return None;
        }
        let slot = self.find_slot(heap, key)?;
        let entry = &self.entries[slot];
        if entry.is_vacant() { None } else { Some(entry.value) }
    }

    /// Inserts or updates `key`. Returns true iff the key was not present.
    ///
    /// The caller must have verified the key is hashable; unhashable keys are
    /// silently ignored here (the VM raises TypeError before reaching this).
    pub fn set(&mut self, heap: &Heap, key: Value, value: Value) -> bool {
        if (self.used + 1) * LOAD_DEN > self.entries.len() * LOAD_NUM {
            let capacity = (self.entries.len() * 2).max(MIN_CAPACITY);
            self.adjust_capacity(heap, capacity);
        }
        let Some(slot) = self.find_slot(heap, key) else {
            return false;
        };
        let entry = &mut self.entries[slot];
        let is_new = entry.is_vacant();
        if is_new {
            self.live += 1;
            // A fresh slot consumes load; a reused tombstone already did.
            if !entry.tombstone {
                self.used += 1;
            }
        }
        *entry = Entry {
            key,
            value,
            tombstone: false,
        };
        is_new
    }

    /// Removes `key`, leaving a tombstone so later probes keep walking.
    /// Returns true iff the key was present.
    pub fn delete(&mut self, heap: &Heap, key: Value) -> bool {
        if self.live == 0 {
            return false;
        }
        let Some(slot) = self.find_slot(heap, key) else {
            return false;
        };
        let entry = &mut self.entries[slot];
        if entry.is_vacant() {
            return false;
        }
        *entry = Entry {
            key: EMPTY_KEY,
            value: Value::None,
            tombstone: true,
        };
        self.live -= 1;
        true
    }

    /// Copies every live entry of `other` into `self`.
    pub fn add_all(&mut self, heap: &Heap, other: &Self) {
        for (key, value) in other.iter() {
            self.set(heap, key, value);
        }
    }

    /// Rebuilds the slot array at `capacity` (rounded up to a power of two),
    /// re-inserting live entries and discarding tombstones.
    pub fn adjust_capacity(&mut self, heap: &Heap, capacity: usize) {
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; capacity]);
        self.live = 0;
        self.used = 0;
        for entry in old {
            if !entry.is_vacant() {
                self.set(heap, entry.key, entry.value);
            }
        }
    }

    /// Iterates live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().filter(|e| !e.is_vacant()).map(|e| (e.key, e.value))
    }

    /// Returns the first live entry at or after `slot`, along with the slot
    /// index to resume from. Drives dict iterator instances, which hold a
    /// plain slot cursor rather than a borrowing iterator.
    #[must_use]
    pub fn next_entry(&self, slot: usize) -> Option<(usize, Value, Value)> {
        self.entries[slot.min(self.entries.len())..]
            .iter()
            .enumerate()
            .find(|(_, e)| !e.is_vacant())
            .map(|(off, e)| (slot + off + 1, e.key, e.value))
    }

    /// Locates the slot for `key`: either its live entry or the vacant slot
    /// where an insert would land (preferring the first tombstone seen).
    /// `None` only for unhashable keys or an unallocated table.
    fn find_slot(&self, heap: &Heap, key: Value) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = (hash_value(heap, key)? as usize) & mask;
        let mut first_tombstone = None;
        loop {
            let entry = &self.entries[index];
            if entry.is_vacant() {
                if entry.tombstone {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                } else {
                    return Some(first_tombstone.unwrap_or(index));
                }
            } else if values_equal(heap, entry.key, key) {
                return Some(index);
            }
            index = (index + 1) & mask;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_new_keys() {
        let heap = Heap::new(false);
        let mut table = Table::new();
        assert!(table.set(&heap, Value::Int(1), Value::Int(10)));
        assert!(!table.set(&heap, Value::Int(1), Value::Int(20)));
        assert_eq!(table.len(), 1);
        assert!(matches!(table.get(&heap, Value::Int(1)), Some(Value::Int(20))));
    }

    #[test]
    fn delete_leaves_probe_chains_valid() {
        let heap = Heap::new(false);
        let mut table = Table::new();
        // Force a dense cluster: sequential ints probe adjacent slots.
        for i in 0..6 {
            table.set(&heap, Value::Int(i), Value::Int(i * 100));
        }
        assert!(table.delete(&heap, Value::Int(2)));
        assert!(!table.delete(&heap, Value::Int(2)));
        for i in [0, 1, 3, 4, 5] {
            assert!(
                matches!(table.get(&heap, Value::Int(i)), Some(Value::Int(v)) if v == i * 100),
                "key {i} lost after tombstone"
            );
        }
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn tombstone_slot_is_reused_on_insert() {
        let heap = Heap::new(false);
        let mut table = Table::new();
        for i in 0..4 {
            table.set(&heap, Value::Int(i), Value::None);
        }
        table.delete(&heap, Value::Int(1));
        assert!(table.set(&heap, Value::Int(1), Value::Int(7)));
        assert!(matches!(table.get(&heap, Value::Int(1)), Some(Value::Int(7))));
    }

    #[test]
    fn grows_past_load_factor_and_keeps_entries() {
        let heap = Heap::new(false);
        let mut table = Table::new();
        for i in 0..100 {
            table.set(&heap, Value::Int(i), Value::Int(-i));
        }
        assert_eq!(table.len(), 100);
        assert!(table.capacity().is_power_of_two());
        for i in 0..100 {
            assert!(matches!(table.get(&heap, Value::Int(i)), Some(Value::Int(v)) if v == -i));
        }
    }

    #[test]
    fn cross_type_numeric_keys_collide() {
        let heap = Heap::new(false);
        let mut table = Table::new();
        table.set(&heap, Value::Int(1), Value::Int(100));
        // True == 1, so this overwrites rather than inserts.
        assert!(!table.set(&heap, Value::Bool(true), Value::Int(200)));
        assert!(matches!(table.get(&heap, Value::Int(1)), Some(Value::Int(200))));
    }

    #[test]
    fn iteration_skips_vacant_slots() {
        let heap = Heap::new(false);
        let mut table = Table::new();
        for i in 0..5 {
            table.set(&heap, Value::Int(i), Value::Int(i));
        }
        table.delete(&heap, Value::Int(3));
        let keys: Vec<i64> = table.iter().map(|(k, _)| k.as_int().unwrap()).collect();
        assert_eq!(keys.len(), 4);
        assert!(!keys.contains(&3));
    }
}
