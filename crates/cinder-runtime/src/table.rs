//! Open-addressed hash table keyed by interned strings
//!
//! Linear probing with tombstones; capacity is always a power of two and the
//! table grows when the load factor (live entries plus tombstones) would pass
//! 3/4. Keys compare by handle identity — interning guarantees byte-equal
//! strings share a handle — so probing never touches string contents. The
//! key's hash rides along in [`StrKey`], which keeps every operation free of
//! heap lookups.

use crate::heap::ObjRef;
use crate::value::Value;

/// An interned-string key: the handle plus its cached hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrKey {
    pub obj: ObjRef,
    pub hash: u32,
}

#[derive(Debug, Clone)]
struct Entry {
    key: Option<StrKey>,
    value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry {
        key: None,
        value: Value::Nil,
    };

    /// A tombstone is a vacated bucket: no key, value `true`
    fn is_tombstone(&self) -> bool {
        self.key.is_none() && self.value == Value::Bool(true)
    }
}

/// Hash table mapping interned strings to values
#[derive(Debug, Default)]
pub struct Table {
    /// Live entries plus tombstones
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.key.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a key
    pub fn get(&self, key: StrKey) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = self.find_entry(key.obj, key.hash);
        self.entries[index].key.map(|_| self.entries[index].value)
    }

    /// Insert or overwrite. Returns `true` when the key was not present.
    pub fn set(&mut self, key: StrKey, value: Value) -> bool {
        if (self.count + 1) * 4 > self.capacity() * 3 {
            self.grow();
        }

        let index = self.find_entry(key.obj, key.hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        // Reusing a tombstone does not change the count.
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new
    }

    /// Remove a key, leaving a tombstone. Returns `true` if it was present.
    pub fn delete(&mut self, key: StrKey) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = self.find_entry(key.obj, key.hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::Bool(true);
        true
    }

    /// Copy every live entry from `other` into `self`
    pub fn extend_from(&mut self, other: &Table) {
        for (key, value) in other.iter() {
            self.set(key, value);
        }
    }

    /// Iterate live entries
    pub fn iter(&self) -> impl Iterator<Item = (StrKey, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Probe for a key by hash, comparing candidates with `matches`. Used by
    /// the heap to dedupe a not-yet-interned string against the intern table.
    pub fn find_key(&self, hash: u32, mut matches: impl FnMut(ObjRef) -> bool) -> Option<StrKey> {
        if self.count == 0 {
            return None;
        }
        let mask = self.capacity() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                Some(key) => {
                    if key.hash == hash && matches(key.obj) {
                        return Some(key);
                    }
                }
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Delete every entry whose key satisfies `condemned`. The collector runs
    /// this over the intern table before sweeping so that about-to-be-freed
    /// strings drop out of it.
    pub fn remove_where(&mut self, mut condemned: impl FnMut(ObjRef) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if condemned(key.obj) {
                    entry.key = None;
                    entry.value = Value::Bool(true);
                }
            }
        }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Locate the bucket for a key: either its current bucket or the one an
    /// insert should use (the first tombstone passed, else the first empty).
    fn find_entry(&self, obj: ObjRef, hash: u32) -> usize {
        let mask = self.capacity() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                Some(key) => {
                    if key.obj == obj {
                        return index;
                    }
                }
                None => {
                    if entry.is_tombstone() {
                        if tombstone.is_none() {
                            tombstone = Some(index);
                        }
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Double the capacity and re-insert live entries, shedding tombstones
    fn grow(&mut self) {
        let new_capacity = if self.capacity() < 8 {
            8
        } else {
            self.capacity() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; new_capacity]);
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = self.find_entry(key.obj, key.hash);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn key_of(heap: &mut Heap, s: &str) -> StrKey {
        let obj = heap.intern(s);
        heap.key(obj)
    }

    #[test]
    fn test_set_get_overwrite() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let k = key_of(&mut heap, "a");

        assert!(table.set(k, Value::Number(1.0)));
        assert_eq!(table.get(k), Some(Value::Number(1.0)));
        assert!(!table.set(k, Value::Number(2.0)));
        assert_eq!(table.get(k), Some(Value::Number(2.0)));
    }

    #[test]
    fn test_missing_key() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let a = key_of(&mut heap, "a");
        let b = key_of(&mut heap, "b");
        table.set(a, Value::Nil);
        assert_eq!(table.get(b), None);
        assert!(!table.delete(b));
    }

    #[test]
    fn test_delete_leaves_probe_chain_intact() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let keys: Vec<StrKey> = (0..16)
            .map(|i| key_of(&mut heap, &format!("key{}", i)))
            .collect();
        for (i, &k) in keys.iter().enumerate() {
            table.set(k, Value::Number(i as f64));
        }
        // Delete half, then verify the rest still resolve through any
        // tombstones left in their probe chains.
        for &k in keys.iter().step_by(2) {
            assert!(table.delete(k));
        }
        for (i, &k) in keys.iter().enumerate() {
            if i % 2 == 0 {
                assert_eq!(table.get(k), None);
            } else {
                assert_eq!(table.get(k), Some(Value::Number(i as f64)));
            }
        }
    }

    #[test]
    fn test_tombstone_reuse() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let k = key_of(&mut heap, "x");
        table.set(k, Value::Number(1.0));
        table.delete(k);
        assert!(table.set(k, Value::Number(2.0)));
        assert_eq!(table.get(k), Some(Value::Number(2.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let keys: Vec<StrKey> = (0..100)
            .map(|i| key_of(&mut heap, &format!("g{}", i)))
            .collect();
        for (i, &k) in keys.iter().enumerate() {
            table.set(k, Value::Number(i as f64));
        }
        assert_eq!(table.len(), 100);
        for (i, &k) in keys.iter().enumerate() {
            assert_eq!(table.get(k), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn test_extend_from() {
        let mut heap = Heap::new();
        let mut parent = Table::new();
        let mut child = Table::new();
        let a = key_of(&mut heap, "a");
        let b = key_of(&mut heap, "b");
        parent.set(a, Value::Number(1.0));
        parent.set(b, Value::Number(2.0));
        child.set(b, Value::Number(9.0));

        let mut sub = Table::new();
        sub.extend_from(&parent);
        sub.extend_from(&child);
        // Later sources win, like subclass methods overriding inherited ones.
        assert_eq!(sub.get(a), Some(Value::Number(1.0)));
        assert_eq!(sub.get(b), Some(Value::Number(9.0)));
    }
}
