//! An open-addressed hash table with linear probing and tombstone
//! deletion, shared between the string-intern set and every
//! string-keyed map the language needs (globals, fields, methods).
//!
//! Entry states: empty (`key: None`, `value: Nil`), live (`key:
//! Some`), tombstone (`key: None`, `value: Bool(true)`). Capacity
//! always grows to the next `GROW_CAPACITY` step (8, 16, 32, ...) once
//! the load factor would exceed 0.75.

use crate::object::{GcRef, ObjString};
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<GcRef<ObjString>>,
    value: Value,
}

const EMPTY: Entry = Entry {
    key: None,
    value: Value::Nil,
};

pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Finds the slot `key` belongs in: its home bucket, or the first
    /// tombstone/empty slot seen along the probe sequence, matching
    /// `findEntry`'s tombstone-reuse semantics exactly.
    fn find_entry(entries: &[Entry], key: GcRef<ObjString>) -> usize {
        let capacity = entries.len();
        let mut index = (key.get().hash as usize) % capacity;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if entry.value.is_nil() {
                        return tombstone.unwrap_or(index);
                    } else if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) % capacity;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut new_entries = vec![EMPTY; capacity];
        let mut new_count = 0;
        for entry in &self.entries {
            if let Some(key) = entry.key {
                let index = Self::find_entry(&new_entries, key);
                new_entries[index] = Entry {
                    key: Some(key),
                    value: entry.value,
                };
                new_count += 1;
            }
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    pub fn get(&self, key: GcRef<ObjString>) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, key);
        self.entries[index].key.map(|_| self.entries[index].value)
    }

    /// Returns `true` if this created a brand new key.
    pub fn set(&mut self, key: GcRef<ObjString>, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            let capacity = if self.capacity() < 8 {
                8
            } else {
                self.capacity() * 2
            };
            self.adjust_capacity(capacity);
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_none();
        if is_new_key && entry.value.is_nil() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new_key
    }

    pub fn delete(&mut self, key: GcRef<ObjString>) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, key);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = Entry {
            key: None,
            value: Value::Bool(true),
        };
        true
    }

    pub fn add_all(&mut self, from: &Table) {
        for entry in &from.entries {
            if let Some(key) = entry.key {
                self.set(key, entry.value);
            }
        }
    }

    pub fn find_string(&self, bytes: &[u8], hash: u32) -> Option<GcRef<ObjString>> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = (hash as usize) % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if entry.value.is_nil() => return None,
                Some(k) if k.get().hash == hash && k.get().bytes.as_ref() == bytes => {
                    return Some(k);
                }
                _ => {}
            }
            index = (index + 1) % capacity;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (GcRef<ObjString>, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Drops every entry whose key didn't survive the mark phase,
    /// since the intern table holds weak references: being interned
    /// does not by itself keep a string alive.
    pub fn remove_white(&mut self) {
        let stale: Vec<GcRef<ObjString>> = self
            .entries
            .iter()
            .filter_map(|e| e.key)
            .filter(|k| !k.header().marked.get())
            .collect();
        for key in stale {
            self.delete(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn set_then_get_round_trips() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.alloc_string(b"answer".to_vec().into_boxed_slice(), crate::table::hash_bytes(b"answer"));
        assert!(table.set(key, Value::Number(42.0)));
        assert_eq!(table.get(key).unwrap(), Value::Number(42.0));
    }

    #[test]
    fn delete_then_get_returns_none() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.alloc_string(b"gone".to_vec().into_boxed_slice(), crate::table::hash_bytes(b"gone"));
        table.set(key, Value::Nil);
        assert!(table.delete(key));
        assert!(table.get(key).is_none());
    }

    #[test]
    fn reinserting_after_tombstone_reuses_slot() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = heap.alloc_string(b"x".to_vec().into_boxed_slice(), crate::table::hash_bytes(b"x"));
        table.set(key, Value::Bool(false));
        table.delete(key);
        assert!(table.set(key, Value::Bool(true)));
        assert_eq!(table.get(key).unwrap(), Value::Bool(true));
    }
}

pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}
