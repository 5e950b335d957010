//! Bounded least-recently-used cache for parsed records.
//!
//! Entries are keyed by the owning file id plus a hash of a name, so both
//! "record N" and "child `name` of directory N" fit the same table.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct CacheKey {
    pub file_id: u64,
    pub name_hash: u64,
}

impl CacheKey {
    /// The record itself.
    pub fn record(file_id: u64) -> Self {
        Self {
            file_id,
            name_hash: 0,
        }
    }

    /// The entry called `name` inside directory `dir_id`. NTFS names
    /// compare case-insensitively, so the hash does too.
    pub fn named(dir_id: u64, name: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        name.to_uppercase().hash(&mut hasher);
        Self {
            file_id: dir_id,
            // never collides with `record`
            name_hash: hasher.finish() | 1,
        }
    }
}

#[derive(Debug)]
pub struct RecordCache<V> {
    capacity: usize,
    entries: HashMap<CacheKey, V>,
    // front = least recently used
    order: VecDeque<CacheKey>,
}

impl<V: Clone> RecordCache<V> {
    /// A cache of `capacity` entries. Zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, key: &CacheKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(*key);
    }

    pub fn get(&mut self, key: &CacheKey) -> Option<V> {
        let value = self.entries.get(key)?.clone();
        self.touch(key);
        Some(value)
    }

    /// Insert or replace `key`. Returns the key evicted to make room.
    pub fn insert(&mut self, key: CacheKey, value: V) -> Option<CacheKey> {
        if self.capacity == 0 {
            return None;
        }
        let mut evicted = None;
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.entries.remove(&old);
                debug!("Record cache evicted {:?}", old);
                evicted = Some(old);
            }
        }
        self.entries.insert(key, value);
        self.touch(&key);
        evicted
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
