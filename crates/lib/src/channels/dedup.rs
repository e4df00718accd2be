//! Bounded window of recently seen message keys.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;

/// Composite key for a delivered item: where it came from and a timestamp or id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeenKey {
    pub source_id: String,
    pub marker: String,
}

impl SeenKey {
    pub fn new(source_id: impl Into<String>, marker: impl fmt::Display) -> Self {
        Self {
            source_id: source_id.into(),
            marker: marker.to_string(),
        }
    }
}

/// Fixed-capacity insertion-ordered set; the oldest key is evicted once capacity is exceeded.
#[derive(Debug, Clone)]
pub struct DedupWindow<K = SeenKey> {
    capacity: usize,
    order: VecDeque<K>,
    members: HashSet<K>,
}

impl<K: Eq + Hash + Clone> DedupWindow<K> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.members.contains(key)
    }

    /// Record a key. Returns false when it was already present (a duplicate).
    pub fn insert(&mut self, key: K) -> bool {
        if self.members.contains(&key) {
            return false;
        }
        self.members.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.members.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
