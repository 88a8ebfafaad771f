//! Operations parked until an external event releases them.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

/// A set of values parked under a key, released all at once by
/// [WaitingSet::take].
#[derive(Debug)]
pub struct WaitingSet<K, V> {
    inner: Mutex<HashMap<K, VecDeque<V>>>,
}

impl<K, V> Default for WaitingSet<K, V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Hash + Eq + Clone, V> WaitingSet<K, V> {
    /// Park a value at the back of its key's list.
    pub fn park(&self, key: K, value: V) {
        self.inner
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push_back(value);
    }

    /// Park a value at the front of its key's list, so it is released
    /// first.
    pub fn park_front(&self, key: K, value: V) {
        self.inner
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push_front(value);
    }

    /// Release every value parked under `key`, in order.
    pub fn take(&self, key: &K) -> Vec<V> {
        self.inner
            .lock()
            .unwrap()
            .remove(key)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Release everything.
    pub fn take_all(&self) -> Vec<(K, Vec<V>)> {
        self.inner
            .lock()
            .unwrap()
            .drain()
            .map(|(k, v)| (k, Vec::from(v)))
            .collect()
    }

    /// True if something is parked under `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().unwrap().contains_key(key)
    }

    /// Number of parked values.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().values().map(|v| v.len()).sum()
    }

    /// True if nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
