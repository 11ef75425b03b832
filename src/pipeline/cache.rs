//! Load-once caches for models shared across requests.

use anyhow::Result;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Lazily filled map with one initialisation per key.
///
/// The map lock is only held to find or create a key's cell; loading runs
/// under the cell, so two requests for the same key wait on one load while
/// other keys proceed. A failed load leaves the cell empty for the next try.
pub struct KeyedCache<K, V> {
    cells: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> KeyedCache<K, V> {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_try_init<F>(&self, key: &K, init: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        let cell = {
            let mut cells = self.cells.lock();
            Arc::clone(cells.entry(key.clone()).or_default())
        };
        cell.get_or_try_init(init).cloned()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.cells.lock().get(key).and_then(|cell| cell.get().cloned())
    }

    /// Store a ready value; replaces any earlier entry.
    pub fn insert(&self, key: K, value: V) {
        let cell = OnceCell::new();
        let _ = cell.set(value);
        self.cells.lock().insert(key, Arc::new(cell));
    }

    /// Number of keys holding a loaded value.
    pub fn len(&self) -> usize {
        self.cells.lock().values().filter(|c| c.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.cells.lock().clear();
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for KeyedCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
