use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Condvar, Mutex};

use crate::key_state::KeyState;

/// The key registry and the coarse per-key data-state map, with the
/// condition variable the dispatch loop sleeps on.
///
/// Two distinct locks guard two distinct things, and they are always
/// acquired in this order when both are needed: `keys` (cheap, touched by
/// every lookup and by the dispatch loop's sleep/snapshot phase) then
/// `data` (coarse, touched by every enqueue/dequeue/subscribe and by every
/// admitted worker). Keys are only ever added, never removed, so the two
/// structures never drift out of sync.
pub(crate) struct Registry<K, V> {
    pub(crate) keys: Mutex<HashSet<K>>,
    pub(crate) data: Mutex<HashMap<K, KeyState<K, V>>>,
    pub(crate) wake: Condvar,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            keys: Mutex::new(HashSet::new()),
            data: Mutex::new(HashMap::new()),
            wake: Condvar::new(),
        }
    }

    /// Ensure `key` has an entry in both the registry and the data map.
    /// No-op if the key is already known (keys are never individually
    /// freed, so this check is stable for the engine's lifetime).
    pub(crate) fn get_or_create(&self, key: &K) {
        let mut keys = self.keys.lock().unwrap();
        if keys.contains(key) {
            return;
        }
        let mut data = self.data.lock().unwrap();
        data.entry(key.clone()).or_insert_with(KeyState::new);
        keys.insert(key.clone());
    }
}
