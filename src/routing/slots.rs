//! Per-key state with one lock per entry
//!
//! The map lock is only held to look up or insert an entry, so updates for
//! different agents never serialise on a shared mutex.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) struct SlotMap<T> {
    slots: RwLock<HashMap<String, Arc<Mutex<T>>>>,
}

impl<T> Default for SlotMap<T> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> SlotMap<T> {
    pub(crate) fn get(&self, key: &str) -> Option<Arc<Mutex<T>>> {
        self.slots.read().get(key).cloned()
    }

    pub(crate) fn get_or_insert_with<F>(&self, key: &str, init: F) -> Arc<Mutex<T>>
    where
        F: FnOnce() -> T,
    {
        if let Some(slot) = self.get(key) {
            return slot;
        }
        let mut slots = self.slots.write();
        Arc::clone(
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(init()))),
        )
    }

    pub(crate) fn values(&self) -> Vec<Arc<Mutex<T>>> {
        self.slots.read().values().cloned().collect()
    }

    pub(crate) fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.slots.write().retain(|key, _| keep(key));
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.read().len()
    }
}

impl<T> std::fmt::Debug for SlotMap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotMap").field("len", &self.len()).finish()
    }
}
