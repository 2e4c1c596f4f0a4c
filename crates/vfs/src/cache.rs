//! Weakly held archivers, keyed by system path.
//!
//! The cache never keeps an archiver alive; whoever holds a node or handle
//! does. Keys whose archiver has gone are swept once the map grows past the
//! configured threshold, or on demand.

use quire_archive::{Archiver, ArchiverHandle};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};

#[derive(Debug)]
pub struct ArchiverCache {
    entries: Mutex<HashMap<String, Weak<Archiver>>>,
    threshold: usize,
}

impl ArchiverCache {
    pub fn new(threshold: usize) -> Self {
        Self { entries: Mutex::new(HashMap::new()), threshold }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Weak<Archiver>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live archiver for `key`, if one is still referenced somewhere.
    pub fn get(&self, key: &str) -> Option<ArchiverHandle> {
        let mut entries = self.lock();
        if entries.len() > self.threshold {
            compact_locked(&mut entries);
        }
        entries.get(key).and_then(Weak::upgrade)
    }

    pub fn insert(&self, key: impl Into<String>, archiver: &ArchiverHandle) {
        let key = key.into();
        tracing::trace!(key = %key, id = archiver.id(), "archiver cached");
        self.lock().insert(key, ArchiverHandle::downgrade(archiver));
    }

    pub fn remove(&self, key: &str) -> Option<ArchiverHandle> {
        self.lock().remove(key).and_then(|weak| weak.upgrade())
    }

    /// Drop every key whose archiver is gone. Returns how many were removed.
    pub fn compact(&self) -> usize {
        compact_locked(&mut self.lock())
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Keys held, dead or alive.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Archivers that are still alive.
    pub fn live(&self) -> Vec<ArchiverHandle> {
        self.lock().values().filter_map(Weak::upgrade).collect()
    }
}

fn compact_locked(entries: &mut HashMap<String, Weak<Archiver>>) -> usize {
    let before = entries.len();
    entries.retain(|_, weak| weak.strong_count() > 0);
    let removed = before - entries.len();
    if removed > 0 {
        tracing::debug!(removed, remaining = entries.len(), "archiver cache compacted");
    }
    removed
}
