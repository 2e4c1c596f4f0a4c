//! Recently materialized temp files, keyed by entry ident.
//!
//! Least recently used files are evicted first. An evicted file is deleted
//! once nobody else (usually an archiver built on it) holds it. Each file
//! remembers the [`SourceStamp`] it was made from; a lookup with a
//! different stamp drops it.

use quire_archive::{EntryNode, TempFile};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Length and modification time of an entry and of every container above
/// it, innermost first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStamp(Vec<(i64, Option<i128>)>);

impl SourceStamp {
    pub fn of(node: &EntryNode) -> Self {
        let entry = node.entry();
        let mut parts = vec![(entry.length(), entry.modified().map(|t| t.unix_timestamp_nanos()))];
        let mut archiver = Some(node.archiver());
        while let Some(current) = archiver {
            parts.push((current.length(), current.modified().map(|t| t.unix_timestamp_nanos())));
            archiver = current.parent();
        }
        Self(parts)
    }
}

struct Cached {
    ident: String,
    stamp: SourceStamp,
    file: Arc<TempFile>,
}

pub struct TempFileCache {
    // Most recently used at the back.
    files: Mutex<VecDeque<Cached>>,
    capacity: usize,
}

impl TempFileCache {
    pub fn new(capacity: usize) -> Self {
        Self { files: Mutex::new(VecDeque::with_capacity(capacity)), capacity }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Cached>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, ident: &str, stamp: &SourceStamp) -> Option<Arc<TempFile>> {
        let mut files = self.lock();
        let index = files.iter().position(|cached| cached.ident == ident)?;
        let hit = files.remove(index)?;
        if hit.stamp != *stamp {
            tracing::debug!(ident, "temp file made from an older source dropped");
            return None;
        }
        let file = Arc::clone(&hit.file);
        files.push_back(hit);
        Some(file)
    }

    pub fn insert(&self, ident: impl Into<String>, stamp: SourceStamp, file: Arc<TempFile>) {
        let ident = ident.into();
        let mut files = self.lock();
        files.retain(|cached| cached.ident != ident);
        files.push_back(Cached { ident, stamp, file });
        while files.len() > self.capacity {
            if let Some(evicted) = files.pop_front() {
                tracing::trace!(ident = %evicted.ident, "temp file evicted");
            }
        }
    }

    pub fn remove(&self, ident: &str) -> Option<Arc<TempFile>> {
        let mut files = self.lock();
        let index = files.iter().position(|cached| cached.ident == ident)?;
        files.remove(index).map(|cached| cached.file)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TempFileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempFileCache").field("len", &self.len()).field("capacity", &self.capacity).finish()
    }
}
