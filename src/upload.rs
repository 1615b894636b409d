//! In-flight upload tracking
//!
//! A path is registered here from the moment a write handle is opened until
//! its backend commit has finished (successfully or not). Metadata and read
//! paths consult the monitor before trusting the cache.

use dashmap::DashMap;
use tracing::trace;

use crate::path::CacheKey;

/// Set of paths with uncommitted writes, each with an in-progress entry
pub struct UploadMonitor<T> {
    uploading: DashMap<CacheKey, T>,
}

impl<T: Clone> UploadMonitor<T> {
    pub fn new() -> Self {
        Self {
            uploading: DashMap::new(),
        }
    }

    /// Register a write to `path`. A concurrent start on the same path
    /// replaces the in-progress entry; the previous one is returned.
    pub fn start(&self, path: &CacheKey, entry: T) -> Option<T> {
        trace!("upload start: {}", path);
        self.uploading.insert(path.clone(), entry)
    }

    /// Register a write unless one is already in flight.
    ///
    /// Returns `false` (and leaves the existing registration alone) if
    /// `path` is already uploading.
    pub fn try_start(&self, path: &CacheKey, entry: T) -> bool {
        match self.uploading.entry(path.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                trace!("upload start: {}", path);
                vacant.insert(entry);
                true
            }
        }
    }

    /// Clear the flag for `path`; a no-op if it was never started
    pub fn finish(&self, path: &CacheKey) -> Option<T> {
        trace!("upload finish: {}", path);
        self.uploading.remove(path).map(|(_, entry)| entry)
    }

    pub fn is_uploading(&self, path: &CacheKey) -> bool {
        self.uploading.contains_key(path)
    }

    /// Whether any path strictly below `dir` is uploading
    pub fn any_under(&self, dir: &CacheKey) -> bool {
        self.uploading.iter().any(|e| e.key().is_descendant_of(dir))
    }

    pub fn pending_entry(&self, path: &CacheKey) -> Option<T> {
        self.uploading.get(path).map(|e| e.value().clone())
    }

    /// Number of in-flight uploads
    pub fn len(&self) -> usize {
        self.uploading.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uploading.is_empty()
    }
}

impl<T: Clone> Default for UploadMonitor<T> {
    fn default() -> Self {
        Self::new()
    }
}
