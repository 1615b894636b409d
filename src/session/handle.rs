//! File handle management
//!
//! The dispatcher refers to open files by numeric handle, while the session
//! works with channels. This module hands out handles and maps them back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::{BridgeError, Result};
use crate::path::CacheKey;
use crate::stream::ByteChannel;

/// First handle number handed out (0 is left unused)
pub const FIRST_HANDLE: u64 = 1;

/// One open file: its path and the channel serving it
pub struct OpenHandle {
    pub path: CacheKey,
    pub writable: bool,
    pub channel: Mutex<Box<dyn ByteChannel>>,
}

/// Maps file handles to open channels
pub struct HandleTable {
    handles: DashMap<u64, Arc<OpenHandle>>,
    /// Next handle number to allocate
    next_handle: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_handle: AtomicU64::new(FIRST_HANDLE),
        }
    }

    /// Register a channel and return its new handle
    pub fn insert(&self, path: CacheKey, writable: bool, channel: Box<dyn ByteChannel>) -> u64 {
        let fh = self.next_handle.fetch_add(1, Ordering::SeqCst);
        trace!("handle {} -> {} (writable: {})", fh, path, writable);
        self.handles.insert(
            fh,
            Arc::new(OpenHandle {
                path,
                writable,
                channel: Mutex::new(channel),
            }),
        );
        fh
    }

    pub fn get(&self, fh: u64) -> Result<Arc<OpenHandle>> {
        self.handles
            .get(&fh)
            .map(|h| Arc::clone(h.value()))
            .ok_or(BridgeError::BadHandle(fh))
    }

    /// Forget a handle; the caller closes the returned channel
    pub fn remove(&self, fh: u64) -> Result<Arc<OpenHandle>> {
        self.handles
            .remove(&fh)
            .map(|(_, h)| h)
            .ok_or(BridgeError::BadHandle(fh))
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Download, ReadChannel};
    use std::io::Cursor;

    fn channel() -> Box<dyn ByteChannel> {
        Box::new(ReadChannel::new(
            Download::forward(Cursor::new(b"abc".to_vec())),
            3,
        ))
    }

    #[test]
    fn test_handles_are_unique_and_increasing() {
        let table = HandleTable::new();
        let a = table.insert(CacheKey::new("/a"), false, channel());
        let b = table.insert(CacheKey::new("/a"), false, channel());
        assert_eq!(a, FIRST_HANDLE);
        assert!(b > a);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_get_and_remove() {
        let table = HandleTable::new();
        let fh = table.insert(CacheKey::new("/a"), true, channel());

        let handle = table.get(fh).unwrap();
        assert_eq!(handle.path, CacheKey::new("/a"));
        assert!(handle.writable);

        table.remove(fh).unwrap();
        assert!(table.is_empty());
        assert!(matches!(table.get(fh), Err(BridgeError::BadHandle(h)) if h == fh));
        assert!(matches!(table.remove(fh), Err(BridgeError::BadHandle(_))));
    }
}
