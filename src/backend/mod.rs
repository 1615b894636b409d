pub mod memory;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;
use crate::path::CacheKey;
use crate::stream::{Download, UploadBody};

/// File type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
}

/// The few facts the session needs from an otherwise opaque backend entry
pub trait EntryMeta {
    fn file_type(&self) -> FileType;

    /// Byte length for files, 0 for directories
    fn size(&self) -> u64;

    fn is_dir(&self) -> bool {
        matches!(self.file_type(), FileType::Directory)
    }

    fn is_file(&self) -> bool {
        matches!(self.file_type(), FileType::File)
    }
}

/// Stream of `(child name, entry)` pairs for one directory
pub type EntryStream<T> = Pin<Box<dyn Stream<Item = Result<(String, T)>> + Send>>;

/// Storage backend integrated behind a [`Session`](crate::session::Session)
///
/// Backends are path-based and hold no cache of their own. Retries,
/// timeouts and authentication belong to the implementation.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Entry: Clone + PartialEq + EntryMeta + Send + Sync + 'static;

    /// Get the entry for a path, `NotFound` if absent
    async fn get_entry(&self, path: &CacheKey) -> Result<Self::Entry>;

    /// List the direct children of a directory
    fn list(&self, path: &CacheKey) -> EntryStream<Self::Entry>;

    /// Open a download stream for a file
    async fn download(&self, path: &CacheKey, entry: &Self::Entry) -> Result<Download>;

    /// Store `body` at `path`, reading it until end of stream
    ///
    /// A body read error means the writer gave up; nothing must be committed.
    async fn upload(&self, path: &CacheKey, body: UploadBody) -> Result<Self::Entry>;

    /// Create (or replace with) a zero-length file
    async fn create_empty(&self, path: &CacheKey) -> Result<Self::Entry>;

    async fn create_dir(&self, path: &CacheKey) -> Result<Self::Entry>;

    async fn remove(&self, path: &CacheKey, entry: &Self::Entry) -> Result<()>;

    /// Move `entry` from `source` to `target`, returning the entry now at `target`
    async fn rename(
        &self,
        source: &CacheKey,
        entry: &Self::Entry,
        target: &CacheKey,
    ) -> Result<Self::Entry>;

    /// In-progress entry reported for a path while its first upload runs
    fn placeholder(&self, path: &CacheKey) -> Self::Entry;
}
