pub mod handle;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use scopeguard::ScopeGuard;
use tracing::{debug, info, trace, warn};

use crate::backend::{Backend, EntryMeta};
use crate::cache::{EntryLookup, PathCache};
use crate::config::{Config, UploadMode};
use crate::error::{BridgeError, Result};
use crate::ignore::NameFilter;
use crate::path::CacheKey;
use crate::stream::{
    BufferedUpload, ByteChannel, ReadChannel, StealingUpload, UploadBody, Uploader, WriteChannel,
};
use crate::upload::UploadMonitor;

use self::handle::HandleTable;

/// One mounted filesystem's view of a backend
///
/// Owns the path cache, the upload monitor and the open file handles.
/// Operations are async; a synchronous dispatcher drives them with
/// `Runtime::block_on`.
pub struct Session<B: Backend> {
    backend: Arc<B>,
    cache: Arc<PathCache<B::Entry>>,
    uploads: Arc<UploadMonitor<B::Entry>>,
    handles: HandleTable,
    filter: NameFilter,
    /// Pipe buffer size for upload bridges
    pipe_capacity: usize,
    upload_mode: UploadMode,
}

impl<B: Backend> Session<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self::from_config(backend, &Config::default())
    }

    pub fn from_config(backend: Arc<B>, config: &Config) -> Self {
        Self {
            backend,
            cache: Arc::new(PathCache::from_config(&config.cache)),
            uploads: Arc::new(UploadMonitor::new()),
            handles: HandleTable::new(),
            filter: NameFilter::from_config(&config.ignore),
            pipe_capacity: config.upload.pipe_capacity,
            upload_mode: config.upload.mode,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn cache(&self) -> &Arc<PathCache<B::Entry>> {
        &self.cache
    }

    pub fn uploads(&self) -> &Arc<UploadMonitor<B::Entry>> {
        &self.uploads
    }

    /// Number of open file handles
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Resolve a path: ignore list, in-flight upload, cache, then backend
    pub async fn get_entry(&self, path: &CacheKey) -> Result<B::Entry> {
        if self.filter.is_ignored(path) {
            trace!("get_entry: ignored {}", path);
            return Err(BridgeError::NotFound(path.to_string()));
        }
        if let Some(pending) = self.uploads.pending_entry(path) {
            trace!("get_entry: {} is uploading", path);
            return Ok(pending);
        }
        if let Some(entry) = self.cache.get_file(path) {
            return Ok(entry);
        }

        let entry = self.backend.get_entry(path).await?;
        self.cache.put_file(path, entry.clone());
        Ok(entry)
    }

    /// List a directory as `(name, entry)` pairs in listing order
    pub async fn read_dir(&self, path: &CacheKey) -> Result<Vec<(String, B::Entry)>> {
        let dir = self.get_entry(path).await?;
        if !dir.is_dir() {
            return Err(BridgeError::NotADirectory(path.to_string()));
        }

        let children = match self.cache.get_directory_listing(path) {
            Some(children) => children,
            None => self.fetch_listing(path).await?,
        };

        let mut listing = Vec::with_capacity(children.len());
        for child in children {
            if self.filter.is_ignored(&child) {
                continue;
            }
            let Some(name) = child.file_name() else {
                continue;
            };
            let entry = match self.cache.get_file(&child) {
                Some(entry) => entry,
                None => match self.get_entry(&child).await {
                    Ok(entry) => entry,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                },
            };
            listing.push((name.to_string(), entry));
        }
        Ok(listing)
    }

    async fn fetch_listing(&self, path: &CacheKey) -> Result<Vec<CacheKey>> {
        debug!("read_dir: fetching listing of {}", path);
        let mut stream = self.backend.list(path);
        let mut children = Vec::new();
        while let Some((name, entry)) = stream.try_next().await? {
            let child = path.join(&name);
            self.cache.put_file(&child, entry);
            children.push(child);
        }
        // a commit may have landed under `path` while the listing streamed in
        Ok(self.cache.merge_directory_listing(path, children))
    }

    /// Open a file for reading and return its handle
    pub async fn open_read(&self, path: &CacheKey) -> Result<u64> {
        if self.uploads.is_uploading(path) {
            debug!("open_read: {} has an upload in flight", path);
            return Err(BridgeError::Busy(path.to_string()));
        }
        let entry = self.get_entry(path).await?;
        if entry.is_dir() {
            return Err(BridgeError::IsADirectory(path.to_string()));
        }

        let download = self.backend.download(path, &entry).await?;
        let closed_path = path.clone();
        let channel = ReadChannel::new(download, entry.size()).with_close_hook(move |read| {
            trace!("read handle on {} closed after {} bytes", closed_path, read);
        });
        let fh = self.handles.insert(path.clone(), false, Box::new(channel));
        debug!("open_read: {} -> fh {}", path, fh);
        Ok(fh)
    }

    /// Open a file for writing, replacing its contents on release
    pub async fn open_write(&self, path: &CacheKey) -> Result<u64> {
        if path.is_root() {
            return Err(BridgeError::IsADirectory(path.to_string()));
        }
        if self.filter.is_ignored(path) {
            return Err(BridgeError::InvalidArgument(format!(
                "{} matches the ignore list",
                path
            )));
        }

        let previous = match self.get_entry(path).await {
            Ok(entry) if entry.is_dir() => {
                return Err(BridgeError::IsADirectory(path.to_string()))
            }
            Ok(entry) => Some(entry),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let pending = previous.unwrap_or_else(|| self.backend.placeholder(path));
        if !self.uploads.try_start(path, pending) {
            debug!("open_write: {} already has a writer", path);
            return Err(BridgeError::Busy(path.to_string()));
        }
        let registered = scopeguard::guard((), |_| {
            self.uploads.finish(path);
        });

        let parent = path
            .parent()
            .ok_or_else(|| BridgeError::InvalidArgument(path.to_string()))?;
        if !self.get_entry(&parent).await?.is_dir() {
            return Err(BridgeError::NotADirectory(parent.to_string()));
        }

        let hook = CommitHook {
            path: path.clone(),
            backend: Arc::clone(&self.backend),
            cache: Arc::clone(&self.cache),
            uploads: Arc::clone(&self.uploads),
        };
        let hook = Arc::new(hook);
        let channel: Box<dyn ByteChannel> = match self.upload_mode {
            UploadMode::Stealing => Box::new(WriteChannel::new(StealingUpload::new(
                hook,
                self.pipe_capacity,
            ))),
            UploadMode::Buffered => Box::new(WriteChannel::new(BufferedUpload::new(hook))),
        };
        let fh = self.handles.insert(path.clone(), true, channel);
        ScopeGuard::into_inner(registered);

        debug!("open_write: {} -> fh {}", path, fh);
        Ok(fh)
    }

    /// Read up to `size` bytes at `offset`; shorter only at end of file
    pub async fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Bytes> {
        let handle = self.handles.get(fh)?;
        let mut channel = handle.channel.lock().await;

        if channel.position().await? != offset {
            channel.set_position(offset).await?;
            let reached = channel.position().await?;
            if reached < offset && reached >= channel.size() {
                trace!("read: fh {} offset {} is past end of file", fh, offset);
                return Ok(Bytes::new());
            }
            if reached != offset {
                return Err(BridgeError::InvalidArgument(format!(
                    "{}: offset {} unreachable on forward-only stream (at {})",
                    handle.path, offset, reached
                )));
            }
        }

        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = channel.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        trace!("read: fh {} {} bytes at {}", fh, filled, offset);
        Ok(Bytes::from(buf))
    }

    /// Write `data` at `offset`, returning the number of bytes accepted
    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let handle = self.handles.get(fh)?;
        if !handle.writable {
            return Err(BridgeError::NotWritable);
        }
        let mut channel = handle.channel.lock().await;

        if channel.position().await? != offset {
            channel.set_position(offset).await?;
        }
        let mut written = 0;
        while written < data.len() {
            written += channel.write(&data[written..]).await?;
        }
        trace!("write: fh {} {} bytes at {}", fh, written, offset);
        Ok(written)
    }

    /// Shrink the logical size of an open file
    pub async fn truncate(&self, fh: u64, size: u64) -> Result<()> {
        let handle = self.handles.get(fh)?;
        let mut channel = handle.channel.lock().await;
        channel.truncate(size).await
    }

    /// Logical size of an open file
    pub async fn handle_size(&self, fh: u64) -> Result<u64> {
        let handle = self.handles.get(fh)?;
        let channel = handle.channel.lock().await;
        Ok(channel.size())
    }

    /// Close a handle. For a write handle this waits for the backend commit
    /// and the cache update.
    pub async fn release(&self, fh: u64) -> Result<()> {
        let handle = self.handles.remove(fh)?;
        let mut channel = handle.channel.lock().await;
        debug!("release: fh {} ({})", fh, handle.path);
        channel.close().await
    }

    pub async fn mkdir(&self, path: &CacheKey) -> Result<B::Entry> {
        if self.filter.is_ignored(path) {
            return Err(BridgeError::InvalidArgument(format!(
                "{} matches the ignore list",
                path
            )));
        }
        let entry = self.backend.create_dir(path).await?;
        record_entry(&self.cache, path, entry.clone());
        self.cache.put_directory_listing(path, Vec::new());
        debug!("mkdir: {}", path);
        Ok(entry)
    }

    /// Remove a file or an empty directory
    pub async fn remove(&self, path: &CacheKey) -> Result<()> {
        if path.is_root() {
            return Err(BridgeError::InvalidArgument(path.to_string()));
        }
        if self.uploads.is_uploading(path) || self.uploads.any_under(path) {
            return Err(BridgeError::Busy(path.to_string()));
        }

        let entry = self.get_entry(path).await?;
        if entry.is_dir() && self.cache.child_count(path).is_some_and(|count| count > 0) {
            return Err(BridgeError::NotEmpty(path.to_string()));
        }

        self.backend.remove(path, &entry).await?;
        self.cache.remove_entry(path);
        if entry.is_dir() {
            self.cache.invalidate(path);
        }
        debug!("remove: {}", path);
        Ok(())
    }

    /// Move a file or directory; a cached subtree is rebased, not dropped
    pub async fn rename(&self, source: &CacheKey, target: &CacheKey) -> Result<()> {
        if source == target {
            return Ok(());
        }
        if source.is_root() || target.is_root() {
            return Err(BridgeError::InvalidArgument(format!(
                "cannot rename {} to {}",
                source, target
            )));
        }
        if target.is_descendant_of(source) {
            return Err(BridgeError::InvalidArgument(format!(
                "cannot move {} into its own subtree {}",
                source, target
            )));
        }
        if self.filter.is_ignored(target) {
            return Err(BridgeError::InvalidArgument(format!(
                "{} matches the ignore list",
                target
            )));
        }
        for busy in [source, target] {
            if self.uploads.is_uploading(busy) || self.uploads.any_under(busy) {
                debug!("rename: {} has an upload in flight", busy);
                return Err(BridgeError::Busy(busy.to_string()));
            }
        }

        let entry = self.get_entry(source).await?;
        // the move registers `target` in its parent listing; make sure that
        // listing is complete first
        if let Some(parent) = target.parent() {
            if !self.cache.has_directory_listing(&parent) {
                self.read_dir(&parent).await?;
            }
        }

        let moved = self.backend.rename(source, &entry, target).await?;
        self.cache.move_entry(source, target, moved)?;
        debug!("rename: {} -> {}", source, target);
        Ok(())
    }
}

#[async_trait]
impl<B: Backend> EntryLookup<B::Entry> for Session<B> {
    async fn get_entry(&self, path: &CacheKey) -> Result<B::Entry> {
        Session::get_entry(self, path).await
    }
}

/// Store a freshly created entry without inventing a partial parent listing
///
/// The entry goes in before the listing link; `merge_directory_listing`
/// relies on that order to pick up creates that raced a fetch.
fn record_entry<T: Clone + PartialEq>(cache: &PathCache<T>, path: &CacheKey, entry: T) {
    cache.put_file(path, entry);
    cache.link_child(path);
}

/// Uploader behind every write handle: commits through the backend, then
/// updates the cache and clears the in-flight flag
struct CommitHook<B: Backend> {
    path: CacheKey,
    backend: Arc<B>,
    cache: Arc<PathCache<B::Entry>>,
    uploads: Arc<UploadMonitor<B::Entry>>,
}

#[async_trait]
impl<B: Backend> Uploader for CommitHook<B> {
    type Entry = B::Entry;

    async fn upload(&self, body: UploadBody) -> Result<B::Entry> {
        self.backend.upload(&self.path, body).await
    }

    async fn upload_empty(&self) -> Result<B::Entry> {
        self.backend.create_empty(&self.path).await
    }

    fn on_complete(&self, entry: B::Entry) {
        info!("commit: {} ({} bytes)", self.path, entry.size());
        record_entry(&self.cache, &self.path, entry);
        self.uploads.finish(&self.path);
    }

    fn on_failure(&self, err: &BridgeError) {
        warn!("upload of {} failed, keeping previous metadata: {}", self.path, err);
        self.uploads.finish(&self.path);
    }
}
