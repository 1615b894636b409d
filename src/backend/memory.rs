//! In-process backend holding every file in memory
//!
//! Serves as the reference [`Backend`] for tests and as a template for real
//! integrations. Downloads are forward-only unless constructed with
//! [`MemoryBackend::seekable`].

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

use crate::backend::{Backend, EntryMeta, EntryStream, FileType};
use crate::error::{BridgeError, Result};
use crate::path::CacheKey;
use crate::stream::{Download, UploadBody};

/// Entry record handed out by [`MemoryBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    /// Unique per stored version; 0 for placeholders
    pub id: u64,
    pub kind: FileType,
    pub size: u64,
}

impl EntryMeta for MemoryEntry {
    fn file_type(&self) -> FileType {
        self.kind
    }

    fn size(&self) -> u64 {
        self.size
    }
}

type Nodes = BTreeMap<CacheKey, (MemoryEntry, Bytes)>;

pub struct MemoryBackend {
    nodes: Arc<RwLock<Nodes>>,
    next_id: AtomicU64,
    seekable: bool,
    fail_uploads: AtomicBool,
}

impl MemoryBackend {
    /// Empty backend with only the root directory
    pub fn new() -> Self {
        let root = MemoryEntry {
            id: 1,
            kind: FileType::Directory,
            size: 0,
        };
        let mut nodes = BTreeMap::new();
        nodes.insert(CacheKey::root(), (root, Bytes::new()));

        Self {
            nodes: Arc::new(RwLock::new(nodes)),
            next_id: AtomicU64::new(2),
            seekable: false,
            fail_uploads: AtomicBool::new(false),
        }
    }

    /// Backend whose downloads support random access
    pub fn seekable() -> Self {
        Self {
            seekable: true,
            ..Self::new()
        }
    }

    /// Make every following upload fail after its body was consumed
    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Store a file directly, creating missing parent directories
    pub fn insert_file(&self, path: impl AsRef<str>, contents: impl Into<Bytes>) -> MemoryEntry {
        let path = CacheKey::new(path);
        let mut nodes = self.nodes.write();
        let mut ancestors = Vec::new();
        let mut parent = path.parent();
        while let Some(dir) = parent {
            parent = dir.parent();
            ancestors.push(dir);
        }
        for dir in ancestors.into_iter().rev() {
            if !nodes.contains_key(&dir) {
                let entry = self.new_entry(FileType::Directory, 0);
                nodes.insert(dir, (entry, Bytes::new()));
            }
        }

        let contents = contents.into();
        let entry = self.new_entry(FileType::File, contents.len() as u64);
        nodes.insert(path, (entry.clone(), contents));
        entry
    }

    /// Stored bytes of a file, `None` if absent
    pub fn contents(&self, path: impl AsRef<str>) -> Option<Bytes> {
        let path = CacheKey::new(path);
        self.nodes
            .read()
            .get(&path)
            .filter(|(entry, _)| entry.is_file())
            .map(|(_, data)| data.clone())
    }

    pub fn exists(&self, path: impl AsRef<str>) -> bool {
        self.nodes.read().contains_key(&CacheKey::new(path))
    }

    fn new_entry(&self, kind: FileType, size: u64) -> MemoryEntry {
        MemoryEntry {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            kind,
            size,
        }
    }

    fn check_parent(nodes: &Nodes, path: &CacheKey) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| BridgeError::InvalidArgument(path.to_string()))?;
        match nodes.get(&parent) {
            Some((entry, _)) if entry.is_dir() => Ok(()),
            Some(_) => Err(BridgeError::NotADirectory(parent.to_string())),
            None => Err(BridgeError::NotFound(parent.to_string())),
        }
    }

    fn store(&self, path: &CacheKey, contents: Bytes) -> Result<MemoryEntry> {
        let mut nodes = self.nodes.write();
        Self::check_parent(&nodes, path)?;
        if let Some((existing, _)) = nodes.get(path) {
            if existing.is_dir() {
                return Err(BridgeError::IsADirectory(path.to_string()));
            }
        }
        let entry = self.new_entry(FileType::File, contents.len() as u64);
        nodes.insert(path.clone(), (entry.clone(), contents));
        Ok(entry)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn list_children(nodes: &RwLock<Nodes>, dir: &CacheKey) -> Result<Vec<(String, MemoryEntry)>> {
    let nodes = nodes.read();
    match nodes.get(dir) {
        Some((entry, _)) if entry.is_dir() => {}
        Some(_) => return Err(BridgeError::NotADirectory(dir.to_string())),
        None => return Err(BridgeError::NotFound(dir.to_string())),
    }

    Ok(nodes
        .iter()
        .filter(|(key, _)| key.parent().as_ref() == Some(dir))
        .filter_map(|(key, (entry, _))| {
            key.file_name()
                .map(|name| (name.to_string(), entry.clone()))
        })
        .collect())
}

#[async_trait]
impl Backend for MemoryBackend {
    type Entry = MemoryEntry;

    async fn get_entry(&self, path: &CacheKey) -> Result<MemoryEntry> {
        trace!("memory backend: get_entry {}", path);
        self.nodes
            .read()
            .get(path)
            .map(|(entry, _)| entry.clone())
            .ok_or_else(|| BridgeError::NotFound(path.to_string()))
    }

    fn list(&self, path: &CacheKey) -> EntryStream<MemoryEntry> {
        trace!("memory backend: list {}", path);
        let nodes = Arc::clone(&self.nodes);
        let dir = path.clone();

        Box::pin(try_stream! {
            let children = list_children(&nodes, &dir)?;
            for child in children {
                yield child;
            }
        })
    }

    async fn download(&self, path: &CacheKey, _entry: &MemoryEntry) -> Result<Download> {
        let data = {
            let nodes = self.nodes.read();
            match nodes.get(path) {
                Some((entry, _)) if entry.is_dir() => {
                    return Err(BridgeError::IsADirectory(path.to_string()))
                }
                Some((_, data)) => data.clone(),
                None => return Err(BridgeError::NotFound(path.to_string())),
            }
        };

        let reader = Cursor::new(data);
        if self.seekable {
            Ok(Download::seekable(reader))
        } else {
            Ok(Download::forward(reader))
        }
    }

    async fn upload(&self, path: &CacheKey, mut body: UploadBody) -> Result<MemoryEntry> {
        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;

        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(BridgeError::Backend(format!(
                "memory backend: upload of {} rejected",
                path
            )));
        }

        debug!("memory backend: upload {} ({} bytes)", path, data.len());
        self.store(path, Bytes::from(data))
    }

    async fn create_empty(&self, path: &CacheKey) -> Result<MemoryEntry> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(BridgeError::Backend(format!(
                "memory backend: create of {} rejected",
                path
            )));
        }
        debug!("memory backend: create empty {}", path);
        self.store(path, Bytes::new())
    }

    async fn create_dir(&self, path: &CacheKey) -> Result<MemoryEntry> {
        let mut nodes = self.nodes.write();
        Self::check_parent(&nodes, path)?;
        if nodes.contains_key(path) {
            return Err(BridgeError::AlreadyExists(path.to_string()));
        }
        let entry = self.new_entry(FileType::Directory, 0);
        nodes.insert(path.clone(), (entry.clone(), Bytes::new()));
        debug!("memory backend: mkdir {}", path);
        Ok(entry)
    }

    async fn remove(&self, path: &CacheKey, _entry: &MemoryEntry) -> Result<()> {
        if path.is_root() {
            return Err(BridgeError::InvalidArgument(path.to_string()));
        }
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(path) {
            return Err(BridgeError::NotFound(path.to_string()));
        }
        if nodes.keys().any(|key| key.is_descendant_of(path)) {
            return Err(BridgeError::NotEmpty(path.to_string()));
        }
        nodes.remove(path);
        debug!("memory backend: remove {}", path);
        Ok(())
    }

    async fn rename(
        &self,
        source: &CacheKey,
        _entry: &MemoryEntry,
        target: &CacheKey,
    ) -> Result<MemoryEntry> {
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(source) {
            return Err(BridgeError::NotFound(source.to_string()));
        }
        if target.starts_with(source) {
            return Err(BridgeError::InvalidArgument(format!(
                "cannot move {} into {}",
                source, target
            )));
        }
        Self::check_parent(&nodes, target)?;
        if nodes.keys().any(|key| key.is_descendant_of(target)) {
            return Err(BridgeError::NotEmpty(target.to_string()));
        }

        let moved: Vec<CacheKey> = nodes
            .keys()
            .filter(|key| key.starts_with(source))
            .cloned()
            .collect();
        for key in moved {
            if let (Some(node), Some(rebased)) = (nodes.remove(&key), key.rebase(source, target)) {
                nodes.insert(rebased, node);
            }
        }
        debug!("memory backend: rename {} -> {}", source, target);

        nodes
            .get(target)
            .map(|(entry, _)| entry.clone())
            .ok_or_else(|| BridgeError::NotFound(target.to_string()))
    }

    fn placeholder(&self, _path: &CacheKey) -> MemoryEntry {
        MemoryEntry {
            id: 0,
            kind: FileType::File,
            size: 0,
        }
    }
}
