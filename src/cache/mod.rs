//! Path-addressed metadata and directory-listing cache
//!
//! `PathCache` keeps two maps keyed by canonical path:
//! - entries: backend metadata for a file or directory
//! - children: the ordered child-path list of a directory
//!
//! A path missing from `children` means "listing not fetched yet", which is
//! different from an empty directory (an empty list is present).
//!
//! Both maps are `DashMap`s, so traffic on unrelated paths only contends on
//! shard locks. Moves rewrite keys across both maps and take the structural
//! lock exclusively; adds and removes take it shared and never block each
//! other.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::error::{BridgeError, Result};
use crate::path::CacheKey;

/// In-memory cache of backend entries addressed by canonical path
pub struct PathCache<T> {
    /// Entry metadata keyed by its own path
    entries: DashMap<CacheKey, T>,
    /// Directory path -> direct children, in insertion order
    children: DashMap<CacheKey, Vec<CacheKey>>,
    /// Allow the same child to be registered twice in one listing
    allow_duplicate_names: AtomicBool,
    /// Held exclusively while a move rewrites keys across both maps
    tree: RwLock<()>,
}

impl<T: Clone + PartialEq> PathCache<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            children: DashMap::new(),
            allow_duplicate_names: AtomicBool::new(false),
            tree: RwLock::new(()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let cache = Self::new();
        cache.set_allow_duplicate_names(config.allow_duplicate_names);
        cache
    }

    pub fn allow_duplicate_names(&self) -> bool {
        self.allow_duplicate_names.load(Ordering::Relaxed)
    }

    pub fn set_allow_duplicate_names(&self, allow: bool) {
        self.allow_duplicate_names.store(allow, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Raw accessors
    // -------------------------------------------------------------------------

    pub fn has_file(&self, path: &CacheKey) -> bool {
        self.entries.contains_key(path)
    }

    pub fn get_file(&self, path: &CacheKey) -> Option<T> {
        self.entries.get(path).map(|e| e.value().clone())
    }

    /// Store metadata without touching any directory listing
    pub fn put_file(&self, path: &CacheKey, entry: T) -> Option<T> {
        self.entries.insert(path.clone(), entry)
    }

    pub fn has_directory_listing(&self, path: &CacheKey) -> bool {
        self.children.contains_key(path)
    }

    pub fn get_directory_listing(&self, path: &CacheKey) -> Option<Vec<CacheKey>> {
        self.children.get(path).map(|c| c.value().clone())
    }

    pub fn put_directory_listing(
        &self,
        path: &CacheKey,
        children: Vec<CacheKey>,
    ) -> Option<Vec<CacheKey>> {
        self.children.insert(path.clone(), children)
    }

    /// Store a listing fetched from the backend without losing concurrent creates.
    ///
    /// Any direct child of `path` with cached metadata that is missing from
    /// `children` is appended. Returns the stored listing.
    pub fn merge_directory_listing(
        &self,
        path: &CacheKey,
        children: Vec<CacheKey>,
    ) -> Vec<CacheKey> {
        let _tree = self.tree.read();
        // the listing goes in first so a `link_child` racing with the scan finds it
        self.children.insert(path.clone(), children);
        let cached: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|e| e.key().parent().as_ref() == Some(path))
            .map(|e| e.key().clone())
            .collect();

        let Some(mut listing) = self.children.get_mut(path) else {
            return Vec::new();
        };
        for child in cached {
            if !listing.contains(&child) {
                trace!("cache merge: {} kept in {}", child, path);
                listing.push(child);
            }
        }
        listing.clone()
    }

    /// Number of cached children, `None` if the listing was never cached
    pub fn child_count(&self, path: &CacheKey) -> Option<usize> {
        self.children.get(path).map(|c| c.len())
    }

    // -------------------------------------------------------------------------
    // Structural mutations
    // -------------------------------------------------------------------------

    /// Insert metadata and register `path` in its parent's listing.
    ///
    /// The parent listing is created on demand. An already-listed path is
    /// not listed again unless duplicate names are allowed.
    pub fn add_entry(&self, path: &CacheKey, entry: T) {
        let _tree = self.tree.read();
        self.add_entry_locked(path, entry);
    }

    fn add_entry_locked(&self, path: &CacheKey, entry: T) {
        trace!("cache add: {}", path);
        self.entries.insert(path.clone(), entry);

        let Some(parent) = path.parent() else {
            return;
        };
        let allow_duplicates = self.allow_duplicate_names();
        let mut listing = self.children.entry(parent).or_default();
        if allow_duplicates || !listing.contains(path) {
            listing.push(path.clone());
        }
    }

    /// Register `path` in its parent's listing if that listing is cached.
    ///
    /// Unlike `add_entry` this never creates a partial listing and never
    /// lists a path twice. Returns whether the path is listed afterwards.
    pub fn link_child(&self, path: &CacheKey) -> bool {
        let _tree = self.tree.read();
        let Some(parent) = path.parent() else {
            return false;
        };
        let Some(mut listing) = self.children.get_mut(&parent) else {
            return false;
        };
        if !listing.contains(path) {
            trace!("cache link: {}", path);
            listing.push(path.clone());
        }
        true
    }

    /// Delete metadata and deregister `path` from its parent's listing.
    ///
    /// The parent listing stays present (possibly empty).
    pub fn remove_entry(&self, path: &CacheKey) -> Option<T> {
        let _tree = self.tree.read();
        self.remove_entry_locked(path)
    }

    fn remove_entry_locked(&self, path: &CacheKey) -> Option<T> {
        trace!("cache remove: {}", path);
        let removed = self.entries.remove(path).map(|(_, entry)| entry);

        if let Some(parent) = path.parent() {
            if let Some(mut listing) = self.children.get_mut(&parent) {
                listing.retain(|child| child != path);
            }
        }
        removed
    }

    /// Drop the cached entry and listing of `path` itself.
    ///
    /// The parent listing is left alone; use this to force a refetch.
    pub fn invalidate(&self, path: &CacheKey) {
        let _tree = self.tree.read();
        trace!("cache invalidate: {}", path);
        self.entries.remove(path);
        self.children.remove(path);
    }

    /// Move `source` to `target`, storing `new_entry` as the target metadata.
    ///
    /// A cached subtree under `source` is rebased onto `target`: every
    /// descendant entry and listing is re-keyed and child lists are rewritten,
    /// so nothing under `source` remains afterwards.
    pub fn move_entry(&self, source: &CacheKey, target: &CacheKey, new_entry: T) -> Result<()> {
        if source.is_root() || target.is_descendant_of(source) {
            return Err(BridgeError::StructuralViolation(format!(
                "cannot move {} into {}",
                source, target
            )));
        }

        let _tree = self.tree.write();
        debug!("cache move: {} -> {}", source, target);

        self.remove_entry_locked(source);

        if source != target {
            // Descendant metadata
            let descendants: Vec<CacheKey> = self
                .entries
                .iter()
                .filter(|e| e.key().is_descendant_of(source))
                .map(|e| e.key().clone())
                .collect();
            for old in descendants {
                if let (Some((_, entry)), Some(new)) =
                    (self.entries.remove(&old), old.rebase(source, target))
                {
                    self.entries.insert(new, entry);
                }
            }

            // Listings of the source and everything below it
            let listings: Vec<CacheKey> = self
                .children
                .iter()
                .filter(|c| c.key().starts_with(source))
                .map(|c| c.key().clone())
                .collect();
            // Whatever was cached at the target is replaced by the moved tree
            if !listings.is_empty() {
                self.children.remove(target);
            }
            for old in listings {
                if let (Some((_, list)), Some(new)) =
                    (self.children.remove(&old), old.rebase(source, target))
                {
                    let rebased = list
                        .iter()
                        .map(|child| child.rebase(source, target).unwrap_or_else(|| child.clone()))
                        .collect();
                    self.children.insert(new, rebased);
                }
            }
        }

        self.add_entry_locked(target, new_entry);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reverse lookups
    // -------------------------------------------------------------------------

    /// Find a path whose cached entry equals `entry`
    pub fn find_path(&self, entry: &T) -> Option<CacheKey> {
        self.find_path_by(|candidate| candidate == entry)
    }

    /// Find a path whose cached entry satisfies `predicate`
    pub fn find_path_by<F>(&self, predicate: F) -> Option<CacheKey>
    where
        F: Fn(&T) -> bool,
    {
        self.entries
            .iter()
            .find(|e| predicate(e.value()))
            .map(|e| e.key().clone())
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone + PartialEq> Default for PathCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Backend-consulting entry lookup
///
/// Unlike the raw cache accessors, a lookup may fall through to a live
/// backend call and reports absence as `BridgeError::NotFound`.
#[async_trait]
pub trait EntryLookup<T>: Send + Sync {
    /// Resolve `path` to an entry, failing with `NotFound` if it does not exist
    async fn get_entry(&self, path: &CacheKey) -> Result<T>;

    /// Check if a path exists
    ///
    /// Default implementation uses get_entry()
    async fn exists_entry(&self, path: &CacheKey) -> Result<bool> {
        match self.get_entry(path).await {
            Ok(_) => Ok(true),
            Err(BridgeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
