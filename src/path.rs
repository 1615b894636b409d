//! Canonical cache keys
//!
//! Kernel-supplied paths and backend listings may spell the same name in
//! different Unicode normal forms (macOS hands out NFD, most backends store
//! NFC). Every path is folded to an absolute, NFC-normalized string before it
//! is used as a key, so visually identical names always hit the same entry.

use std::fmt;
use std::path::{Path, PathBuf};

use unicode_normalization::{is_nfc_quick, IsNormalized, UnicodeNormalization};

/// Canonicalized absolute path used as a cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Canonicalize a path string.
    ///
    /// Relative paths are taken relative to `/`, empty and `.` components are
    /// dropped, `..` pops a component (never above the root), and the result
    /// is NFC-normalized. Canonicalizing a canonical key yields the same key.
    pub fn new(path: impl AsRef<str>) -> Self {
        let normalized = normalize_nfc(path.as_ref());

        let mut components: Vec<&str> = Vec::new();
        for component in normalized.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    components.pop();
                }
                name => components.push(name),
            }
        }

        let mut key = String::with_capacity(normalized.len() + 1);
        for component in &components {
            key.push('/');
            key.push_str(component);
        }
        if key.is_empty() {
            key.push('/');
        }
        Self(key)
    }

    /// The root directory key (`/`)
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Canonicalize a filesystem path (lossy for non-UTF-8 names)
    pub fn from_path(path: &Path) -> Self {
        Self::new(path.to_string_lossy())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Parent directory key, `None` for the root
    pub fn parent(&self) -> Option<CacheKey> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Last path component, `None` for the root
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit('/').next()
    }

    /// Append a child name (which may itself contain separators)
    pub fn join(&self, name: &str) -> CacheKey {
        Self::new(format!("{}/{}", self.0, name))
    }

    /// Component-wise prefix test; a key starts with itself
    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        if prefix.is_root() || self.0 == prefix.0 {
            return true;
        }
        self.0.len() > prefix.0.len()
            && self.0.starts_with(&prefix.0)
            && self.0.as_bytes()[prefix.0.len()] == b'/'
    }

    /// Whether this key lies strictly below `ancestor`
    pub fn is_descendant_of(&self, ancestor: &CacheKey) -> bool {
        self != ancestor && self.starts_with(ancestor)
    }

    /// Replace the `from` prefix with `to`.
    ///
    /// Returns `None` when this key is not `from` or one of its descendants.
    pub fn rebase(&self, from: &CacheKey, to: &CacheKey) -> Option<CacheKey> {
        if !self.starts_with(from) {
            return None;
        }
        if self == from {
            return Some(to.clone());
        }

        // `rest` keeps its leading separator: "/y/z"
        let rest = if from.is_root() {
            &self.0[..]
        } else {
            &self.0[from.0.len()..]
        };

        if to.is_root() {
            Some(Self(rest.to_string()))
        } else {
            Some(Self(format!("{}{}", to.0, rest)))
        }
    }

    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(&self.0)
    }
}

/// NFC-normalize a single string (file names, listing entries)
pub fn normalize_nfc(s: &str) -> String {
    match is_nfc_quick(s.chars()) {
        IsNormalized::Yes => s.to_string(),
        _ => s.nfc().collect(),
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&Path> for CacheKey {
    fn from(path: &Path) -> Self {
        Self::from_path(path)
    }
}
