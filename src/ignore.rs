//! Name filter for OS metadata files
//!
//! Finder and friends probe for `._*` resource forks and `.DS_Store` on every
//! directory they touch. Sending those lookups to a remote backend is pure
//! latency, so matching names are answered locally as "not found".

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};

use crate::config::IgnoreConfig;
use crate::path::CacheKey;

/// AppleDouble and Finder bookkeeping files
pub const APPLE_DOUBLE_PATTERNS: &[&str] = &["._*", ".DS_Store", ".localized", ".hidden"];

/// Matches canonical paths by file name against a set of globs
#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    matcher: Option<GlobSet>,
}

impl NameFilter {
    /// A filter that ignores nothing
    pub fn none() -> Self {
        Self { matcher: None }
    }

    /// Build a filter from glob patterns, skipping invalid ones
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        if patterns.is_empty() {
            return Self::none();
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            match Glob::new(pattern.as_ref()) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(e) => {
                    warn!("Invalid ignore pattern '{}': {}", pattern.as_ref(), e);
                }
            }
        }

        match builder.build() {
            Ok(set) => {
                debug!("Name filter: {} ignore patterns", patterns.len());
                Self { matcher: Some(set) }
            }
            Err(e) => {
                warn!("Failed to build ignore matcher: {}", e);
                Self::none()
            }
        }
    }

    pub fn from_config(config: &IgnoreConfig) -> Self {
        let mut patterns: Vec<String> = Vec::new();
        if config.apple_double {
            patterns.extend(APPLE_DOUBLE_PATTERNS.iter().map(|p| p.to_string()));
        }
        patterns.extend(config.patterns.iter().cloned());
        Self::new(&patterns)
    }

    /// Whether the last component of `path` matches an ignore pattern
    pub fn is_ignored(&self, path: &CacheKey) -> bool {
        match (&self.matcher, path.file_name()) {
            (Some(matcher), Some(name)) => matcher.is_match(name),
            _ => false,
        }
    }
}
