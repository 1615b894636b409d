use std::io;
use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for fuse-bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A write to this path has not been committed to the backend yet
    #[error("Upload in progress: {0}")]
    Busy(String),

    #[error("Channel is not readable")]
    NotReadable,

    #[error("Channel is not writable")]
    NotWritable,

    #[error("Channel is closed")]
    Closed,

    #[error("Bad file handle: {0}")]
    BadHandle(u64),

    #[error("Upload failed: {0}")]
    Upload(String),

    /// An internal invariant would be broken; indicates a caller bug
    #[error("Structural violation: {0}")]
    StructuralViolation(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// Convert error to libc errno for FUSE responses
    pub fn to_errno(&self) -> i32 {
        match self {
            BridgeError::NotFound(_) => libc::ENOENT,
            BridgeError::AlreadyExists(_) => libc::EEXIST,
            BridgeError::NotADirectory(_) => libc::ENOTDIR,
            BridgeError::IsADirectory(_) => libc::EISDIR,
            BridgeError::NotEmpty(_) => libc::ENOTEMPTY,
            BridgeError::InvalidArgument(_) => libc::EINVAL,
            BridgeError::Busy(_) => libc::EBUSY,
            BridgeError::NotReadable | BridgeError::NotWritable => libc::EBADF,
            BridgeError::Closed | BridgeError::BadHandle(_) => libc::EBADF,
            BridgeError::Upload(_) => libc::EIO,
            BridgeError::StructuralViolation(_) => libc::EIO,
            BridgeError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            BridgeError::Backend(_) => libc::EIO,
            BridgeError::Config(_) => libc::EINVAL,
        }
    }

    /// Whether this error means "the path does not exist"
    pub fn is_not_found(&self) -> bool {
        matches!(self, BridgeError::NotFound(_))
    }
}

/// Result type alias for fuse-bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
