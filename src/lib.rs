//! fuse-bridge: path cache and upload bridge between FUSE and async storage backends
//!
//! This library sits between a filesystem callback dispatcher and a storage
//! backend that only offers forward-only downloads and pull-style uploads.
//!
//! # Architecture
//!
//! - **PathCache**: metadata and directory listings keyed by canonical path,
//!   kept consistent across adds, removes and subtree moves.
//! - **UploadMonitor**: paths whose writes are not yet committed, consulted
//!   before the cache is trusted.
//! - **Streams**: seekable read/write channels over forward-only streams, and
//!   the stealing upload bridge that feeds kernel writes into a backend upload
//!   running on its own task. A buffered sink that uploads on release is the
//!   alternative.
//! - **Session**: one mount's context wiring the above to a `Backend`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use fuse_bridge::backend::memory::MemoryBackend;
//! use fuse_bridge::config::Config;
//! use fuse_bridge::path::CacheKey;
//! use fuse_bridge::session::Session;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file("config.yaml".as_ref())?;
//! config.logging.init();
//!
//! let session = Session::from_config(Arc::new(MemoryBackend::new()), &config);
//! let path = CacheKey::new("/notes.txt");
//!
//! let fh = session.open_write(&path).await?;
//! session.write(fh, 0, b"hello").await?;
//! session.release(fh).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod ignore;
pub mod path;
pub mod session;
pub mod stream;
pub mod upload;

pub use error::{BridgeError, Result};
