//! Adapters between backend streams and random-access file handles
//!
//! Backends usually hand out forward-only byte streams, while a filesystem
//! file handle expects `position`/`size`/`truncate`. The adapters here keep
//! the byte counters needed to answer those calls:
//!
//! - [`ReadChannel`] wraps a download stream
//! - [`WriteChannel`] wraps any [`Sink`]
//! - [`StealingUpload`] is a [`Sink`] that hands the written bytes to a
//!   blocking backend upload running on its own task
//! - [`BufferedUpload`] is a [`Sink`] that keeps the bytes in memory and
//!   uploads them in one go on close

pub mod body;
pub mod buffered;
pub mod read;
pub mod stealing;
pub mod write;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;

pub use read::{CloseHook, Download, ReadChannel, SeekableSource};
pub use body::{UploadBody, Uploader};
pub use buffered::BufferedUpload;
pub use stealing::StealingUpload;
pub use write::WriteChannel;

/// A seekable byte channel backing one open file handle
#[async_trait]
pub trait ByteChannel: Send {
    /// Read into `buf`, returning the number of bytes read (0 at end of stream).
    /// Fewer bytes than requested is not an error; callers must loop.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf`, returning the number of bytes accepted
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Current byte offset
    async fn position(&mut self) -> Result<u64>;

    /// Move the byte offset (best effort for forward-only streams)
    async fn set_position(&mut self, pos: u64) -> Result<()>;

    /// Logical size of the file
    fn size(&self) -> u64;

    /// Shrink the logical size
    async fn truncate(&mut self, size: u64) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Close the channel. Closing twice is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// Forward-only destination for written bytes
#[async_trait]
pub trait Sink: Send {
    /// Write all of `buf`
    async fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Flush and finish the sink
    async fn close(&mut self) -> Result<()>;
}

/// [`Sink`] over any tokio writer
pub struct AsyncWriteSink<W> {
    inner: W,
}

impl<W> AsyncWriteSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Sink for AsyncWriteSink<W> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write_all(buf).await?;
        Ok(buf.len())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
