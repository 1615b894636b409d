//! Seekable read wrapper over a backend download stream

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, SeekFrom};
use tracing::{trace, warn};

use crate::error::{BridgeError, Result};
use crate::stream::ByteChannel;

/// A download stream that also supports random access
pub trait SeekableSource: AsyncRead + AsyncSeek + Unpin + Send {}

impl<T: AsyncRead + AsyncSeek + Unpin + Send> SeekableSource for T {}

/// Stream handed out by a backend for reading a file
pub enum Download {
    /// Forward-only stream; position is tracked by counting bytes
    Forward(Box<dyn AsyncRead + Unpin + Send>),
    /// Stream with native random access
    Seekable(Box<dyn SeekableSource>),
}

impl Download {
    pub fn forward<R: AsyncRead + Unpin + Send + 'static>(reader: R) -> Self {
        Download::Forward(Box::new(reader))
    }

    pub fn seekable<R: SeekableSource + 'static>(reader: R) -> Self {
        Download::Seekable(Box::new(reader))
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self, Download::Seekable(_))
    }
}

/// Callback run when a [`ReadChannel`] closes; receives the bytes read
pub type CloseHook = Box<dyn FnOnce(u64) + Send>;

/// Read-only [`ByteChannel`] over a [`Download`]
///
/// `size()` comes from backend metadata supplied at construction, not from
/// the stream.
pub struct ReadChannel {
    source: Option<Download>,
    /// Bytes consumed from a forward-only stream
    read: u64,
    size: u64,
    on_close: Option<CloseHook>,
}

impl ReadChannel {
    pub fn new(source: Download, size: u64) -> Self {
        Self {
            source: Some(source),
            read: 0,
            size,
            on_close: None,
        }
    }

    /// Run `hook` on the first `close`. Later closes do not run it again.
    pub fn with_close_hook<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.on_close = Some(Box::new(hook));
        self
    }

    fn source(&mut self) -> Result<&mut Download> {
        self.source.as_mut().ok_or(BridgeError::Closed)
    }

    /// Discard `count` bytes from a forward-only stream
    async fn skip(&mut self, count: u64) -> Result<()> {
        let Download::Forward(reader) = self.source()? else {
            return Ok(());
        };
        let skipped = tokio::io::copy(&mut reader.take(count), &mut tokio::io::sink()).await?;
        self.read += skipped;
        Ok(())
    }
}

#[async_trait]
impl ByteChannel for ReadChannel {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self.source()? {
            Download::Forward(reader) => reader.read(buf).await?,
            Download::Seekable(reader) => reader.read(buf).await?,
        };
        if n > 0 {
            trace!("read channel: read {} at {} -> {}", n, self.read, self.read + n as u64);
            self.read += n as u64;
        }
        Ok(n)
    }

    async fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(BridgeError::NotWritable)
    }

    async fn position(&mut self) -> Result<u64> {
        if let Download::Seekable(reader) = self.source()? {
            let pos = reader.stream_position().await?;
            self.read = pos;
        }
        Ok(self.read)
    }

    async fn set_position(&mut self, pos: u64) -> Result<()> {
        let current = self.read;
        if let Download::Seekable(reader) = self.source()? {
            reader.seek(SeekFrom::Start(pos)).await?;
            self.read = pos;
            return Ok(());
        }

        if pos > current {
            trace!("read channel: skipping {} bytes on forward-only stream", pos - current);
            self.skip(pos - current).await?;
        } else if pos < current {
            warn!(
                "read channel: cannot seek back to {} on forward-only stream (at {})",
                pos, current
            );
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn truncate(&mut self, _size: u64) -> Result<()> {
        Err(BridgeError::NotWritable)
    }

    fn is_open(&self) -> bool {
        self.source.is_some()
    }

    async fn close(&mut self) -> Result<()> {
        if self.source.take().is_some() {
            trace!("read channel: close after {} bytes", self.read);
        }
        if let Some(hook) = self.on_close.take() {
            hook(self.read);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_test::io::Builder;

    const TEN: &[u8] = &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9];

    #[tokio::test]
    async fn test_partial_reads_then_end_of_stream() {
        let mock = Builder::new().read(&TEN[..4]).read(&TEN[4..]).build();
        let mut channel = ReadChannel::new(Download::forward(mock), 10);
        assert_eq!(channel.size(), 10);

        let mut buf = [0u8; 16];
        let mut total = 0;
        let n = channel.read(&mut buf).await.unwrap();
        assert_eq!(n, 4);
        total += n;
        let n = channel.read(&mut buf[total..]).await.unwrap();
        assert_eq!(n, 6);
        total += n;

        // past the end: end-of-stream, not an error
        assert_eq!(channel.read(&mut buf[total..]).await.unwrap(), 0);
        assert_eq!(channel.read(&mut buf).await.unwrap(), 0);

        assert_eq!(&buf[..total], TEN);
        assert_eq!(channel.position().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_forward_only_skip_and_backward_noop() {
        let mut channel = ReadChannel::new(Download::forward(Cursor::new(TEN.to_vec())), 10);

        channel.set_position(6).await.unwrap();
        assert_eq!(channel.position().await.unwrap(), 6);

        let mut buf = [0u8; 2];
        channel.read(&mut buf).await.unwrap();
        assert_eq!(buf, [6, 7]);

        // cannot go back; counter stays truthful
        channel.set_position(2).await.unwrap();
        assert_eq!(channel.position().await.unwrap(), 8);
        channel.read(&mut buf).await.unwrap();
        assert_eq!(buf, [8, 9]);
    }

    #[tokio::test]
    async fn test_seekable_source_seeks() {
        let mut channel = ReadChannel::new(Download::seekable(Cursor::new(TEN.to_vec())), 10);

        channel.set_position(7).await.unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(channel.read(&mut buf).await.unwrap(), 3);
        assert_eq!(buf, [7, 8, 9]);

        channel.set_position(1).await.unwrap();
        assert_eq!(channel.position().await.unwrap(), 1);
        channel.read(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(channel.position().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_not_writable() {
        let mut channel = ReadChannel::new(Download::forward(Cursor::new(Vec::new())), 0);
        assert!(matches!(
            channel.write(b"x").await,
            Err(BridgeError::NotWritable)
        ));
        assert!(matches!(
            channel.truncate(0).await,
            Err(BridgeError::NotWritable)
        ));
    }

    #[tokio::test]
    async fn test_close_twice_and_read_after_close() {
        let mut channel = ReadChannel::new(Download::forward(Cursor::new(TEN.to_vec())), 10);
        assert!(channel.is_open());
        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert!(!channel.is_open());

        let mut buf = [0u8; 1];
        assert!(matches!(
            channel.read(&mut buf).await,
            Err(BridgeError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_hook_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicU64::new(0));
        let (hook_calls, hook_seen) = (Arc::clone(&calls), Arc::clone(&seen));
        let mut channel = ReadChannel::new(Download::forward(Cursor::new(TEN.to_vec())), 10)
            .with_close_hook(move |read| {
                hook_calls.fetch_add(1, Ordering::SeqCst);
                hook_seen.store(read, Ordering::SeqCst);
            });

        let mut buf = [0u8; 3];
        channel.read(&mut buf).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
