//! Seekable write wrapper over a forward-only sink
//!
//! Only strictly increasing offsets are written faithfully. Two corrections
//! keep common kernel write patterns working:
//! - rewinding behind bytes already sent: overlapping bytes of later writes
//!   are acknowledged without being sent again
//! - jumping past the end: the gap is filled with zeros

use std::cmp;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::error::{BridgeError, Result};
use crate::stream::{ByteChannel, Sink};

const ZERO_FILL_CHUNK: usize = 64 * 1024;

/// Write-only [`ByteChannel`] over a [`Sink`]
pub struct WriteChannel<S> {
    sink: S,
    /// Bytes pushed into the sink (plus the starting offset)
    written: u64,
    /// Offset the next write applies to
    cursor: u64,
    /// Logical file size
    size: u64,
    open: bool,
}

impl<S: Sink> WriteChannel<S> {
    pub fn new(sink: S) -> Self {
        Self::with_offset(sink, 0)
    }

    /// Start counting at `left_over`, for sinks that append to existing content
    pub fn with_offset(sink: S, left_over: u64) -> Self {
        Self {
            sink,
            written: left_over,
            cursor: left_over,
            size: left_over,
            open: true,
        }
    }

    /// Bytes actually handed to the sink so far
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    async fn zero_fill(&mut self, count: u64) -> Result<()> {
        let zeros = [0u8; ZERO_FILL_CHUNK];
        let mut remaining = count;
        while remaining > 0 {
            let chunk = cmp::min(remaining, ZERO_FILL_CHUNK as u64) as usize;
            let n = self.sink.write(&zeros[..chunk]).await?;
            self.written += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }
}

#[async_trait]
impl<S: Sink> ByteChannel for WriteChannel<S> {
    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Err(BridgeError::NotReadable)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.open {
            return Err(BridgeError::Closed);
        }

        let mut data = buf;
        let mut accepted = 0usize;

        if self.cursor < self.written {
            let overlap = cmp::min(self.written - self.cursor, buf.len() as u64) as usize;
            debug!(
                "write channel: acknowledging {} already-sent bytes at {}",
                overlap, self.cursor
            );
            data = &buf[overlap..];
            accepted += overlap;
            self.cursor += overlap as u64;
        }

        if !data.is_empty() {
            let n = self.sink.write(data).await?;
            trace!(
                "write channel: write {}/{} -> {}",
                n,
                self.written,
                self.written + n as u64
            );
            self.written += n as u64;
            self.cursor += n as u64;
            accepted += n;
        }

        self.size = cmp::max(self.size, self.cursor);
        Ok(accepted)
    }

    async fn position(&mut self) -> Result<u64> {
        Ok(self.cursor)
    }

    async fn set_position(&mut self, pos: u64) -> Result<()> {
        if !self.open {
            return Err(BridgeError::Closed);
        }

        if pos > self.written {
            warn!(
                "write channel: zero-filling gap {} -> {} on forward-only sink",
                self.written, pos
            );
            self.zero_fill(pos - self.written).await?;
            self.size = cmp::max(self.size, self.written);
        } else if pos < self.written {
            warn!(
                "write channel: rewind to {} behind {} sent bytes; overlapping writes are dropped",
                pos, self.written
            );
        }
        self.cursor = pos;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    /// Sets the logical size when `size` is below the bytes written so far.
    /// Bytes already in the sink stay there; anything else is a no-op.
    async fn truncate(&mut self, size: u64) -> Result<()> {
        debug!("write channel: truncate {} (written {})", size, self.written);
        if size < self.written {
            self.size = size;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn close(&mut self) -> Result<()> {
        if !self.open {
            debug!("write channel: skip double close");
            return Ok(());
        }
        self.open = false;
        trace!("write channel: close after {} bytes", self.written);
        self.sink.close().await
    }
}
