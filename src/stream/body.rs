//! Upload bodies and the integrator trait shared by the upload sinks

use std::future::Future;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tokio::sync::oneshot;

use crate::error::{BridgeError, Result};

/// Integrator side of an upload sink
#[async_trait]
pub trait Uploader: Send + Sync + 'static {
    /// Backend record produced by a finished upload
    type Entry: Send + 'static;

    /// Consume `body` until end of stream and store it
    async fn upload(&self, body: UploadBody) -> Result<Self::Entry>;

    /// Create a zero-length file; used when nothing was written
    async fn upload_empty(&self) -> Result<Self::Entry>;

    /// Called once with the entry of a successful upload, before `close` returns
    fn on_complete(&self, entry: Self::Entry);

    /// Called once when the upload failed or the handle was abandoned
    fn on_failure(&self, _err: &BridgeError) {}
}

enum Gate {
    Waiting(oneshot::Receiver<()>),
    Finished,
    Aborted,
}

enum Source {
    Pipe { pipe: DuplexStream, gate: Gate },
    Buffered(Cursor<Bytes>),
}

/// Byte stream handed to [`Uploader::upload`]
///
/// The body records whether it was read to its clean end of stream. Sinks
/// check that flag before committing, so an upload that returns `Ok` after
/// reading only a prefix is reported as a failure.
pub struct UploadBody {
    source: Source,
    drained: Arc<AtomicBool>,
}

impl UploadBody {
    /// Read half of a stealing pipe; end of stream needs the writer's signal
    pub(crate) fn pipe(
        pipe: DuplexStream,
        done: oneshot::Receiver<()>,
        drained: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source: Source::Pipe {
                pipe,
                gate: Gate::Waiting(done),
            },
            drained,
        }
    }

    /// Body over bytes that are already complete
    pub fn from_bytes(data: Bytes) -> Self {
        Self {
            source: Source::Buffered(Cursor::new(data)),
            drained: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag set once the body reported its clean end of stream
    pub(crate) fn drained_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.drained)
    }
}

impl AsyncRead for UploadBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        match &mut this.source {
            Source::Buffered(cursor) => {
                ready!(Pin::new(cursor).poll_read(cx, buf))?;
                if buf.filled().len() == before {
                    this.drained.store(true, Ordering::SeqCst);
                }
                Poll::Ready(Ok(()))
            }
            Source::Pipe { pipe, gate } => {
                ready!(Pin::new(pipe).poll_read(cx, buf))?;
                if buf.filled().len() > before {
                    return Poll::Ready(Ok(()));
                }

                // pipe drained and closed; only signal B makes this a real end of stream
                let clean = match &mut *gate {
                    Gate::Finished => true,
                    Gate::Aborted => false,
                    Gate::Waiting(done) => ready!(Pin::new(done).poll(cx)).is_ok(),
                };

                if clean {
                    *gate = Gate::Finished;
                    this.drained.store(true, Ordering::SeqCst);
                    Poll::Ready(Ok(()))
                } else {
                    *gate = Gate::Aborted;
                    Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "writer dropped before close",
                    )))
                }
            }
        }
    }
}

/// Reject an `Ok` upload that never read its body to the end
pub(crate) fn check_drained<T>(result: Result<T>, drained: &AtomicBool) -> Result<T> {
    match result {
        Ok(_) if !drained.load(Ordering::SeqCst) => Err(BridgeError::Upload(
            "upload returned before consuming the whole body".to_string(),
        )),
        other => other,
    }
}
