//! Lazy upload bridge for push-style writers and pull-style uploads
//!
//! Backends take an upload body they read from, while the file handle gets
//! bytes pushed into it. [`StealingUpload`] joins the two with a bounded
//! in-memory pipe. Nothing is spawned until the first write; a handle closed
//! without writes goes through [`Uploader::upload_empty`] instead.
//!
//! One upload session exchanges three one-shot signals:
//!
//! - A: the upload task has created the pipe and hands its write half back
//! - B: the writer is done; the body reports end of stream once drained
//! - C: the backend upload returned; carries its result
//!
//! If the writer goes away without firing B, the body fails with
//! `UnexpectedEof` instead of ending cleanly. An upload that returns `Ok`
//! without reading to that clean end is reported as failed at close. If the
//! upload stops reading early, the failing write and the first `close` both
//! return the error.

use std::io;
use std::mem;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{BridgeError, Result};
use crate::stream::body::{check_drained, UploadBody, Uploader};
use crate::stream::Sink;

enum State<T> {
    Idle,
    Writing {
        sink: DuplexStream,
        done: oneshot::Sender<()>,
        finished: oneshot::Receiver<Result<T>>,
        drained: Arc<AtomicBool>,
    },
    /// The upload stopped early; the message is returned by the next `close`
    Failed(String),
    Closed,
}

/// [`Sink`] that streams written bytes into an [`Uploader`] running on its own task
pub struct StealingUpload<U: Uploader> {
    uploader: Arc<U>,
    capacity: usize,
    started: bool,
    state: State<U::Entry>,
}

impl<U: Uploader> StealingUpload<U> {
    /// `capacity` is the pipe buffer size between writer and upload task
    pub fn new(uploader: Arc<U>, capacity: usize) -> Self {
        Self {
            uploader,
            capacity: capacity.max(1),
            started: false,
            state: State::Idle,
        }
    }

    /// Whether an upload task was ever spawned
    pub fn started(&self) -> bool {
        self.started
    }

    /// Whether `close` already ran. A failed bridge still owes its caller one `close`.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    async fn start(&mut self) -> Result<()> {
        let (ready_tx, ready_rx) = oneshot::channel::<DuplexStream>();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let (finished_tx, finished_rx) = oneshot::channel::<Result<U::Entry>>();

        let uploader = Arc::clone(&self.uploader);
        let capacity = self.capacity;
        self.started = true;
        debug!("stealing upload: spawning upload task (pipe {} bytes)", capacity);

        let drained = Arc::new(AtomicBool::new(false));
        let body_drained = Arc::clone(&drained);

        tokio::spawn(async move {
            let (sink, pipe) = tokio::io::duplex(capacity);
            if ready_tx.send(sink).is_err() {
                return;
            }
            let body = UploadBody::pipe(pipe, done_rx, body_drained);
            let result = uploader.upload(body).await;
            if finished_tx.send(result).is_err() {
                trace!("stealing upload: result discarded, handle already gone");
            }
        });

        let sink = ready_rx.await.map_err(|_| {
            BridgeError::Upload("upload task exited before its pipe was ready".to_string())
        })?;
        self.state = State::Writing {
            sink,
            done: done_tx,
            finished: finished_rx,
            drained,
        };
        Ok(())
    }

    /// The upload stopped reading before the writer was done
    async fn collect_early_end(&mut self) -> BridgeError {
        let err = match mem::replace(&mut self.state, State::Closed) {
            State::Writing { finished, .. } => match finished.await {
                Ok(Err(err)) => err,
                Ok(Ok(_)) => BridgeError::Upload(
                    "upload finished before all bytes were written".to_string(),
                ),
                Err(_) => BridgeError::Upload("upload task ended without a result".to_string()),
            },
            _ => BridgeError::Closed,
        };
        warn!("stealing upload: upload ended early: {}", err);
        self.uploader.on_failure(&err);
        self.state = State::Failed(failure_message(&err));
        err
    }

    fn report(&self, result: Result<U::Entry>) -> Result<()> {
        match result {
            Ok(entry) => {
                self.uploader.on_complete(entry);
                Ok(())
            }
            Err(err) => {
                warn!("stealing upload: upload failed: {}", err);
                self.uploader.on_failure(&err);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl<U: Uploader> Sink for StealingUpload<U> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.state {
            State::Closed => return Err(BridgeError::Closed),
            State::Failed(ref msg) => return Err(BridgeError::Upload(msg.clone())),
            State::Idle => self.start().await?,
            State::Writing { .. } => {}
        }

        let State::Writing { sink, .. } = &mut self.state else {
            return Err(BridgeError::Closed);
        };
        match sink.write_all(buf).await {
            Ok(()) => Ok(buf.len()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(self.collect_early_end().await),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        match mem::replace(&mut self.state, State::Closed) {
            State::Closed => {
                debug!("stealing upload: skip double close");
                Ok(())
            }
            State::Failed(msg) => {
                debug!("stealing upload: closing after an early upload failure");
                Err(BridgeError::Upload(msg))
            }
            State::Idle => {
                debug!("stealing upload: closed without writes, creating empty file");
                let result = self.uploader.upload_empty().await;
                self.report(result)
            }
            State::Writing {
                sink,
                done,
                finished,
                drained,
            } => {
                // the body drains what is buffered, then waits for B
                drop(sink);
                if done.send(()).is_err() {
                    trace!("stealing upload: body already gone");
                }
                let result = finished.await.unwrap_or_else(|_| {
                    Err(BridgeError::Upload(
                        "upload task ended without a result".to_string(),
                    ))
                });
                self.report(check_drained(result, &drained))
            }
        }
    }
}

impl<U: Uploader> Drop for StealingUpload<U> {
    fn drop(&mut self) {
        if matches!(self.state, State::Closed | State::Failed(_)) {
            return;
        }
        warn!("stealing upload: dropped before close");
        self.uploader.on_failure(&BridgeError::Upload(
            "upload handle dropped before close".to_string(),
        ));
    }
}

/// Message of an upload failure without a second `Upload failed:` prefix
fn failure_message(err: &BridgeError) -> String {
    match err {
        BridgeError::Upload(msg) => msg.clone(),
        other => other.to_string(),
    }
}
