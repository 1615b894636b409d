//! Upload sink that holds the whole file in memory until close

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::stream::body::{check_drained, UploadBody, Uploader};
use crate::stream::Sink;

/// [`Sink`] that collects written bytes and runs one [`Uploader::upload`] on close
///
/// No task and no pipe are involved, so the upload runs on the closing task.
/// Memory use grows with the file size.
pub struct BufferedUpload<U: Uploader> {
    uploader: Arc<U>,
    buffer: BytesMut,
    closed: bool,
}

impl<U: Uploader> BufferedUpload<U> {
    pub fn new(uploader: Arc<U>) -> Self {
        Self {
            uploader,
            buffer: BytesMut::new(),
            closed: false,
        }
    }

    /// Bytes collected so far
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl<U: Uploader> Sink for BufferedUpload<U> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(BridgeError::Closed);
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            debug!("buffered upload: skip double close");
            return Ok(());
        }
        self.closed = true;

        let result = if self.buffer.is_empty() {
            debug!("buffered upload: closed without writes, creating empty file");
            self.uploader.upload_empty().await
        } else {
            let data = self.buffer.split().freeze();
            debug!("buffered upload: uploading {} bytes", data.len());
            let body = UploadBody::from_bytes(data);
            let drained = body.drained_flag();
            let result = self.uploader.upload(body).await;
            check_drained(result, &drained)
        };

        match result {
            Ok(entry) => {
                self.uploader.on_complete(entry);
                Ok(())
            }
            Err(err) => {
                warn!("buffered upload: upload failed: {}", err);
                self.uploader.on_failure(&err);
                Err(err)
            }
        }
    }
}

impl<U: Uploader> Drop for BufferedUpload<U> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!(
            "buffered upload: dropped before close, discarding {} bytes",
            self.buffer.len()
        );
        self.uploader.on_failure(&BridgeError::Upload(
            "upload handle dropped before close".to_string(),
        ));
    }
}
