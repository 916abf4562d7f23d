//! Object-store backend
//!
//! Adapts an [`ObjectClient`] to the [`Backend`] interface. Object stores
//! replace whole objects, so writes are buffered in memory and uploaded in
//! one request when the stream is committed. Nothing written becomes
//! visible to other readers before that upload succeeds.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::{debug, trace, warn};

use crate::backend::{Backend, ReadStream, WriteSink, WriteStream};
use crate::client::ObjectClient;
use crate::error::{NstoreError, Result};
use crate::uri::ResourceUri;

/// Backend over a bucket-addressed object store
pub struct ObjectStoreBackend<C: ObjectClient> {
    client: Arc<C>,
}

impl<C: ObjectClient> ObjectStoreBackend<C> {
    pub fn new(client: C) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    pub fn from_arc(client: Arc<C>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Split a resolved URI into bucket and key
    fn location<'a>(&self, uri: &'a ResourceUri) -> Result<(&'a str, &'a str)> {
        match uri.container() {
            Some(bucket) => Ok((bucket, uri.path())),
            None => Err(NstoreError::malformed(
                &uri.to_string(),
                "object store URI has no bucket",
            )),
        }
    }
}

#[async_trait]
impl<C: ObjectClient + 'static> Backend for ObjectStoreBackend<C> {
    fn name(&self) -> &'static str {
        "object-store"
    }

    async fn open_read(&self, uri: &ResourceUri) -> Result<ReadStream> {
        let (bucket, key) = self.location(uri)?;
        trace!("object-store: open_read bucket={} key={}", bucket, key);
        let body = self.client.get_object(bucket, key).await?;
        Ok(Box::pin(ObjectBody::new(body, uri)))
    }

    async fn open_write(&self, uri: &ResourceUri) -> Result<WriteStream> {
        let (bucket, key) = self.location(uri)?;
        Ok(Box::new(ObjectWriter::new(
            self.client.clone(),
            bucket,
            key,
            Vec::new(),
        )))
    }

    async fn open_append(&self, uri: &ResourceUri) -> Result<WriteStream> {
        let (bucket, key) = self.location(uri)?;

        let existing = match self.client.get_object(bucket, key).await {
            Ok(stream) => {
                let mut buffer = Vec::new();
                ObjectBody::new(stream, uri).read_to_end(&mut buffer).await?;
                buffer
            }
            Err(NstoreError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        debug!(
            "object-store: appending to bucket={} key={} existing={} bytes",
            bucket,
            key,
            existing.len()
        );
        Ok(Box::new(ObjectWriter::new(
            self.client.clone(),
            bucket,
            key,
            existing,
        )))
    }

    async fn delete(&self, uri: &ResourceUri) -> Result<()> {
        let (bucket, key) = self.location(uri)?;
        self.client.delete_object(bucket, key).await
    }

    async fn exists(&self, uri: &ResourceUri) -> Result<bool> {
        let (bucket, key) = self.location(uri)?;
        Ok(self.client.head_object(bucket, key).await?.is_some())
    }

    async fn upload_from(&self, src: &Path, uri: &ResourceUri) -> Result<()> {
        let (bucket, key) = self.location(uri)?;
        self.client.put_object_from_file(bucket, key, src).await
    }
}

/// Object body whose read failures are transport faults
///
/// A connection dropping mid-body surfaces as an I/O error from the
/// client's stream; it is tagged `BackendUnavailable` so callers see a
/// retryable error rather than a local I/O failure.
struct ObjectBody {
    inner: ReadStream,
    target: String,
}

impl ObjectBody {
    fn new(inner: ReadStream, uri: &ResourceUri) -> Self {
        Self {
            inner,
            target: uri.to_string(),
        }
    }
}

impl AsyncRead for ObjectBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_read(cx, buf) {
            Poll::Ready(Err(e)) if !carries_classified_error(&e) => {
                let message = format!("reading {}: {}", this.target, e);
                Poll::Ready(Err(io::Error::new(
                    e.kind(),
                    NstoreError::BackendUnavailable(message),
                )))
            }
            other => other,
        }
    }
}

fn carries_classified_error(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<NstoreError>())
}

/// Buffers an object body until commit
struct ObjectWriter<C: ObjectClient> {
    client: Arc<C>,
    bucket: String,
    key: String,
    buffer: Vec<u8>,
    committed: bool,
}

impl<C: ObjectClient> ObjectWriter<C> {
    fn new(client: Arc<C>, bucket: &str, key: &str, buffer: Vec<u8>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            key: key.to_string(),
            buffer,
            committed: false,
        }
    }
}

impl<C: ObjectClient> AsyncWrite for ObjectWriter<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl<C: ObjectClient + 'static> WriteSink for ObjectWriter<C> {
    async fn commit(self: Box<Self>) -> Result<()> {
        let mut writer = self;
        let body = Bytes::from(std::mem::take(&mut writer.buffer));
        debug!(
            "object-store: uploading bucket={} key={} size={}",
            writer.bucket,
            writer.key,
            body.len()
        );

        // A failed upload leaves the remote object untouched; the buffer is
        // gone either way, so the caller has to rewrite to retry.
        writer.committed = true;
        writer
            .client
            .put_object(&writer.bucket, &writer.key, body)
            .await
    }
}

impl<C: ObjectClient> Drop for ObjectWriter<C> {
    fn drop(&mut self) {
        if !self.committed {
            warn!(
                "Discarding {} uncommitted bytes for s3://{}/{}",
                self.buffer.len(),
                self.bucket,
                self.key
            );
        }
    }
}
