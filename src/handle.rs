//! Open file handles
//!
//! A [`FileHandle`] owns one stream onto one resource. Writes become durable
//! only when the handle is closed; for cached remote resources closing also
//! releases the cache entry, which uploads the mirror once no other handle
//! holds it.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    ReadBuf,
};
use tracing::{debug, trace, warn};

use crate::backend::{ReadStream, WriteStream};
use crate::cache::{CacheManager, EntryLease};
use crate::error::{NstoreError, Result};
use crate::mode::AccessMode;
use crate::uri::ResourceUri;

type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;

enum HandleIo {
    Reader(BoxedReader),
    Writer(WriteStream),
    GzipWriter(GzipEncoder<WriteStream>),
}

/// Reference on a cache entry, returned to the manager exactly once
pub(crate) struct CacheLease {
    cache: Arc<CacheManager>,
    entry: EntryLease,
}

impl CacheLease {
    pub(crate) fn new(cache: Arc<CacheManager>, entry: EntryLease) -> Self {
        Self { cache, entry }
    }

    async fn release(self) -> Result<()> {
        self.cache.release(self.entry).await
    }

    async fn release_discarding(self) -> Result<()> {
        self.cache.release_discarding(self.entry).await
    }
}

/// An open resource bound to one URI and one access mode
///
/// Call [`close`](FileHandle::close) to finish a session. [`abort`](FileHandle::abort)
/// abandons it: a cached mirror is not uploaded, and a direct write leaves
/// the target untouched where the backend stages writes (object stores,
/// and local files with atomic writes enabled). A handle dropped without
/// either behaves like `abort`.
pub struct FileHandle {
    uri: ResourceUri,
    mode: AccessMode,
    io: Option<HandleIo>,
    lease: Option<CacheLease>,
}

impl FileHandle {
    pub(crate) fn reader(
        uri: ResourceUri,
        mode: AccessMode,
        stream: ReadStream,
        lease: Option<CacheLease>,
    ) -> Self {
        let reader: BoxedReader = if uri.is_gzip() {
            let mut decoder = GzipDecoder::new(BufReader::new(stream));
            decoder.multiple_members(true);
            Box::new(BufReader::new(decoder))
        } else {
            Box::new(BufReader::new(stream))
        };

        Self {
            uri,
            mode,
            io: Some(HandleIo::Reader(reader)),
            lease,
        }
    }

    pub(crate) fn writer(
        uri: ResourceUri,
        mode: AccessMode,
        sink: WriteStream,
        lease: Option<CacheLease>,
    ) -> Self {
        let io = if uri.is_gzip() {
            HandleIo::GzipWriter(GzipEncoder::new(sink))
        } else {
            HandleIo::Writer(sink)
        };

        Self {
            uri,
            mode,
            io: Some(io),
            lease,
        }
    }

    pub fn uri(&self) -> &ResourceUri {
        &self.uri
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Whether the handle works on a local mirror of a remote resource
    pub fn is_cached(&self) -> bool {
        self.lease.is_some()
    }

    /// Read the remaining content as UTF-8 text
    pub async fn read_text(&mut self) -> Result<String> {
        let reader = self.reader_for(false, "read text")?;
        let mut out = String::new();
        reader.read_to_string(&mut out).await?;
        Ok(out)
    }

    /// Read one line including its terminator; `None` at end of file
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let reader = self.reader_for(false, "read text")?;
        let mut line = String::new();
        match reader.read_line(&mut line).await? {
            0 => Ok(None),
            _ => Ok(Some(line)),
        }
    }

    /// Read the remaining content as bytes
    pub async fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let reader = self.reader_for(true, "read bytes")?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        Ok(out)
    }

    /// Read up to `max` bytes; an empty result means end of file
    pub async fn read_chunk(&mut self, max: usize) -> Result<Vec<u8>> {
        let reader = self.reader_for(true, "read bytes")?;
        let mut chunk = vec![0u8; max];
        let n = reader.read(&mut chunk).await?;
        chunk.truncate(n);
        Ok(chunk)
    }

    pub async fn write_text(&mut self, text: &str) -> Result<()> {
        self.check_mode(false, "write text")?;
        self.write_all(text.as_bytes()).await
    }

    pub async fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.check_mode(true, "write bytes")?;
        self.write_all(data).await
    }

    /// Finish the session.
    ///
    /// Commits written content and hands the cache entry back. For a cached
    /// writer this is where the upload happens when no other handle holds
    /// the entry; an upload failure is returned as `CacheSync` and leaves
    /// the mirror dirty for a later flush.
    pub async fn close(mut self) -> Result<()> {
        let finished = self.finish_io().await;
        let lease = self.lease.take();

        match (finished, lease) {
            (Ok(()), Some(lease)) => lease.release().await,
            (Ok(()), None) => Ok(()),
            (Err(e), lease) => {
                warn!("Failed to finish writing {}: {}", self.uri, e);
                if let Some(lease) = lease {
                    if let Err(release_err) = lease.release_discarding().await {
                        warn!("Failed to release cache entry for {}: {}", self.uri, release_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// Abandon the session without committing anything staged
    pub async fn abort(mut self) -> Result<()> {
        trace!("Aborting handle for {}", self.uri);
        self.io.take();
        match self.lease.take() {
            Some(lease) => lease.release_discarding().await,
            None => Ok(()),
        }
    }

    fn check_mode(&self, binary: bool, action: &str) -> Result<()> {
        let direction_ok = if action.starts_with("read") {
            self.mode.is_read()
        } else {
            self.mode.is_write()
        };

        if direction_ok && self.mode.binary == binary {
            Ok(())
        } else {
            Err(NstoreError::NotSupported(format!(
                "cannot {} on {} opened with mode '{}'",
                action, self.uri, self.mode
            )))
        }
    }

    fn reader_for(&mut self, binary: bool, action: &str) -> Result<&mut BoxedReader> {
        self.check_mode(binary, action)?;
        match &mut self.io {
            Some(HandleIo::Reader(reader)) => Ok(reader),
            _ => Err(NstoreError::NotSupported(format!(
                "{} is not open for reading",
                self.uri
            ))),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.io {
            Some(HandleIo::Writer(sink)) => sink.write_all(data).await?,
            Some(HandleIo::GzipWriter(encoder)) => encoder.write_all(data).await?,
            _ => {
                return Err(NstoreError::NotSupported(format!(
                    "{} is not open for writing",
                    self.uri
                )))
            }
        }
        Ok(())
    }

    async fn finish_io(&mut self) -> Result<()> {
        match self.io.take() {
            Some(HandleIo::Writer(sink)) => sink.commit().await,
            Some(HandleIo::GzipWriter(mut encoder)) => {
                encoder.shutdown().await?;
                encoder.into_inner().commit().await
            }
            Some(HandleIo::Reader(_)) | None => Ok(()),
        }
    }
}

fn unsupported(uri: &ResourceUri, what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{} is not open for {}", uri, what),
    )
}

impl AsyncRead for FileHandle {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.io {
            Some(HandleIo::Reader(reader)) => Pin::new(reader).poll_read(cx, buf),
            _ => Poll::Ready(Err(unsupported(&this.uri, "reading"))),
        }
    }
}

impl AsyncWrite for FileHandle {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match &mut this.io {
            Some(HandleIo::Writer(sink)) => Pin::new(sink).poll_write(cx, buf),
            Some(HandleIo::GzipWriter(encoder)) => Pin::new(encoder).poll_write(cx, buf),
            _ => Poll::Ready(Err(unsupported(&this.uri, "writing"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match &mut this.io {
            Some(HandleIo::Writer(sink)) => Pin::new(sink).poll_flush(cx),
            Some(HandleIo::GzipWriter(encoder)) => Pin::new(encoder).poll_flush(cx),
            _ => Poll::Ready(Ok(())),
        }
    }

    /// Shutting down does not commit; call `close` for that.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        self.io.take();

        if self.mode.is_write() {
            warn!("Handle for {} dropped without close; discarding writes", self.uri);
        } else {
            debug!("Handle for {} dropped without close", self.uri);
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let uri = self.uri.clone();
                runtime.spawn(async move {
                    if let Err(e) = lease.release_discarding().await {
                        warn!("Deferred release of {} failed: {}", uri, e);
                    }
                });
            }
            Err(_) => warn!(
                "No runtime to release cache entry for {}; it stays referenced",
                self.uri
            ),
        }
    }
}
