//! Access sessions
//!
//! [`Nstore`] is the entry point: it resolves URIs, picks the backend for
//! the scheme, and decides whether a handle works on the remote resource
//! directly or on a cached local mirror.

use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::backend::local::LocalBackend;
use crate::backend::object_store::ObjectStoreBackend;
use crate::backend::{Backend, BackendRegistry, ReadStream, WriteStream};
use crate::cache::{CacheEntryInfo, CacheManager};
use crate::client::s3::S3Client;
use crate::config::Config;
use crate::error::Result;
use crate::handle::{CacheLease, FileHandle};
use crate::mode::{AccessMode, Direction};
use crate::uri::{ResourceUri, Scheme};

/// Storage access front end
///
/// Cheap to clone; clones share the backend registry and the cache.
#[derive(Clone)]
pub struct Nstore {
    backends: BackendRegistry,
    cache: Arc<CacheManager>,
    /// Opens mirror files, independent of the registered `file` backend
    mirrors: Arc<LocalBackend>,
}

impl Nstore {
    pub fn new(backends: BackendRegistry, cache: Arc<CacheManager>) -> Self {
        Self {
            backends,
            cache,
            mirrors: Arc::new(LocalBackend::in_place()),
        }
    }

    /// Session wired from configuration: local files plus S3
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let s3 = S3Client::new(&config.s3).await;
        let backends = BackendRegistry::new()
            .with(Scheme::File, Arc::new(LocalBackend::new(&config.local)))
            .with(Scheme::S3, Arc::new(ObjectStoreBackend::new(s3)));
        let cache = Arc::new(CacheManager::new(&config.cache)?);

        info!("nstore session ready");
        Ok(Self::new(backends, cache))
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Open a resource.
    ///
    /// With `usecache` set, remote resources are served from a local mirror
    /// that is populated on first use and shared by later handles. Local
    /// resources are always opened directly.
    pub async fn access(&self, uri: &str, mode: &str, usecache: bool) -> Result<FileHandle> {
        let mode = AccessMode::parse(mode)?;
        let uri = ResourceUri::resolve(uri)?;
        let backend = self.backends.get(&uri)?;

        if usecache && uri.is_remote() {
            self.open_cached(uri, mode, backend).await
        } else {
            debug!("Opening {} directly with mode '{}'", uri, mode);
            let opened = open_stream(backend.as_ref(), &uri, mode).await?;
            Ok(opened.into_handle(uri, mode, None))
        }
    }

    /// Run `f` on a freshly opened handle.
    ///
    /// The handle is closed when `f` succeeds and aborted when it fails. A
    /// failed write is not uploaded from the cache, and a direct write is
    /// not committed where the backend stages writes.
    pub async fn with_access<T, F>(&self, uri: &str, mode: &str, usecache: bool, f: F) -> Result<T>
    where
        F: for<'h> FnOnce(&'h mut FileHandle) -> BoxFuture<'h, Result<T>>,
    {
        let mut handle = self.access(uri, mode, usecache).await?;
        match f(&mut handle).await {
            Ok(value) => {
                handle.close().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = handle.abort().await {
                    warn!("Failed to abort handle for {}: {}", uri, abort_err);
                }
                Err(e)
            }
        }
    }

    /// Flush and evict the cached mirror of `uri`
    pub async fn clean(&self, uri: &str) -> Result<()> {
        let uri = ResourceUri::resolve(uri)?;
        self.cache.clean(&uri).await
    }

    /// Clean every cache entry whose canonical URI matches `pattern`
    pub async fn clean_matching(&self, pattern: &str) -> Result<usize> {
        self.cache.clean_matching(pattern).await
    }

    pub async fn clean_all(&self) -> Result<usize> {
        self.cache.clean_all().await
    }

    /// Upload the cached mirror of `uri` if it has unsynced changes
    pub async fn flush(&self, uri: &str) -> Result<()> {
        let uri = ResourceUri::resolve(uri)?;
        self.cache.flush(&uri).await
    }

    pub async fn flush_all(&self) -> Result<()> {
        self.cache.flush_all().await
    }

    /// Cache entry for `uri`, if one exists
    pub async fn cache_entry(&self, uri: &str) -> Result<Option<CacheEntryInfo>> {
        let uri = ResourceUri::resolve(uri)?;
        Ok(self.cache.entry(&uri).await)
    }

    /// Copy the raw bytes of one resource to another.
    ///
    /// Pending cached writes to the source are flushed first and the
    /// destination's cache entry is cleaned, so the copy sees and leaves
    /// consistent content. Copying a resource onto itself does nothing.
    pub async fn copy(&self, src: &str, dst: &str) -> Result<u64> {
        let src = ResourceUri::resolve(src)?;
        let dst = ResourceUri::resolve(dst)?;

        if same_resource(&src, &dst).await {
            debug!("copy of {} onto itself skipped", src);
            return Ok(0);
        }

        let src_backend = self.backends.get(&src)?;
        let dst_backend = self.backends.get(&dst)?;

        self.cache.flush(&src).await?;
        self.cache.clean(&dst).await?;

        let mut reader = src_backend.open_read(&src).await?;
        let mut sink = dst_backend.open_write(&dst).await?;
        let copied = tokio::io::copy(&mut reader, &mut sink).await?;
        sink.commit().await?;

        info!("Copied {} bytes from {} to {}", copied, src, dst);
        Ok(copied)
    }

    /// Delete a resource and drop its cache entry
    pub async fn delete(&self, uri: &str) -> Result<()> {
        let uri = ResourceUri::resolve(uri)?;
        let backend = self.backends.get(&uri)?;

        self.cache.forget(&uri).await;

        backend.delete(&uri).await?;
        debug!("Deleted {}", uri);
        Ok(())
    }

    pub async fn exists(&self, uri: &str) -> Result<bool> {
        let uri = ResourceUri::resolve(uri)?;
        let backend = self.backends.get(&uri)?;
        backend.exists(&uri).await
    }

    async fn open_cached(
        &self,
        uri: ResourceUri,
        mode: AccessMode,
        backend: Arc<dyn Backend>,
    ) -> Result<FileHandle> {
        let entry = self.cache.acquire(&uri, mode, backend).await?;
        let mirror_uri = ResourceUri::local(entry.mirror_path().to_string_lossy().into_owned());
        debug!("Opening {} through mirror {:?}", uri, entry.mirror_path());

        match open_stream(self.mirrors.as_ref(), &mirror_uri, mode).await {
            Ok(opened) => {
                let lease = CacheLease::new(self.cache.clone(), entry);
                Ok(opened.into_handle(uri, mode, Some(lease)))
            }
            Err(e) => {
                if let Err(release_err) = self.cache.release_discarding(entry).await {
                    warn!("Failed to release {} after open error: {}", uri, release_err);
                }
                Err(e)
            }
        }
    }
}

/// A stream opened in one direction, not yet bound to a handle
enum Opened {
    Read(ReadStream),
    Write(WriteStream),
}

impl Opened {
    fn into_handle(self, uri: ResourceUri, mode: AccessMode, lease: Option<CacheLease>) -> FileHandle {
        match self {
            Opened::Read(stream) => FileHandle::reader(uri, mode, stream, lease),
            Opened::Write(sink) => FileHandle::writer(uri, mode, sink, lease),
        }
    }
}

/// Open `target` through `backend` in the direction of `mode`
async fn open_stream(backend: &dyn Backend, target: &ResourceUri, mode: AccessMode) -> Result<Opened> {
    Ok(match mode.direction {
        Direction::Read => Opened::Read(backend.open_read(target).await?),
        Direction::Write => Opened::Write(backend.open_write(target).await?),
        Direction::Append => Opened::Write(backend.open_append(target).await?),
    })
}

/// Whether two URIs name the same resource
async fn same_resource(a: &ResourceUri, b: &ResourceUri) -> bool {
    if a.canonical() == b.canonical() {
        return true;
    }
    if a.is_remote() || b.is_remote() {
        return false;
    }
    match (
        tokio::fs::canonicalize(Path::new(a.path())).await,
        tokio::fs::canonicalize(Path::new(b.path())).await,
    ) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}
