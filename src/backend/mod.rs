pub mod local;
pub mod object_store;

use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use crate::error::{NstoreError, Result};
use crate::uri::{ResourceUri, Scheme};

/// Byte stream returned by `open_read`
pub type ReadStream = Pin<Box<dyn AsyncRead + Send>>;

/// Writable stream whose content becomes durable only on `commit`
///
/// Dropping a sink without committing abandons the write. For stores
/// with whole-object semantics the remote object keeps its prior content.
#[async_trait]
pub trait WriteSink: AsyncWrite + Send + Unpin {
    /// Flush everything written so far and make it visible to readers
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Stream returned by `open_write` and `open_append`
pub type WriteStream = Box<dyn WriteSink>;

/// Uniform capability interface over storage backends
///
/// Backends are stateless with respect to individual resources: every
/// operation receives the resolved URI it applies to.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Open a resource for reading
    async fn open_read(&self, uri: &ResourceUri) -> Result<ReadStream>;

    /// Open a resource for writing, replacing any existing content
    async fn open_write(&self, uri: &ResourceUri) -> Result<WriteStream>;

    /// Open a resource for writing after its existing content
    ///
    /// A missing resource is treated as empty.
    async fn open_append(&self, uri: &ResourceUri) -> Result<WriteStream>;

    /// Remove a resource
    async fn delete(&self, uri: &ResourceUri) -> Result<()>;

    /// Check whether a resource exists
    async fn exists(&self, uri: &ResourceUri) -> Result<bool>;

    /// Copy a resource into a local file, returning the number of bytes
    ///
    /// Default implementation streams `open_read` into the file.
    async fn download_to(&self, uri: &ResourceUri, dest: &Path) -> Result<u64> {
        let mut stream = self.open_read(uri).await?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| NstoreError::from_io(e, &dest.to_string_lossy()))?;

        let copied = tokio::io::copy(&mut stream, &mut file).await?;
        file.sync_all().await?;

        trace!("{}: downloaded {} bytes of {} to {:?}", self.name(), copied, uri, dest);
        Ok(copied)
    }

    /// Replace a resource with the contents of a local file
    ///
    /// Default implementation streams the file through `open_write`.
    async fn upload_from(&self, src: &Path, uri: &ResourceUri) -> Result<()> {
        let mut file = tokio::fs::File::open(src)
            .await
            .map_err(|e| NstoreError::from_io(e, &src.to_string_lossy()))?;
        let mut sink = self.open_write(uri).await?;

        let copied = tokio::io::copy(&mut file, &mut sink).await?;
        sink.commit().await?;

        trace!("{}: uploaded {} bytes from {:?} to {}", self.name(), copied, src, uri);
        Ok(())
    }
}

/// Backend lookup by scheme
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<Scheme, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the backend serving `scheme`
    pub fn register(&mut self, scheme: Scheme, backend: Arc<dyn Backend>) -> &mut Self {
        self.backends.insert(scheme, backend);
        self
    }

    /// Builder-style `register`
    pub fn with(mut self, scheme: Scheme, backend: Arc<dyn Backend>) -> Self {
        self.register(scheme, backend);
        self
    }

    /// Backend for a resolved URI
    pub fn get(&self, uri: &ResourceUri) -> Result<Arc<dyn Backend>> {
        self.backends.get(&uri.scheme()).cloned().ok_or_else(|| {
            NstoreError::NotSupported(format!("no backend registered for scheme '{}'", uri.scheme()))
        })
    }

    pub fn contains(&self, scheme: Scheme) -> bool {
        self.backends.contains_key(&scheme)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;

    #[test]
    fn test_registry_lookup() {
        let registry = BackendRegistry::new().with(Scheme::File, Arc::new(LocalBackend::default()));

        let local = ResourceUri::resolve("a/b.txt").unwrap();
        assert_eq!(registry.get(&local).unwrap().name(), "local");

        let remote = ResourceUri::resolve("s3://bucket/key").unwrap();
        assert!(matches!(registry.get(&remote), Err(NstoreError::NotSupported(_))));
        assert!(!registry.contains(Scheme::S3));
    }
}
