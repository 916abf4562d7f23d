//! Shared fixtures for integration tests
//!
//! `FlakyClient` wraps the in-process object store and can be told to fail
//! the next N requests of a kind, which makes retry paths observable.

#![allow(dead_code)]

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::io::{AsyncRead, ReadBuf};

use nstore::backend::local::LocalBackend;
use nstore::backend::object_store::ObjectStoreBackend;
use nstore::backend::{BackendRegistry, ReadStream};
use nstore::cache::{CacheManager, MirrorLayout};
use nstore::client::memory::MemoryObjectClient;
use nstore::client::{ObjectClient, ObjectInfo};
use nstore::{Nstore, NstoreError, Scheme};

/// Object client with injectable transient failures
pub struct FlakyClient {
    inner: MemoryObjectClient,
    failing_gets: AtomicUsize,
    failing_puts: AtomicUsize,
    failing_streams: AtomicUsize,
}

impl FlakyClient {
    pub fn new(inner: MemoryObjectClient) -> Self {
        Self {
            inner,
            failing_gets: AtomicUsize::new(0),
            failing_puts: AtomicUsize::new(0),
            failing_streams: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &MemoryObjectClient {
        &self.inner
    }

    /// Fail the next `n` downloads with `BackendUnavailable`
    pub fn fail_gets(&self, n: usize) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` uploads with `BackendUnavailable`
    pub fn fail_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Let the next `n` downloads start, then drop the connection mid-body
    pub fn fail_streams(&self, n: usize) {
        self.failing_streams.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectClient for FlakyClient {
    async fn get_object(&self, bucket: &str, key: &str) -> nstore::Result<ReadStream> {
        if Self::take_failure(&self.failing_gets) {
            return Err(NstoreError::BackendUnavailable(format!(
                "injected get failure for {}/{}",
                bucket, key
            )));
        }
        if Self::take_failure(&self.failing_streams) {
            return Ok(Box::pin(ResetStream));
        }
        self.inner.get_object(bucket, key).await
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> nstore::Result<()> {
        if Self::take_failure(&self.failing_puts) {
            return Err(NstoreError::BackendUnavailable(format!(
                "injected put failure for {}/{}",
                bucket, key
            )));
        }
        self.inner.put_object(bucket, key, body).await
    }

    async fn head_object(&self, bucket: &str, key: &str) -> nstore::Result<Option<ObjectInfo>> {
        self.inner.head_object(bucket, key).await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> nstore::Result<()> {
        self.inner.delete_object(bucket, key).await
    }
}

/// Body whose connection is reset on the first read
struct ResetStream;

impl AsyncRead for ResetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )))
    }
}

/// A session over a scratch directory and an in-process object store
pub struct TestStore {
    pub store: Nstore,
    pub client: Arc<FlakyClient>,
    pub dir: TempDir,
}

impl TestStore {
    pub fn new() -> Self {
        Self::with_client(MemoryObjectClient::new())
    }

    /// Every object request is delayed by `latency`
    pub fn with_latency(latency: Duration) -> Self {
        Self::with_client(MemoryObjectClient::with_latency(latency))
    }

    fn with_client(inner: MemoryObjectClient) -> Self {
        let dir = tempfile::tempdir().expect("scratch dir");
        let client = Arc::new(FlakyClient::new(inner));

        let backends = BackendRegistry::new()
            .with(Scheme::File, Arc::new(LocalBackend::default()))
            .with(Scheme::S3, Arc::new(ObjectStoreBackend::from_arc(client.clone())));
        let layout = MirrorLayout::at(dir.path().join("cache")).expect("cache root");
        let cache = Arc::new(CacheManager::with_layout(layout));

        Self {
            store: Nstore::new(backends, cache),
            client,
            dir,
        }
    }

    pub fn memory(&self) -> &MemoryObjectClient {
        self.client.inner()
    }

    /// Path under the scratch directory, as a URI string
    pub fn local(&self, name: &str) -> String {
        self.path(name).to_string_lossy().into_owned()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Read a whole resource as text, bypassing the cache
pub async fn read_text(store: &Nstore, uri: &str) -> nstore::Result<String> {
    let mut handle = store.access(uri, "r", false).await?;
    let text = handle.read_text().await?;
    handle.close().await?;
    Ok(text)
}

/// Write a whole resource as text
pub async fn write_text(store: &Nstore, uri: &str, text: &str, usecache: bool) -> nstore::Result<()> {
    let mut handle = store.access(uri, "w", usecache).await?;
    handle.write_text(text).await?;
    handle.close().await
}
