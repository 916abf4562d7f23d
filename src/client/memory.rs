//! In-process object client
//!
//! Keeps objects in a hash map. Useful for tests and for wiring a session
//! without network access; request counters make cache behaviour
//! observable.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::backend::ReadStream;
use crate::client::{ObjectClient, ObjectInfo};
use crate::error::{NstoreError, Result};

/// Object client backed by process memory
#[derive(Default)]
pub struct MemoryObjectClient {
    objects: Mutex<HashMap<(String, String), Bytes>>,
    /// Artificial delay applied to every request
    latency: Option<Duration>,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

impl MemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every request by `latency`
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Store an object directly, bypassing request accounting
    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.objects
            .lock()
            .insert((bucket.to_string(), key.to_string()), data.into());
    }

    /// Current content of an object, bypassing request accounting
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Number of `get_object` calls served
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of successful uploads
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ObjectClient for MemoryObjectClient {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ReadStream> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        trace!("memory get_object: bucket={} key={}", bucket, key);

        let data = self
            .object(bucket, key)
            .ok_or_else(|| NstoreError::NotFound(format!("s3://{}/{}", bucket, key)))?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.delay().await;
        trace!("memory put_object: bucket={} key={} size={}", bucket, key, body.len());

        self.insert(bucket, key, body);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>> {
        self.delay().await;
        Ok(self.object(bucket, key).map(|data| ObjectInfo {
            size: data.len() as u64,
            etag: None,
        }))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.delay().await;
        self.objects
            .lock()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_put_get_and_counters() {
        let client = MemoryObjectClient::new();
        client.put_object("b", "k", Bytes::from_static(b"data")).await.unwrap();

        let mut stream = client.get_object("b", "k").await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, b"data");
        assert_eq!(client.get_count(), 1);
        assert_eq!(client.put_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let client = MemoryObjectClient::new();
        let result = client.get_object("b", "missing").await;
        assert!(matches!(result, Err(NstoreError::NotFound(_))));
        assert_eq!(client.head_object("b", "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let client = MemoryObjectClient::new();
        client.insert("b", "k", "x");
        client.delete_object("b", "k").await.unwrap();
        client.delete_object("b", "k").await.unwrap();
        assert!(client.object("b", "k").is_none());
    }
}
