//! Object storage client collaborators
//!
//! The object-store backend does not speak any wire protocol itself; it
//! drives an [`ObjectClient`], which maps four whole-object operations onto
//! a concrete service. [`s3::S3Client`] talks to S3 or an S3-compatible
//! store; [`memory::MemoryObjectClient`] keeps objects in process.

pub mod memory;
pub mod s3;

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::backend::ReadStream;
use crate::error::{NstoreError, Result};

/// Object metadata returned by `head_object`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object size in bytes
    pub size: u64,
    /// Entity tag, when the service reports one
    pub etag: Option<String>,
}

/// Whole-object operations against a bucket-addressed store
///
/// Errors must already be classified: a missing bucket or key is
/// `NotFound`, credential problems are `Auth`, and transient transport or
/// service faults are `BackendUnavailable`.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Open the object body as a byte stream
    async fn get_object(&self, bucket: &str, key: &str) -> Result<ReadStream>;

    /// Replace the object with `body`
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<()>;

    /// Replace the object with the contents of a local file
    ///
    /// Default implementation reads the file into memory and calls
    /// `put_object`.
    async fn put_object_from_file(&self, bucket: &str, key: &str, file: &Path) -> Result<()> {
        let body = tokio::fs::read(file)
            .await
            .map_err(|e| NstoreError::from_io(e, &file.to_string_lossy()))?;
        self.put_object(bucket, key, Bytes::from(body)).await
    }

    /// Object metadata, or `None` when the object does not exist
    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>>;

    /// Remove the object; removing an absent object succeeds
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;
}
