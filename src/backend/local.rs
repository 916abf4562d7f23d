//! Local filesystem backend
//!
//! Writes are staged by default: bytes go to a hidden temporary file in the
//! target's directory, which replaces the target only on commit.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tempfile::TempPath;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::backend::{Backend, ReadStream, WriteSink, WriteStream};
use crate::config::LocalConfig;
use crate::error::{NstoreError, Result};
use crate::uri::ResourceUri;

/// Backend that reads and writes files on the local machine
///
/// Relative paths resolve against the process working directory.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    create_parent_dirs: bool,
    atomic_writes: bool,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new(&LocalConfig::default())
    }
}

impl LocalBackend {
    pub fn new(config: &LocalConfig) -> Self {
        Self {
            create_parent_dirs: config.create_parent_dirs,
            atomic_writes: config.atomic_writes,
        }
    }

    /// Backend writing straight into the target file
    ///
    /// Used for cache mirrors, whose content must be visible to a flush
    /// while the handle writing them is still open.
    pub fn in_place() -> Self {
        Self {
            create_parent_dirs: true,
            atomic_writes: false,
        }
    }

    async fn prepare_parent(&self, path: &Path) -> Result<()> {
        if !self.create_parent_dirs {
            return Ok(());
        }
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| NstoreError::from_io(e, &parent.to_string_lossy()))
            }
            _ => Ok(()),
        }
    }

    async fn open_for_write(&self, uri: &ResourceUri, append: bool) -> Result<WriteStream> {
        let path = Path::new(uri.path());
        self.prepare_parent(path).await?;

        if self.atomic_writes {
            return Self::open_staged(uri, append).await;
        }

        let mut options = OpenOptions::new();
        options.create(true);
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }

        let file = options
            .open(path)
            .await
            .map_err(|e| NstoreError::from_io(e, uri.path()))?;

        debug!("local: opened {:?} for {}", path, if append { "append" } else { "write" });
        Ok(Box::new(LocalWriter { file, staged: None }))
    }

    async fn open_staged(uri: &ResourceUri, append: bool) -> Result<WriteStream> {
        let target = PathBuf::from(uri.path());
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let temp = tempfile::Builder::new()
            .prefix(".nstore-")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|e| NstoreError::from_io(e, &dir.to_string_lossy()))?;
        let (file, temp) = temp.into_parts();
        let mut file = File::from_std(file);

        // Keep the permissions of the file being replaced
        let existing = match tokio::fs::metadata(&target).await {
            Ok(meta) => Some(meta.permissions()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(NstoreError::from_io(e, uri.path())),
        };
        if let Some(permissions) = existing.or_else(default_permissions) {
            tokio::fs::set_permissions(&temp, permissions)
                .await
                .map_err(|e| NstoreError::from_io(e, &temp.to_string_lossy()))?;
        }

        if append {
            match File::open(&target).await {
                Ok(mut current) => {
                    let copied = tokio::io::copy(&mut current, &mut file).await?;
                    trace!("local: staged {} existing bytes of {:?}", copied, target);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(NstoreError::from_io(e, uri.path())),
            }
        }

        debug!(
            "local: staging {} of {:?} in {:?}",
            if append { "append" } else { "write" },
            target,
            temp
        );
        Ok(Box::new(LocalWriter {
            file,
            staged: Some(Staged { temp, target }),
        }))
    }
}

/// Mode for a new file; temporary files are created owner-only
#[cfg(unix)]
fn default_permissions() -> Option<std::fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(std::fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn default_permissions() -> Option<std::fs::Permissions> {
    None
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn open_read(&self, uri: &ResourceUri) -> Result<ReadStream> {
        trace!("local: open_read {:?}", uri.path());
        let file = File::open(uri.path())
            .await
            .map_err(|e| NstoreError::from_io(e, uri.path()))?;
        Ok(Box::pin(file))
    }

    async fn open_write(&self, uri: &ResourceUri) -> Result<WriteStream> {
        self.open_for_write(uri, false).await
    }

    async fn open_append(&self, uri: &ResourceUri) -> Result<WriteStream> {
        self.open_for_write(uri, true).await
    }

    async fn delete(&self, uri: &ResourceUri) -> Result<()> {
        match tokio::fs::remove_file(uri.path()).await {
            Ok(()) => {
                debug!("local: deleted {:?}", uri.path());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!("local: delete of absent {:?} ignored", uri.path());
                Ok(())
            }
            Err(e) => Err(NstoreError::Io(e)),
        }
    }

    async fn exists(&self, uri: &ResourceUri) -> Result<bool> {
        Ok(tokio::fs::try_exists(uri.path()).await?)
    }
}

/// Temporary file standing in for `target` until commit
struct Staged {
    /// Removed on drop unless persisted
    temp: TempPath,
    target: PathBuf,
}

/// Write half over a local file
///
/// Commit flushes buffered data and, for a staged write, moves the
/// temporary file over the target. Dropping a staged writer removes its
/// temporary file and leaves the target as it was.
struct LocalWriter {
    file: File,
    staged: Option<Staged>,
}

impl AsyncWrite for LocalWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.file).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

#[async_trait]
impl WriteSink for LocalWriter {
    async fn commit(self: Box<Self>) -> Result<()> {
        let LocalWriter { mut file, staged } = *self;
        file.flush().await?;

        let Some(Staged { temp, target }) = staged else {
            return Ok(());
        };
        file.sync_all()
            .await
            .map_err(|e| NstoreError::from_io(e, &temp.to_string_lossy()))?;
        drop(file);

        temp.persist(&target).map_err(|e| {
            warn!("local: failed to move staged write into {:?}: {}", target, e.error);
            NstoreError::from_io(e.error, &target.to_string_lossy())
        })?;
        trace!("local: committed {:?}", target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn uri_in(dir: &Path, name: &str) -> ResourceUri {
        ResourceUri::local(dir.join(name).to_string_lossy().into_owned())
    }

    async fn read_all(backend: &LocalBackend, uri: &ResourceUri) -> Vec<u8> {
        let mut stream = backend.open_read(uri).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::default();
        let uri = uri_in(dir.path(), "nested/deeper/file.txt");

        let mut sink = backend.open_write(&uri).await.unwrap();
        sink.write_all(b"hello").await.unwrap();
        sink.commit().await.unwrap();

        assert_eq!(read_all(&backend, &uri).await, b"hello");
    }

    #[tokio::test]
    async fn test_write_truncates_and_append_extends() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::default();
        let uri = uri_in(dir.path(), "file.txt");

        let mut sink = backend.open_write(&uri).await.unwrap();
        sink.write_all(b"first version").await.unwrap();
        sink.commit().await.unwrap();

        let mut sink = backend.open_write(&uri).await.unwrap();
        sink.write_all(b"second").await.unwrap();
        sink.commit().await.unwrap();
        assert_eq!(read_all(&backend, &uri).await, b"second");

        let mut sink = backend.open_append(&uri).await.unwrap();
        sink.write_all(b"+more").await.unwrap();
        sink.commit().await.unwrap();
        assert_eq!(read_all(&backend, &uri).await, b"second+more");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::default();
        let result = backend.open_read(&uri_in(dir.path(), "missing/file.txt")).await;
        assert!(matches!(result, Err(NstoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_parent_dirs_not_created_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(&LocalConfig {
            create_parent_dirs: false,
            ..LocalConfig::default()
        });
        let result = backend.open_write(&uri_in(dir.path(), "absent/file.txt")).await;
        assert!(matches!(result, Err(NstoreError::NotFound(_))));
    }

    fn dir_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_uncommitted_write_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::default();
        let uri = uri_in(dir.path(), "file.txt");
        std::fs::write(uri.path(), b"original").unwrap();

        let mut sink = backend.open_write(&uri).await.unwrap();
        sink.write_all(b"replacement").await.unwrap();
        sink.flush().await.unwrap();
        assert_eq!(read_all(&backend, &uri).await, b"original");
        drop(sink);

        let mut sink = backend.open_append(&uri).await.unwrap();
        sink.write_all(b"+tail").await.unwrap();
        drop(sink);

        assert_eq!(read_all(&backend, &uri).await, b"original");
        assert_eq!(dir_names(dir.path()), vec!["file.txt".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_commit_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::default();
        let uri = uri_in(dir.path(), "script.sh");
        std::fs::write(uri.path(), b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(uri.path(), std::fs::Permissions::from_mode(0o750)).unwrap();

        let mut sink = backend.open_append(&uri).await.unwrap();
        sink.write_all(b"exit 0\n").await.unwrap();
        sink.commit().await.unwrap();

        let mode = std::fs::metadata(uri.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
        assert_eq!(read_all(&backend, &uri).await, b"#!/bin/sh\nexit 0\n");

        let fresh = uri_in(dir.path(), "fresh.txt");
        let mut sink = backend.open_write(&fresh).await.unwrap();
        sink.write_all(b"x").await.unwrap();
        sink.commit().await.unwrap();
        let mode = std::fs::metadata(fresh.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[tokio::test]
    async fn test_in_place_writes_are_visible_before_commit() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::in_place();
        let uri = uri_in(dir.path(), "mirror.bin");

        let mut sink = backend.open_write(&uri).await.unwrap();
        sink.write_all(b"early").await.unwrap();
        sink.flush().await.unwrap();
        assert_eq!(read_all(&backend, &uri).await, b"early");
        sink.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::default();
        let uri = uri_in(dir.path(), "file.txt");
        std::fs::write(uri.path(), b"x").unwrap();

        assert!(backend.exists(&uri).await.unwrap());
        backend.delete(&uri).await.unwrap();
        assert!(!backend.exists(&uri).await.unwrap());
        backend.delete(&uri).await.unwrap();
    }

    #[tokio::test]
    async fn test_download_and_upload_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::default();
        let src = uri_in(dir.path(), "src.bin");
        std::fs::write(src.path(), b"\x00\x01\x02payload").unwrap();

        let staged = dir.path().join("staged.bin");
        let copied = backend.download_to(&src, &staged).await.unwrap();
        assert_eq!(copied, 10);

        let dst = uri_in(dir.path(), "out/dst.bin");
        backend.upload_from(&staged, &dst).await.unwrap();
        assert_eq!(read_all(&backend, &dst).await, b"\x00\x01\x02payload");
    }
}
