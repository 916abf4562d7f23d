//! On-disk layout of mirror files
//!
//! Mirrors live at `<root>/<scheme>/<digest>/<name>`, where `digest` is a
//! truncated SHA-256 of the canonical URI and `name` is the sanitized final
//! path component. The digest directory keeps distinct URIs apart; the name
//! keeps the file recognizable and preserves its extension.
//!
//! Mirrors withdrawn while still open are moved to `<root>/.withdrawn/`
//! under a unique name until their last holder lets go.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::config::CacheSettings;
use crate::uri::ResourceUri;

/// Hex characters of the URI digest used as directory name
const DIGEST_DIR_LEN: usize = 32;

/// Longest mirror file name kept from the URI
const MAX_NAME_LEN: usize = 128;

/// Block size used when hashing mirror content
const HASH_BLOCK_SIZE: usize = 128 * 1024;

/// Directory under the root holding withdrawn mirrors
const WITHDRAWN_DIR: &str = ".withdrawn";

/// Where mirror files are placed
#[derive(Debug)]
pub struct MirrorLayout {
    root: PathBuf,
    withdrawn: AtomicU64,
    /// Owns the root when it is a private temporary directory
    _temp: Option<TempDir>,
}

impl MirrorLayout {
    /// Layout from configuration; creates the root directory
    pub fn new(settings: &CacheSettings) -> io::Result<Self> {
        match &settings.root {
            Some(root) => Self::at(root.clone()),
            None => Self::temporary(),
        }
    }

    /// Layout rooted at an existing or creatable directory
    pub fn at(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            withdrawn: AtomicU64::new(0),
            _temp: None,
        })
    }

    /// Layout rooted at a fresh temporary directory, removed on drop
    pub fn temporary() -> io::Result<Self> {
        let temp = tempfile::Builder::new().prefix("nstore.").tempdir()?;
        debug!("Using temporary cache root {:?}", temp.path());
        Ok(Self {
            root: temp.path().to_path_buf(),
            withdrawn: AtomicU64::new(0),
            _temp: Some(temp),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic mirror location for a URI
    pub fn mirror_path(&self, uri: &ResourceUri) -> PathBuf {
        let digest = format!("{:x}", Sha256::digest(uri.canonical().as_bytes()));
        let name = sanitize_name(uri.file_name().unwrap_or("object"));

        self.root
            .join(uri.scheme().as_str())
            .join(&digest[..DIGEST_DIR_LEN])
            .join(name)
    }

    /// Remove a mirror file and its digest directory
    pub(crate) async fn remove_mirror(&self, mirror: &Path) -> io::Result<()> {
        match tokio::fs::remove_file(mirror).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let withdrawn = self.root.join(WITHDRAWN_DIR);
        if let Some(dir) = mirror
            .parent()
            .filter(|dir| dir.starts_with(&self.root) && *dir != withdrawn)
        {
            if let Err(e) = tokio::fs::remove_dir(dir).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove mirror directory {:?}: {}", dir, e);
                }
            }
        }
        Ok(())
    }

    /// Move a mirror off its deterministic path
    ///
    /// Open descriptors on the file keep working. Returns the new location.
    pub(crate) async fn set_aside(&self, mirror: &Path) -> io::Result<PathBuf> {
        let dir = self.root.join(WITHDRAWN_DIR);
        tokio::fs::create_dir_all(&dir).await?;

        let seq = self.withdrawn.fetch_add(1, Ordering::Relaxed);
        let name = mirror
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let moved = dir.join(format!("{}-{}-{}", std::process::id(), seq, name));

        tokio::fs::rename(mirror, &moved).await?;
        debug!("Moved mirror {:?} aside to {:?}", mirror, moved);

        if let Some(parent) = mirror.parent().filter(|dir| dir.starts_with(&self.root)) {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(moved)
    }

    /// Whether `path` is a mirror moved aside by [`set_aside`](Self::set_aside)
    pub(crate) fn is_set_aside(&self, path: &Path) -> bool {
        path.starts_with(self.root.join(WITHDRAWN_DIR))
    }
}

/// Staging path a download is written to before it becomes the mirror
pub(crate) fn part_path(mirror: &Path) -> PathBuf {
    let mut name = OsString::from(mirror.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

/// Hex SHA-256 of a file's content
pub(crate) async fn digest_file(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut block = vec![0u8; HASH_BLOCK_SIZE];

    loop {
        let n = file.read(&mut block).await?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

fn sanitize_name(name: &str) -> String {
    if name == "." || name == ".." {
        return "_".to_string();
    }
    name.chars()
        .take(MAX_NAME_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(raw: &str) -> ResourceUri {
        ResourceUri::resolve(raw).unwrap()
    }

    #[test]
    fn test_mirror_path_is_deterministic() {
        let layout = MirrorLayout::temporary().unwrap();
        let a = layout.mirror_path(&uri("s3://bucket/dir/a.txt"));
        let b = layout.mirror_path(&uri("S3://bucket/dir//a.txt"));
        assert_eq!(a, b);
        assert!(a.starts_with(layout.root().join("s3")));
        assert_eq!(a.file_name().unwrap(), "a.txt");
    }

    #[test]
    fn test_distinct_uris_get_distinct_mirrors() {
        let layout = MirrorLayout::temporary().unwrap();
        let paths = [
            layout.mirror_path(&uri("s3://bucket/a")),
            layout.mirror_path(&uri("s3://bucket/a/b")),
            layout.mirror_path(&uri("s3://other/a")),
            layout.mirror_path(&uri("s3://bucket/x/a")),
            layout.mirror_path(&uri("s3://bucket/A")),
        ];
        for (i, left) in paths.iter().enumerate() {
            for right in &paths[i + 1..] {
                assert_ne!(left, right);
            }
        }
    }

    #[test]
    fn test_names_are_sanitized() {
        assert_eq!(sanitize_name("report 2024?.csv.gz"), "report_2024_.csv.gz");
        assert_eq!(sanitize_name(".."), "_");
        assert_eq!(sanitize_name(&"x".repeat(500)).len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_part_path_keeps_extension() {
        let part = part_path(Path::new("/cache/s3/abc/data.json.gz"));
        assert_eq!(part, PathBuf::from("/cache/s3/abc/data.json.gz.part"));
    }

    #[tokio::test]
    async fn test_temporary_root_removed_on_drop() {
        let layout = MirrorLayout::temporary().unwrap();
        let root = layout.root().to_path_buf();
        assert!(root.exists());
        drop(layout);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_digest_and_remove_mirror() {
        let layout = MirrorLayout::temporary().unwrap();
        let mirror = layout.mirror_path(&uri("s3://bucket/file.bin"));
        tokio::fs::create_dir_all(mirror.parent().unwrap()).await.unwrap();
        tokio::fs::write(&mirror, b"abc").await.unwrap();

        assert_eq!(
            digest_file(&mirror).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        layout.remove_mirror(&mirror).await.unwrap();
        assert!(!mirror.exists());
        assert!(!mirror.parent().unwrap().exists());
        layout.remove_mirror(&mirror).await.unwrap();
    }

    #[tokio::test]
    async fn test_set_aside_frees_mirror_path() {
        let layout = MirrorLayout::temporary().unwrap();
        let mirror = layout.mirror_path(&uri("s3://bucket/held.txt"));
        tokio::fs::create_dir_all(mirror.parent().unwrap()).await.unwrap();
        tokio::fs::write(&mirror, b"old").await.unwrap();

        let first = layout.set_aside(&mirror).await.unwrap();
        assert!(!mirror.exists());
        assert!(layout.is_set_aside(&first));
        assert!(!layout.is_set_aside(&mirror));
        assert_eq!(tokio::fs::read(&first).await.unwrap(), b"old");

        tokio::fs::create_dir_all(mirror.parent().unwrap()).await.unwrap();
        tokio::fs::write(&mirror, b"new").await.unwrap();
        let second = layout.set_aside(&mirror).await.unwrap();
        assert_ne!(first, second);

        layout.remove_mirror(&first).await.unwrap();
        assert!(!first.exists());
        assert!(second.parent().unwrap().exists());
    }
}
