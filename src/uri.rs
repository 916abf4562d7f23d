//! URI resolution
//!
//! Splits an access string of the form `[scheme "://"] path` into a backend
//! selector and a backend-local path. Strings without a `scheme://` prefix
//! are local filesystem paths, taken verbatim.

use std::fmt;

use crate::error::{NstoreError, Result};

const SCHEME_SEPARATOR: &str = "://";

/// Storage scheme selecting a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    File,
    S3,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::File => "file",
            Scheme::S3 => "s3",
        }
    }

    /// Whether objects of this scheme live off the local machine
    pub fn is_remote(&self) -> bool {
        !matches!(self, Scheme::File)
    }

    fn parse(raw: &str, name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "file" => Ok(Scheme::File),
            "s3" => Ok(Scheme::S3),
            "gcs" | "gs" | "azure" | "az" | "ftp" | "http" | "https" => Err(
                NstoreError::malformed(raw, format!("no backend available for scheme '{}'", name)),
            ),
            _ => Err(NstoreError::malformed(
                raw,
                format!("unrecognized scheme '{}'", name),
            )),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed resource location
///
/// For object-store schemes `container` holds the bucket and `path` the
/// object key. For local files `container` is `None` and `path` is the
/// filesystem path exactly as given.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceUri {
    scheme: Scheme,
    container: Option<String>,
    path: String,
}

impl ResourceUri {
    /// Parse an access string
    pub fn resolve(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(NstoreError::malformed(raw, "empty URI"));
        }

        let Some((name, rest)) = raw.split_once(SCHEME_SEPARATOR) else {
            return Ok(Self::local(raw));
        };

        match Scheme::parse(raw, name)? {
            Scheme::File => {
                if rest.is_empty() {
                    return Err(NstoreError::malformed(raw, "empty path"));
                }
                Ok(Self::local(rest))
            }
            Scheme::S3 => {
                let rest = rest.trim_start_matches('/');
                let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(NstoreError::malformed(raw, "missing bucket name"));
                }
                if key.is_empty() {
                    return Err(NstoreError::malformed(raw, "missing object key"));
                }
                Ok(Self {
                    scheme: Scheme::S3,
                    container: Some(bucket.to_string()),
                    path: key.to_string(),
                })
            }
        }
    }

    /// A local filesystem location
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::File,
            container: None,
            path: path.into(),
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Bucket or container name, for object-store schemes
    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }

    /// Backend-local path (object key for object stores)
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_remote(&self) -> bool {
        self.scheme.is_remote()
    }

    /// Final path component, if any
    pub fn file_name(&self) -> Option<&str> {
        self.path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
    }

    /// Whether the resource name marks gzip-compressed content
    pub fn is_gzip(&self) -> bool {
        self.file_name()
            .map(|name| name.to_ascii_lowercase().ends_with(".gz"))
            .unwrap_or(false)
    }

    /// Normalized string form used as a cache key
    ///
    /// The scheme is lowercase, path case is preserved, and runs of `/`
    /// collapse to one.
    pub fn canonical(&self) -> String {
        let mut out = String::with_capacity(self.path.len() + 16);
        out.push_str(self.scheme.as_str());
        out.push_str(SCHEME_SEPARATOR);
        if let Some(container) = &self.container {
            out.push_str(container);
            out.push('/');
        }
        push_collapsed(&mut out, &self.path);
        out
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.scheme, &self.container) {
            (Scheme::File, _) => f.write_str(&self.path),
            (scheme, Some(container)) => write!(f, "{}://{}/{}", scheme, container, self.path),
            (scheme, None) => write!(f, "{}://{}", scheme, self.path),
        }
    }
}

fn push_collapsed(out: &mut String, path: &str) {
    let mut previous_slash = out.ends_with('/');
    for c in path.chars() {
        if c == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_paths_are_local_and_unchanged() {
        for raw in ["data/file.txt", "/abs/path/x.csv", "./rel", "C:odd name", "a//b"] {
            let uri = ResourceUri::resolve(raw).unwrap();
            assert_eq!(uri.scheme(), Scheme::File);
            assert_eq!(uri.path(), raw);
            assert_eq!(uri.container(), None);
        }
    }

    #[test]
    fn test_s3_bucket_and_key() {
        let uri = ResourceUri::resolve("s3://bucket/key/parts").unwrap();
        assert_eq!(uri.scheme(), Scheme::S3);
        assert_eq!(uri.container(), Some("bucket"));
        assert_eq!(uri.path(), "key/parts");
        assert!(uri.is_remote());
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        let uri = ResourceUri::resolve("S3://Bucket/Key.TXT").unwrap();
        assert_eq!(uri.scheme(), Scheme::S3);
        assert_eq!(uri.canonical(), "s3://Bucket/Key.TXT");
    }

    #[test]
    fn test_explicit_file_scheme() {
        let uri = ResourceUri::resolve("file:///tmp/x").unwrap();
        assert_eq!(uri.scheme(), Scheme::File);
        assert_eq!(uri.path(), "/tmp/x");
    }

    #[test]
    fn test_malformed_inputs() {
        for raw in ["", "ftp://host/x", "gopher://x", "s3://", "s3://bucket", "s3://bucket/", "file://"] {
            let err = ResourceUri::resolve(raw).unwrap_err();
            assert!(
                matches!(err, NstoreError::MalformedUri { .. }),
                "{:?} should be malformed, got {:?}",
                raw,
                err
            );
        }
    }

    #[test]
    fn test_canonical_collapses_separators() {
        let a = ResourceUri::resolve("s3://bucket/dir//nested///a.txt").unwrap();
        let b = ResourceUri::resolve("S3://bucket/dir/nested/a.txt").unwrap();
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.canonical(), "s3://bucket/dir/nested/a.txt");
    }

    #[test]
    fn test_display_round_trips() {
        let raw = "s3://bucket/dir/a.txt";
        assert_eq!(ResourceUri::resolve(raw).unwrap().to_string(), raw);
        assert_eq!(ResourceUri::resolve("local/a.txt").unwrap().to_string(), "local/a.txt");
    }

    #[test]
    fn test_gzip_detection() {
        assert!(ResourceUri::resolve("s3://b/logs/day.json.GZ").unwrap().is_gzip());
        assert!(!ResourceUri::resolve("s3://b/logs/day.json").unwrap().is_gzip());
        assert_eq!(
            ResourceUri::resolve("s3://b/logs/day.json").unwrap().file_name(),
            Some("day.json")
        );
    }
}
