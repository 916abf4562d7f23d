//! nstore: file-like access to local and remote storage through one interface
//!
//! Callers open resources by URI and get back a [`FileHandle`] regardless of
//! where the bytes live. Remote resources can be served from a local mirror
//! cache that is populated on first open, reused on reopen, and pushed back
//! when the last handle on it is closed.
//!
//! # Architecture
//!
//! - **URI resolution** ([`uri`]): splits a URI into scheme, container and
//!   backend-local path.
//! - **Backends** ([`backend`]): the `Backend` trait with local-filesystem
//!   and object-store implementations, registered per scheme.
//! - **Object clients** ([`client`]): the wire-level collaborator of the
//!   object-store backend (S3, or an in-process store).
//! - **Cache** ([`cache`]): mirror files keyed by canonical URI, with
//!   reference counting and explicit invalidation.
//! - **Sessions** ([`session`]): [`Nstore`] ties the pieces together.
//!
//! # Example
//!
//! ```no_run
//! use nstore::config::Config;
//! use nstore::Nstore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Nstore::from_config(&Config::default()).await?;
//!
//! let mut handle = store.access("s3://bucket/report.txt", "w", true).await?;
//! handle.write_text("hello").await?;
//! handle.close().await?;
//!
//! store.clean("s3://bucket/report.txt").await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod env;
pub mod error;
pub mod handle;
pub mod mode;
pub mod session;
pub mod uri;

pub use error::{NstoreError, Result};
pub use handle::FileHandle;
pub use mode::AccessMode;
pub use session::Nstore;
pub use uri::{ResourceUri, Scheme};
