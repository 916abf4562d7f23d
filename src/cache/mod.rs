//! Local mirror cache for remote objects
//!
//! A cached access downloads the remote object once into a mirror file and
//! serves later opens of the same URI from that file. Writes go to the
//! mirror and are pushed back when the last session using it is released,
//! on an explicit flush, or when the entry is cleaned.

pub mod layout;
pub mod manager;

use std::fmt;
use std::path::PathBuf;

pub use layout::MirrorLayout;
pub use manager::{CacheManager, EntryLease};

/// Lifecycle state of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// No mirror on disk
    Absent,
    /// Mirror being materialized; never handed out in this state
    Populating,
    /// Mirror matches the last synced remote content
    Ready,
    /// Mirror may differ from the remote and must be uploaded
    Dirty,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryState::Absent => "absent",
            EntryState::Populating => "populating",
            EntryState::Ready => "ready",
            EntryState::Dirty => "dirty",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryInfo {
    /// Canonical URI the entry is keyed by
    pub uri: String,
    pub mirror_path: PathBuf,
    pub state: EntryState,
    /// Sessions currently holding the mirror
    pub refcount: usize,
    /// A `clean` is waiting for the refcount to reach zero
    pub pending_clean: bool,
}
