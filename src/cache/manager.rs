//! Cache entry registry and mirror lifecycle
//!
//! Every canonical URI maps to one slot. All state transitions of an entry
//! happen while its slot lock is held, so a download or upload in flight
//! blocks other `acquire`/`release`/`clean` calls on the same URI but never
//! on other URIs. A slot removed from the registry is flagged; callers that
//! were queued on it start over with a fresh slot.
//!
//! An entry that must not be reused while sessions still hold it (after an
//! aborted write or a delete) is withdrawn: its mirror moves aside, the slot
//! leaves the registry, and each holder releases it through its own lease.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use globset::Glob;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, trace, warn};

use crate::backend::Backend;
use crate::cache::layout::{digest_file, part_path};
use crate::cache::{CacheEntryInfo, EntryState, MirrorLayout};
use crate::config::CacheSettings;
use crate::error::{NstoreError, Result};
use crate::mode::{AccessMode, Direction};
use crate::uri::ResourceUri;

/// Registry of mirrored remote objects
///
/// One manager is meant to serve a whole process: entries created by one
/// session are visible to `clean` calls from any other holder of the same
/// manager.
pub struct CacheManager {
    layout: MirrorLayout,
    entries: DashMap<String, Arc<EntrySlot>>,
}

type EntrySlot = Mutex<Entry>;

/// A reference on one cache entry
///
/// Returned by [`CacheManager::acquire`] and handed back exactly once
/// through `release` or `release_discarding`. The lease pins its own slot,
/// so it is released against the entry it was taken on even after that
/// entry has left the registry.
pub struct EntryLease {
    slot: Arc<EntrySlot>,
    key: String,
    mirror: PathBuf,
    writes: bool,
}

impl EntryLease {
    /// Mirror file at the time the lease was taken
    pub fn mirror_path(&self) -> &Path {
        &self.mirror
    }

    /// Canonical URI of the entry
    pub fn key(&self) -> &str {
        &self.key
    }
}

struct Entry {
    key: String,
    uri: ResourceUri,
    backend: Arc<dyn Backend>,
    mirror: PathBuf,
    state: EntryState,
    refcount: usize,
    pending_clean: bool,
    /// Withdrawn; the mirror is dropped without upload on last release
    pending_discard: bool,
    /// SHA-256 of the content last downloaded or uploaded
    synced_digest: Option<String>,
    /// Slot has been dropped from the registry
    removed: bool,
}

impl CacheManager {
    /// Create a manager from configuration
    pub fn new(settings: &CacheSettings) -> Result<Self> {
        Ok(Self::with_layout(MirrorLayout::new(settings)?))
    }

    pub fn with_layout(layout: MirrorLayout) -> Self {
        info!("Mirror cache rooted at {:?}", layout.root());
        Self {
            layout,
            entries: DashMap::new(),
        }
    }

    pub fn layout(&self) -> &MirrorLayout {
        &self.layout
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take a reference on the mirror of `uri`, populating it if needed.
    ///
    /// Read and append access download the remote object the first time;
    /// write access skips the download because the caller truncates the
    /// mirror anyway. Write and append mark the entry dirty immediately.
    /// Concurrent callers on the same URI wait for an in-flight population
    /// instead of starting their own.
    pub async fn acquire(
        &self,
        uri: &ResourceUri,
        mode: AccessMode,
        backend: Arc<dyn Backend>,
    ) -> Result<EntryLease> {
        let key = uri.canonical();

        loop {
            let slot = self.slot_or_insert(&key, uri, &backend);
            let mut entry = slot.lock().await;
            if entry.removed {
                trace!("Slot for {} was withdrawn while waiting, retrying", key);
                continue;
            }

            // Populating here means an earlier populate was cancelled
            // midway; start it over.
            if matches!(entry.state, EntryState::Absent | EntryState::Populating) {
                if let Err(e) = self.populate(&mut entry, mode).await {
                    warn!("Populating mirror for {} failed: {}", key, e);
                    self.discard_mirror(&mut entry, &slot).await;
                    return Err(e);
                }
            }

            if mode.is_write() {
                entry.state = EntryState::Dirty;
            }
            entry.refcount += 1;
            trace!(
                "acquire {}: mode={} state={} refcount={}",
                key,
                mode,
                entry.state,
                entry.refcount
            );

            let mirror = entry.mirror.clone();
            drop(entry);
            return Ok(EntryLease {
                slot,
                key,
                mirror,
                writes: mode.is_write(),
            });
        }
    }

    /// Hand back a reference taken by `acquire`.
    ///
    /// When the last reference goes away a dirty mirror is uploaded, and a
    /// deferred `clean` is carried out. A failed upload leaves the entry
    /// dirty so a later `flush` or `clean` can retry. A writer whose entry
    /// was withdrawn in the meantime gets `CacheSync`: its changes were not
    /// stored.
    pub async fn release(&self, lease: EntryLease) -> Result<()> {
        let EntryLease {
            slot, key, writes, ..
        } = lease;
        let mut entry = slot.lock().await;
        let last = Self::decrement(&mut entry);

        if entry.pending_discard {
            if last {
                self.discard_mirror(&mut entry, &slot).await;
            }
            if writes {
                return Err(NstoreError::CacheSync {
                    uri: key,
                    message: "mirror was withdrawn before upload; changes were not stored"
                        .to_string(),
                });
            }
            return Ok(());
        }

        if !last {
            return Ok(());
        }

        if entry.state == EntryState::Dirty {
            self.sync(&mut entry).await?;
        }

        if entry.pending_clean {
            self.evict(&mut entry, &slot).await?;
        }

        Ok(())
    }

    /// Hand back a reference whose session was abandoned before closing.
    ///
    /// A writer's mirror is no longer trusted. The entry is withdrawn at
    /// once so later `acquire` calls start from a fresh download; other
    /// sessions still holding it keep the old mirror until they release,
    /// and nothing from it is uploaded.
    pub async fn release_discarding(&self, lease: EntryLease) -> Result<()> {
        if !lease.writes {
            return self.release(lease).await;
        }

        let EntryLease { slot, key, .. } = lease;
        let mut entry = slot.lock().await;

        if Self::decrement(&mut entry) {
            warn!("Discarding mirror for {} after an aborted write", key);
            self.discard_mirror(&mut entry, &slot).await;
        } else {
            warn!(
                "Withdrawing mirror for {} after an aborted write; {} session(s) still hold it",
                key, entry.refcount
            );
            self.withdraw(&mut entry, &slot).await;
        }
        Ok(())
    }

    /// Drop the mirror of a resource that is going away, without uploading.
    ///
    /// An entry still held is withdrawn: its holders keep their mirror
    /// until they release it, and writers among them are told their changes
    /// were not stored.
    pub async fn forget(&self, uri: &ResourceUri) {
        let key = uri.canonical();
        let Some((slot, mut entry)) = self.lock_existing(&key).await else {
            return;
        };

        if entry.refcount > 0 {
            warn!(
                "{} still held by {} session(s); withdrawing its mirror",
                key, entry.refcount
            );
            self.withdraw(&mut entry, &slot).await;
            return;
        }

        debug!("Forgetting cache entry for {}", key);
        self.discard_mirror(&mut entry, &slot).await;
    }

    /// Evict the mirror for `uri`.
    ///
    /// A dirty mirror is uploaded before it is deleted. While sessions
    /// still hold the entry, eviction is deferred to the last `release`.
    /// Cleaning a URI without an entry does nothing.
    pub async fn clean(&self, uri: &ResourceUri) -> Result<()> {
        self.clean_key(&uri.canonical()).await
    }

    /// Clean every entry whose canonical URI matches a glob pattern,
    /// returning how many entries matched.
    pub async fn clean_matching(&self, pattern: &str) -> Result<usize> {
        let matcher = Glob::new(pattern)
            .map_err(|e| NstoreError::malformed(pattern, format!("invalid glob pattern: {}", e)))?
            .compile_matcher();

        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|slot| matcher.is_match(slot.key()))
            .map(|slot| slot.key().clone())
            .collect();

        self.clean_keys(keys).await
    }

    /// Clean every entry
    pub async fn clean_all(&self) -> Result<usize> {
        let keys: Vec<String> = self.entries.iter().map(|slot| slot.key().clone()).collect();
        self.clean_keys(keys).await
    }

    /// Upload the mirror of `uri` if it is dirty, keeping it cached
    pub async fn flush(&self, uri: &ResourceUri) -> Result<()> {
        self.flush_key(&uri.canonical()).await
    }

    /// Upload every dirty mirror
    ///
    /// Failures are logged and the remaining entries are still flushed; the
    /// first failure is returned.
    pub async fn flush_all(&self) -> Result<()> {
        let keys: Vec<String> = self.entries.iter().map(|slot| slot.key().clone()).collect();
        info!("Flushing {} cache entries", keys.len());

        let mut first_error = None;
        for key in keys {
            if let Err(e) = self.flush_key(&key).await {
                error!("Failed to flush {}: {}", key, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Snapshot of the entry for `uri`, if any
    pub async fn entry(&self, uri: &ResourceUri) -> Option<CacheEntryInfo> {
        let key = uri.canonical();
        let (_, entry) = self.lock_existing(&key).await?;
        Some(CacheEntryInfo {
            uri: entry.key.clone(),
            mirror_path: entry.mirror.clone(),
            state: entry.state,
            refcount: entry.refcount,
            pending_clean: entry.pending_clean,
        })
    }

    fn slot_or_insert(
        &self,
        key: &str,
        uri: &ResourceUri,
        backend: &Arc<dyn Backend>,
    ) -> Arc<EntrySlot> {
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!("New cache entry for {}", key);
                Arc::new(Mutex::new(Entry {
                    key: key.to_string(),
                    uri: uri.clone(),
                    backend: backend.clone(),
                    mirror: self.layout.mirror_path(uri),
                    state: EntryState::Absent,
                    refcount: 0,
                    pending_clean: false,
                    pending_discard: false,
                    synced_digest: None,
                    removed: false,
                }))
            })
            .clone()
    }

    /// Lock the live slot for `key`, if one is registered
    async fn lock_existing(
        &self,
        key: &str,
    ) -> Option<(Arc<EntrySlot>, OwnedMutexGuard<Entry>)> {
        loop {
            let slot = self.entries.get(key).map(|slot| slot.clone())?;
            let guard = slot.clone().lock_owned().await;
            if guard.removed {
                continue;
            }
            return Some((slot, guard));
        }
    }

    /// Decrement the refcount; true when it just reached zero
    fn decrement(entry: &mut Entry) -> bool {
        if entry.refcount == 0 {
            warn!("release of {} with no outstanding references", entry.key);
            return false;
        }
        entry.refcount -= 1;
        trace!("release {}: refcount={}", entry.key, entry.refcount);
        entry.refcount == 0
    }

    async fn populate(&self, entry: &mut Entry, mode: AccessMode) -> Result<()> {
        entry.state = EntryState::Populating;
        let key = entry.key.clone();

        if let Some(parent) = entry.mirror.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| NstoreError::Io(e).into_cache_sync(&key))?;
        }

        match mode.direction {
            Direction::Write => {
                tokio::fs::File::create(&entry.mirror)
                    .await
                    .map_err(|e| NstoreError::Io(e).into_cache_sync(&key))?;
                entry.synced_digest = None;
            }
            Direction::Read | Direction::Append => {
                let staging = part_path(&entry.mirror);
                let cleanup = scopeguard::guard(staging.clone(), |path| {
                    let _ = std::fs::remove_file(path);
                });

                match entry.backend.download_to(&entry.uri, &staging).await {
                    Ok(size) => {
                        tokio::fs::rename(&staging, &entry.mirror)
                            .await
                            .map_err(|e| NstoreError::Io(e).into_cache_sync(&key))?;
                        scopeguard::ScopeGuard::into_inner(cleanup);

                        let digest = digest_file(&entry.mirror)
                            .await
                            .map_err(|e| NstoreError::Io(e).into_cache_sync(&key))?;
                        entry.synced_digest = Some(digest);
                        debug!("Populated mirror for {} ({} bytes)", key, size);
                    }
                    Err(NstoreError::NotFound(_)) if mode.direction == Direction::Append => {
                        tokio::fs::File::create(&entry.mirror)
                            .await
                            .map_err(|e| NstoreError::Io(e).into_cache_sync(&key))?;
                        entry.synced_digest = None;
                        debug!("Started empty mirror for new object {}", key);
                    }
                    Err(e) => return Err(e.into_cache_sync(&key)),
                }
            }
        }

        entry.state = EntryState::Ready;
        Ok(())
    }

    /// Upload a dirty mirror unless its content matches the last sync
    async fn sync(&self, entry: &mut Entry) -> Result<()> {
        let key = entry.key.clone();
        let digest = digest_file(&entry.mirror)
            .await
            .map_err(|e| NstoreError::from_io(e, &entry.mirror.to_string_lossy()).into_cache_sync(&key))?;

        if entry.synced_digest.as_deref() == Some(digest.as_str()) {
            debug!("Mirror for {} unchanged, skipping upload", key);
            entry.state = EntryState::Ready;
            return Ok(());
        }

        debug!("Uploading mirror for {}", key);
        entry
            .backend
            .upload_from(&entry.mirror, &entry.uri)
            .await
            .map_err(|e| e.into_cache_sync(&key))?;

        entry.synced_digest = Some(digest);
        entry.state = EntryState::Ready;
        Ok(())
    }

    async fn flush_key(&self, key: &str) -> Result<()> {
        let Some((_, mut entry)) = self.lock_existing(key).await else {
            return Ok(());
        };

        if entry.state != EntryState::Dirty || entry.pending_discard {
            return Ok(());
        }

        self.sync(&mut entry).await?;

        // Sessions still holding the mirror may write more
        if entry.refcount > 0 {
            entry.state = EntryState::Dirty;
        }
        Ok(())
    }

    async fn clean_key(&self, key: &str) -> Result<()> {
        let Some((slot, mut entry)) = self.lock_existing(key).await else {
            trace!("clean of {}: no entry", key);
            return Ok(());
        };

        if entry.refcount > 0 {
            debug!(
                "Deferring clean of {} until {} session(s) release it",
                key, entry.refcount
            );
            entry.pending_clean = true;
            return Ok(());
        }

        if entry.state == EntryState::Dirty {
            self.sync(&mut entry).await?;
        }

        self.evict(&mut entry, &slot).await
    }

    async fn clean_keys(&self, keys: Vec<String>) -> Result<usize> {
        let count = keys.len();
        let mut first_error = None;

        for key in keys {
            if let Err(e) = self.clean_key(&key).await {
                error!("Failed to clean {}: {}", key, e);
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(count), Err)
    }

    /// Delete the mirror and drop the entry from the registry
    async fn evict(&self, entry: &mut Entry, slot: &Arc<EntrySlot>) -> Result<()> {
        self.layout
            .remove_mirror(&entry.mirror)
            .await
            .map_err(|e| NstoreError::from_io(e, &entry.mirror.to_string_lossy()))?;
        self.unregister(entry, slot);
        debug!("Evicted {}", entry.key);
        Ok(())
    }

    /// Best-effort removal of a mirror whose content must not be used
    async fn discard_mirror(&self, entry: &mut Entry, slot: &Arc<EntrySlot>) {
        // A withdrawn mirror that could not be moved aside may be in use by
        // a newer entry at the same path.
        if entry.pending_discard && !self.layout.is_set_aside(&entry.mirror) {
            warn!("Leaving withdrawn mirror {:?} in place", entry.mirror);
        } else if let Err(e) = self.layout.remove_mirror(&entry.mirror).await {
            warn!("Failed to remove mirror {:?}: {}", entry.mirror, e);
        }
        self.unregister(entry, slot);
    }

    /// Take a still-held entry out of the registry and move its mirror off
    /// the shared path, so the next `acquire` starts a fresh entry.
    async fn withdraw(&self, entry: &mut Entry, slot: &Arc<EntrySlot>) {
        if entry.pending_discard {
            return;
        }
        entry.pending_discard = true;

        match self.layout.set_aside(&entry.mirror).await {
            Ok(moved) => entry.mirror = moved,
            Err(e) => warn!("Failed to move mirror {:?} aside: {}", entry.mirror, e),
        }
        self.unregister(entry, slot);
    }

    fn unregister(&self, entry: &mut Entry, slot: &Arc<EntrySlot>) {
        entry.state = EntryState::Absent;
        entry.removed = true;
        self.entries
            .remove_if(&entry.key, |_, registered| Arc::ptr_eq(registered, slot));
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        let dirty = self
            .entries
            .iter()
            .filter(|slot| {
                slot.value()
                    .try_lock()
                    .map(|entry| entry.state == EntryState::Dirty)
                    .unwrap_or(false)
            })
            .count();
        if dirty > 0 {
            warn!("{} cache entries dropped with unsynced changes", dirty);
        }
    }
}
