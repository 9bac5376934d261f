// src/core/cache/lru.rs

//! A bounded, on-disk, strictly-LRU cache keyed by [`ResourceKey`].
//!
//! Recency and insertion order come straight from the `lru` crate's `LruCache`,
//! which already orders entries least-recently-used-first and breaks ties by
//! insertion order. Eviction skips entries with a nonzero in-use refcount: a
//! handler currently streaming a file out must never have it deleted underneath
//! it. If every resident entry is pinned, a reservation still proceeds and the
//! budget is temporarily exceeded (see `PkgVaultError::CacheFull`, which is not
//! treated as fatal).

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::errors::PkgVaultError;
use crate::core::metrics;
use crate::core::resource::ResourceKey;

#[derive(Debug, Clone)]
struct Entry {
    path: PathBuf,
    size: u64,
}

struct Inner {
    entries: LruCache<ResourceKey, Entry>,
    refcounts: HashMap<ResourceKey, usize>,
    total_size: u64,
}

/// The shared, bounded on-disk cache.
pub struct Cache {
    inner: Mutex<Inner>,
    root: PathBuf,
    limit_bytes: u64,
}

impl Cache {
    pub fn new(root: impl Into<PathBuf>, limit_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                // Unbounded in entry count; capacity is governed by total_size vs limit_bytes.
                entries: LruCache::new(NonZeroUsize::new(usize::MAX).unwrap()),
                refcounts: HashMap::new(),
                total_size: 0,
            }),
            root: root.into(),
            limit_bytes,
        }
    }

    fn path_for(&self, key: &ResourceKey) -> PathBuf {
        self.root.join(key.to_path_string())
    }

    /// Returns the on-disk path for a resident key without updating recency.
    pub fn path_of(&self, key: &ResourceKey) -> Option<PathBuf> {
        let inner = self.inner.lock();
        inner.entries.peek(key).map(|e| e.path.clone())
    }

    /// Returns the on-disk path for a resident key and marks it most-recently-used.
    pub fn touch(&self, key: &ResourceKey) -> Option<PathBuf> {
        let mut inner = self.inner.lock();
        inner.entries.get(key).map(|e| e.path.clone())
    }

    /// Reserves room for `size` bytes under `key`, evicting least-recently-used,
    /// unpinned entries until the projected total fits the budget. Returns the
    /// destination path the caller must atomically rename its staged file into.
    ///
    /// Does not insert `key` into the cache yet — call [`Cache::commit`] after the
    /// rename succeeds.
    pub fn reserve(&self, key: &ResourceKey, size: u64) -> PathBuf {
        let mut inner = self.inner.lock();

        while inner.total_size.saturating_add(size) > self.limit_bytes {
            // LruCache has no "peek least recent unpinned" walk, so we pop until we
            // find an unpinned victim, re-inserting any pinned ones we pass over.
            let mut skipped = Vec::new();
            let mut evicted_one = false;
            while let Some((victim_key, victim_entry)) = inner.entries.pop_lru() {
                let pinned = inner.refcounts.get(&victim_key).copied().unwrap_or(0) > 0;
                if pinned {
                    skipped.push((victim_key, victim_entry));
                    continue;
                }
                inner.total_size = inner.total_size.saturating_sub(victim_entry.size);
                metrics::CACHE_EVICTIONS_TOTAL.inc();
                let path = victim_entry.path.clone();
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = std::fs::remove_file(&path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(path = %path.display(), error = %e, "failed to remove evicted cache file");
                        }
                    }
                });
                evicted_one = true;
                break;
            }
            for (k, v) in skipped {
                inner.entries.put(k, v);
            }
            if !evicted_one {
                // Every resident entry is pinned; proceed over budget.
                warn!(
                    key = %key,
                    "cache reservation exceeds budget: all resident entries are pinned"
                );
                break;
            }
        }

        metrics::CACHE_SIZE_BYTES.set(inner.total_size as f64);
        self.path_for(key)
    }

    /// Records a successfully committed entry after the atomic rename into
    /// `path` (as returned by [`Cache::reserve`]) has completed.
    pub fn commit(&self, key: ResourceKey, path: PathBuf, size: u64) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.put(key, Entry { path, size }) {
            inner.total_size = inner.total_size.saturating_sub(old.size);
        }
        inner.total_size = inner.total_size.saturating_add(size);
        metrics::CACHE_SIZE_BYTES.set(inner.total_size as f64);
    }

    /// Removes a resident entry and deletes its file.
    pub fn forget(&self, key: &ResourceKey) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.pop(key) {
            inner.total_size = inner.total_size.saturating_sub(entry.size);
            let path = entry.path;
            tokio::task::spawn_blocking(move || {
                let _ = std::fs::remove_file(path);
            });
        }
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.inner.lock().entries.contains(key)
    }

    pub fn total_size(&self) -> u64 {
        self.inner.lock().total_size
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pins `key` against eviction for the lifetime of the returned guard.
    /// Call sites that stream a cached file (C7) hold this for the duration of
    /// the response.
    pub fn pin(self: &Arc<Self>, key: ResourceKey) -> CacheGuard {
        let mut inner = self.inner.lock();
        *inner.refcounts.entry(key.clone()).or_insert(0) += 1;
        debug!(%key, "pinned cache entry");
        CacheGuard {
            cache: Arc::clone(self),
            key,
        }
    }
}

/// RAII guard: decrements the pinned key's in-use refcount on drop, guaranteed
/// on every exit path including panics and early returns.
pub struct CacheGuard {
    cache: Arc<Cache>,
    key: ResourceKey,
}

impl Drop for CacheGuard {
    fn drop(&mut self) {
        let mut inner = self.cache.inner.lock();
        if let Some(count) = inner.refcounts.get_mut(&self.key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.refcounts.remove(&self.key);
            }
        }
    }
}
