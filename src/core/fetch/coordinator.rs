// src/core/fetch/coordinator.rs

//! The fetch coordinator (C3): a 128-way sharded table that guarantees
//! at-most-one in-flight download per resource key and remembers recent
//! failures so they are not immediately retried.
//!
//! Sharding follows the same `hash(key) mod N` partitioning used elsewhere in
//! this codebase for its keyspace locks, sized so that with an expected
//! concurrent-miss count of a handful of keys, accidental same-shard
//! collisions stay well under 1%.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::SecurityConfig;
use crate::core::cache::lru::Cache;
use crate::core::errors::PkgVaultError;
use crate::core::fetch::download;
use crate::core::fetch::selector;
use crate::core::metrics;
use crate::core::resource::ResourceKey;

pub const NUM_SHARDS: usize = 128;

type CompletionFuture = Shared<BoxFuture<'static, Result<ResourceKey, Arc<PkgVaultError>>>>;

/// A handle to an in-flight (or just-finished) download, shared by every
/// caller that attaches to the same key.
pub struct DownloadHandle {
    /// Where the raw, still-growing (or already complete) file lives. C7 reads
    /// directly from this path while `done` is false.
    pub staging_path: PathBuf,
    pub content_length: Option<u64>,
    done: Arc<AtomicBool>,
    notify: Arc<Notify>,
    completion: CompletionFuture,
}

impl DownloadHandle {
    /// Non-blocking: has the backing file stopped growing (success or failure)?
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Blocks until the file has stopped growing, without caring about the
    /// final outcome. Used by range serve's read-retry loop.
    pub async fn wait_until_done(&self) {
        while !self.is_done() {
            self.notify.notified().await;
        }
    }

    /// Blocks until the download completes and returns its final outcome
    /// (the key the bytes were committed under, which may differ from the
    /// requested key under the dual-hash install rule).
    pub async fn join(&self) -> Result<ResourceKey, Arc<PkgVaultError>> {
        self.completion.clone().await
    }
}

impl Drop for DownloadHandle {
    /// Removes the staging file once every holder of this handle (the
    /// coordinator's in-progress table and every attached response stream)
    /// has let go of it. Until then the file backing `staging_path` is
    /// guaranteed to still be there, even after the download has committed
    /// into the cache under a different, copied path.
    fn drop(&mut self) {
        let path = self.staging_path.clone();
        tokio::task::spawn_blocking(move || {
            let _ = std::fs::remove_file(path);
        });
    }
}

struct Shard {
    inprogress: Mutex<HashMap<ResourceKey, Arc<DownloadHandle>>>,
    failed: Mutex<HashSet<ResourceKey>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            inprogress: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashSet::new()),
        }
    }
}

/// The outcome of asking the coordinator to fetch a key.
pub enum FetchResult {
    /// Attach to this handle: either newly started or already in flight.
    InProgress(Arc<DownloadHandle>),
    /// This key failed recently; the caller should 404 without retrying.
    RecentFailure,
    /// No configured server has this resource right now.
    NoUpstream,
}

pub struct FetchCoordinator {
    shards: Vec<Shard>,
    client: Client,
    servers: Vec<String>,
    security: SecurityConfig,
    temp_root: PathBuf,
    cache: Arc<Cache>,
}

fn shard_index(key: &ResourceKey) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % NUM_SHARDS
}

impl FetchCoordinator {
    pub fn new(
        client: Client,
        servers: Vec<String>,
        security: SecurityConfig,
        temp_root: PathBuf,
        cache: Arc<Cache>,
    ) -> Self {
        let mut shards = Vec::with_capacity(NUM_SHARDS);
        shards.resize_with(NUM_SHARDS, Shard::new);
        Self {
            shards,
            client,
            servers,
            security,
            temp_root,
            cache,
        }
    }

    /// Clears the recent-failure set for `key`. The only way a failed key
    /// becomes eligible for retry; intended to be invoked by an external
    /// operator action or scheduler, never automatically on a timer.
    pub fn forget_failures(&self, key: &ResourceKey) {
        let shard = &self.shards[shard_index(key)];
        shard.failed.lock().remove(key);
    }

    pub async fn fetch(self: &Arc<Self>, key: ResourceKey) -> FetchResult {
        let shard = &self.shards[shard_index(&key)];

        {
            let failed = shard.failed.lock();
            if failed.contains(&key) {
                return FetchResult::RecentFailure;
            }
        }
        {
            let inprogress = shard.inprogress.lock();
            if let Some(handle) = inprogress.get(&key) {
                debug!(%key, "fetch coalesced into in-flight download");
                metrics::FETCH_COALESCED_TOTAL.inc();
                return FetchResult::InProgress(Arc::clone(handle));
            }
        }

        // No lock held across the HEAD-probe race; another caller may win the
        // same race and insert first, which we reconcile below.
        let this = Arc::clone(self);

        let selected = selector::select(&self.client, &self.servers, &key, &self.security).await;

        let Some(selected) = selected else {
            return FetchResult::NoUpstream;
        };

        let mut inprogress = shard.inprogress.lock();
        if let Some(handle) = inprogress.get(&key) {
            return FetchResult::InProgress(Arc::clone(handle));
        }

        let done = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let staging_path = this
            .temp_root
            .join(format!("{}.download", key.to_path_string().replace('/', "_")));

        let content_length = selected.content_length;
        let selected_server = selected.server.clone();
        let download_fut: BoxFuture<'static, Result<ResourceKey, Arc<PkgVaultError>>> = {
            let this = Arc::clone(&this);
            let key = key.clone();
            let done = Arc::clone(&done);
            let notify = Arc::clone(&notify);
            let staging_path = staging_path.clone();
            let selected_server = selected_server.clone();
            Box::pin(async move {
                metrics::FETCH_STARTED_TOTAL.inc();
                metrics::DOWNLOADS_IN_FLIGHT.inc();
                let timer = metrics::DOWNLOAD_DURATION_SECONDS.start_timer();
                let result = download::download_and_verify(
                    &this.client,
                    &selected_server,
                    &key,
                    &staging_path,
                    &this.cache,
                    &this.temp_root,
                )
                .await;
                timer.observe_duration();
                metrics::DOWNLOADS_IN_FLIGHT.dec();
                done.store(true, Ordering::Release);
                notify.notify_waiters();

                let shard = &this.shards[shard_index(&key)];
                shard.inprogress.lock().remove(&key);
                match &result {
                    Ok(_) => {}
                    Err(PkgVaultError::HashMismatch) => {
                        metrics::FETCH_HASH_MISMATCH_TOTAL.inc();
                        shard.failed.lock().insert(key.clone());
                    }
                    Err(e) => {
                        warn!(%key, error = %e, "download failed");
                        metrics::FETCH_FAILURES_TOTAL
                            .with_label_values(&["download"])
                            .inc();
                        shard.failed.lock().insert(key.clone());
                    }
                }
                result.map_err(Arc::new)
            })
        };

        let handle = Arc::new(DownloadHandle {
            staging_path,
            content_length,
            done,
            notify,
            completion: download_fut.shared(),
        });

        inprogress.insert(key.clone(), Arc::clone(&handle));
        drop(inprogress);

        // Drive the shared future forward independently of whichever caller
        // happens to be polling it.
        let driver = handle.completion.clone();
        tokio::spawn(async move {
            let _ = driver.await;
        });

        info!(%key, server = %selected.server, "started download");
        FetchResult::InProgress(handle)
    }
}
