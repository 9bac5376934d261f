// src/core/cache/atomic.rs

//! Atomic write-then-rename commit into the cache (C2).
//!
//! The rename is the linearization point: an observer of the destination path
//! either sees nothing, or sees a complete file of the declared size. This
//! mirrors the temp-suffix-then-`fs::rename` pattern used elsewhere in this
//! codebase for on-disk persistence.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::cache::lru::Cache;
use crate::core::errors::PkgVaultError;
use crate::core::resource::ResourceKey;

/// Writes a new cache entry atomically.
///
/// `producer` receives the staging path it must create and write to, and
/// returns the final byte size on success. On any error the staged file is
/// removed and no cache entry is created.
pub async fn write_atomic<F, Fut>(
    cache: &Arc<Cache>,
    temp_root: &Path,
    key: &ResourceKey,
    producer: F,
) -> Result<(PathBuf, u64), PkgVaultError>
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = Result<u64, PkgVaultError>>,
{
    let staging = temp_root.join(format!(
        "{}.inprogress.{}",
        key.to_path_string().replace('/', "_"),
        Uuid::new_v4()
    ));
    if let Some(parent) = staging.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let result = producer(staging.clone()).await;

    match result {
        Ok(size) => {
            let destination = cache.reserve(key, size);
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            match tokio::fs::rename(&staging, &destination).await {
                Ok(()) => {
                    cache.commit(key.clone(), destination.clone(), size);
                    prune_empty_ancestors(staging.parent(), temp_root).await;
                    debug!(%key, path = %destination.display(), size, "committed cache entry");
                    Ok((destination, size))
                }
                Err(e) => {
                    warn!(%key, error = %e, "rename into cache failed, removing staged file");
                    let _ = tokio::fs::remove_file(&staging).await;
                    prune_empty_ancestors(staging.parent(), temp_root).await;
                    Err(PkgVaultError::from(e))
                }
            }
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&staging).await;
            prune_empty_ancestors(staging.parent(), temp_root).await;
            Err(e)
        }
    }
}

/// Hard-links (falling back to copy) an already-committed cache file into a
/// second destination under a different key, used for the dual-hash install in
/// the downloader (C5 §4.5): the skip-empty hash is the primary install, the
/// no-skip hash gets a second, cheap install of identical bytes.
pub async fn install_alias(
    cache: &Arc<Cache>,
    temp_root: &Path,
    alias_key: &ResourceKey,
    source_path: &Path,
) -> Result<(PathBuf, u64), PkgVaultError> {
    let size = tokio::fs::metadata(source_path).await?.len();
    let source = source_path.to_path_buf();
    write_atomic(cache, temp_root, alias_key, move |staging| {
        let source = source.clone();
        async move {
            match tokio::fs::hard_link(&source, &staging).await {
                Ok(()) => {}
                Err(_) => {
                    tokio::fs::copy(&source, &staging).await?;
                }
            }
            Ok(size)
        }
    })
    .await
}

/// Removes now-empty directories from `start` upward, stopping at (not past)
/// `stop`.
async fn prune_empty_ancestors(start: Option<&Path>, stop: &Path) {
    let Some(mut dir) = start.map(Path::to_path_buf) else {
        return;
    };
    while dir != stop && dir.starts_with(stop) {
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => {
                let Some(parent) = dir.parent() else { break };
                dir = parent.to_path_buf();
            }
            Err(_) => break,
        }
    }
}
