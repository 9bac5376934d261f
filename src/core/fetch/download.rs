// src/core/fetch/download.rs

//! The streaming downloader (C5): fetches a resource from its selected
//! upstream, tees the raw compressed bytes to `staging_path` as they arrive
//! (so range serve can stream the in-progress file), decompresses and
//! dual-tree-hashes the content concurrently, and verifies the result before
//! committing via the atomic writer.
//!
//! The decompression side runs on a blocking thread: `flate2::GzDecoder` is a
//! synchronous `Read`, bridged to the async duplex pipe with
//! `tokio_util::io::SyncIoBridge` so CPU-bound inflate work never blocks the
//! async task reading the HTTP body, and vice versa. Bounding the duplex pipe
//! to 16 MiB gives backpressure: if hashing falls behind, the HTTP body read
//! loop stalls rather than buffering the whole response in memory.
//!
//! Once decompression finishes, the full decompressed tar is materialized
//! (in memory, or spooled to a temp file past a size threshold) so the tree
//! hasher can walk it twice — once to find empty directories, once to hash.
//! This trades a second traversal of already-local bytes for a much simpler
//! implementation than a fully concurrent three-way tee; see the design notes
//! for why that tradeoff was made.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, warn};

use crate::core::cache::atomic::{install_alias, write_atomic};
use crate::core::cache::lru::Cache;
use crate::core::errors::PkgVaultError;
use crate::core::fetch::treehash::{self, Materialized};
use crate::core::metrics;
use crate::core::resource::ResourceKey;

/// Decompressed payloads above this size are spooled to a temp file instead of
/// held in memory, mirroring the streaming-threshold knob used elsewhere in
/// this codebase for large cached bodies.
const MATERIALIZE_SPOOL_THRESHOLD_BYTES: u64 = 64 * 1024 * 1024;

const DUPLEX_BUFFER_BYTES: usize = 16 * 1024 * 1024;

/// Downloads `key` from `server`, writing raw bytes to `staging_path`, and
/// commits it into `cache` once the tree hash has been verified. Returns the
/// key the content was actually committed under (may differ from `key` under
/// the dual-hash install rule in §4.5).
pub async fn download_and_verify(
    client: &Client,
    server: &str,
    key: &ResourceKey,
    staging_path: &Path,
    cache: &Arc<Cache>,
    temp_root: &Path,
) -> Result<ResourceKey, PkgVaultError> {
    let url = format!("{}/{}", server.trim_end_matches('/'), key.to_path_string());
    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(PkgVaultError::TransientUpstream(format!(
            "GET {url} returned {}",
            response.status()
        )));
    }

    if let Some(parent) = staging_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut disk_file = tokio::fs::File::create(staging_path).await?;

    let (duplex_writer, duplex_reader) = tokio::io::duplex(DUPLEX_BUFFER_BYTES);

    let decode_handle = tokio::task::spawn_blocking(move || materialize_decompressed(duplex_reader));

    let copy_result = tee_body_to_disk_and_pipe(response, &mut disk_file, duplex_writer).await;
    disk_file.flush().await.ok();
    let total_size = copy_result?;

    let materialized = decode_handle
        .await
        .map_err(|e| PkgVaultError::Internal(format!("decompression task panicked: {e}")))??;

    let hashes = tokio::task::spawn_blocking(move || treehash::compute_tree_hashes(&materialized))
        .await
        .map_err(|e| PkgVaultError::Internal(format!("tree-hash task panicked: {e}")))??;

    let expected = key.hash();
    if expected != hashes.no_skip && expected != hashes.skip_empty {
        let _ = tokio::fs::remove_file(staging_path).await;
        return Err(PkgVaultError::HashMismatch);
    }

    // Copy (not rename) the already-written staging file into the cache under
    // `key` via the atomic writer. Range serve may still have `staging_path`
    // open (or be about to open it) for an in-progress response; renaming it
    // away here would yank the file out from under that reader. `staging_path`
    // itself is cleaned up once nothing references the `DownloadHandle`
    // anymore (see its `Drop` impl).
    let staging_path_owned = staging_path.to_path_buf();
    let (committed_path, _) = write_atomic(cache, temp_root, key, move |dest_staging| {
        let staging_path_owned = staging_path_owned.clone();
        async move {
            tokio::fs::copy(&staging_path_owned, &dest_staging).await?;
            Ok(total_size)
        }
    })
    .await?;

    metrics::PAYLOAD_BYTES_WRITTEN_TOTAL.inc_by(total_size as f64);

    if expected == hashes.no_skip {
        debug!(%key, "verified under no-skip tree hash");
        return Ok(key.clone());
    }

    // expected == hashes.skip_empty: also install under the no-skip hash so
    // future lookups under the canonical hash hit the cache directly.
    let alias_key = key.with_hash(&hashes.no_skip);
    debug!(%key, alias = %alias_key, "verified under skip-empty hash, installing alias");
    match install_alias(cache, temp_root, &alias_key, &committed_path).await {
        Ok(_) => {}
        Err(e) => warn!(%alias_key, error = %e, "failed to install dual-hash alias"),
    }
    Ok(key.clone())
}

async fn tee_body_to_disk_and_pipe(
    mut response: reqwest::Response,
    disk_file: &mut tokio::fs::File,
    mut duplex_writer: tokio::io::DuplexStream,
) -> Result<u64, PkgVaultError> {
    let mut total: u64 = 0;
    while let Some(chunk) = response.chunk().await? {
        disk_file.write_all(&chunk).await?;
        duplex_writer.write_all(&chunk).await.map_err(|e| {
            PkgVaultError::Internal(format!("decompression pipe closed early: {e}"))
        })?;
        total += chunk.len() as u64;
    }
    // Dropping the writer signals EOF to the blocking decode side.
    drop(duplex_writer);
    Ok(total)
}

fn materialize_decompressed(
    duplex_reader: tokio::io::DuplexStream,
) -> Result<Materialized, PkgVaultError> {
    let sync_reader = SyncIoBridge::new(duplex_reader);
    let mut decoder = GzDecoder::new(sync_reader);

    let mut buf = Vec::new();
    let mut total: u64 = 0;
    let mut chunk = [0u8; 64 * 1024];
    let mut spool: Option<(PathBuf, std::fs::File)> = None;

    loop {
        let n = decoder.read(&mut chunk).map_err(|e| {
            PkgVaultError::Internal(format!("gzip decompression failed: {e}"))
        })?;
        if n == 0 {
            break;
        }
        total += n as u64;
        match &mut spool {
            Some((_, file)) => {
                use std::io::Write;
                file.write_all(&chunk[..n])?;
            }
            None => {
                buf.extend_from_slice(&chunk[..n]);
                if total > MATERIALIZE_SPOOL_THRESHOLD_BYTES {
                    let path = std::env::temp_dir()
                        .join(format!("pkgvault-decompress-{}.tmp", uuid::Uuid::new_v4()));
                    let mut file = std::fs::File::create(&path)?;
                    use std::io::Write;
                    file.write_all(&buf)?;
                    buf.clear();
                    spool = Some((path, file));
                }
            }
        }
    }

    match spool {
        Some((path, _)) => Ok(Materialized::OnDisk(path)),
        None => Ok(Materialized::InMemory(buf)),
    }
}
