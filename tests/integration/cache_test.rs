// tests/integration/cache_test.rs

//! Cache + atomic-writer integration: round-tripping a write through
//! `write_atomic` and back out through the cache index, and eviction under
//! budget pressure.

use std::sync::Arc;

use pkgvault::core::cache::{Cache, write_atomic};
use pkgvault::core::errors::PkgVaultError;
use pkgvault::core::resource::ResourceKey;
use tokio::io::AsyncWriteExt;

fn key(hash: &str) -> ResourceKey {
    ResourceKey::Artifact {
        hash: hash.to_string(),
    }
}

#[tokio::test]
async fn round_trip_through_atomic_writer_and_cache_index() {
    let tmp = tempfile::tempdir().unwrap();
    let temp_root = tmp.path().join("tmp");
    tokio::fs::create_dir_all(&temp_root).await.unwrap();
    let cache = Arc::new(Cache::new(tmp.path().join("cache"), 1_000_000));

    let payload = b"a complete, committed payload".to_vec();
    let expected = payload.clone();
    let k = key("0000000000000000000000000000000000000a");

    let (path, size) = write_atomic(&cache, &temp_root, &k, move |staging| {
        let payload = expected.clone();
        async move {
            let mut f = tokio::fs::File::create(&staging).await?;
            f.write_all(&payload).await?;
            Ok(payload.len() as u64)
        }
    })
    .await
    .unwrap();

    assert_eq!(size, payload.len() as u64);
    assert_eq!(tokio::fs::read(&path).await.unwrap(), payload);
    assert_eq!(cache.path_of(&k).unwrap(), path);
    assert_eq!(cache.total_size(), payload.len() as u64);
}

#[tokio::test]
async fn eviction_clears_enough_lru_entries_to_fit_a_large_reservation() {
    let tmp = tempfile::tempdir().unwrap();
    let temp_root = tmp.path().join("tmp");
    tokio::fs::create_dir_all(&temp_root).await.unwrap();
    // Budget only fits one 100-byte entry at a time.
    let cache = Arc::new(Cache::new(tmp.path().join("cache"), 100));

    let a = key("0000000000000000000000000000000000000a");
    let b = key("0000000000000000000000000000000000000b");

    let path_a = cache.reserve(&a, 100);
    cache.commit(a.clone(), path_a, 100);
    assert!(cache.contains(&a));

    // Reserving b must evict a (the only unpinned resident entry) to stay
    // within budget.
    let path_b = cache.reserve(&b, 100);
    cache.commit(b.clone(), path_b, 100);

    assert!(!cache.contains(&a));
    assert!(cache.contains(&b));
    assert_eq!(cache.total_size(), 100);
}

#[tokio::test]
async fn failed_producer_never_creates_a_destination_file() {
    let tmp = tempfile::tempdir().unwrap();
    let temp_root = tmp.path().join("tmp");
    tokio::fs::create_dir_all(&temp_root).await.unwrap();
    let cache = Arc::new(Cache::new(tmp.path().join("cache"), 1_000_000));
    let k = key("00000000000000000000000000000000000bad");

    let result = write_atomic(&cache, &temp_root, &k, |_staging| async move {
        Err::<u64, _>(PkgVaultError::HashMismatch)
    })
    .await;

    assert!(result.is_err());
    assert!(!cache.contains(&k));
    assert!(cache.path_of(&k).is_none());
}
