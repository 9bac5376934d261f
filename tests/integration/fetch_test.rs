// tests/integration/fetch_test.rs

//! End-to-end fetch coordinator + downloader scenarios, following the
//! literal scenarios enumerated for this system: single-upstream miss,
//! deduplication of concurrent requests, the archaic skip-empty-hash dual
//! install, and the hash-mismatch failure path.

use pkgvault::core::fetch::FetchResult;
use pkgvault::core::resource::ResourceKey;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::test_helpers::{Harness, make_archaic_tarball, make_tarball};

#[tokio::test]
async fn miss_against_single_upstream_commits_under_requested_hash() {
    let server = MockServer::start().await;
    let tarball = make_tarball("artifact.txt", b"hello from upstream");
    let key = ResourceKey::Artifact {
        hash: tarball.no_skip_hash.clone(),
    };
    let url_path = format!("/{}", key.to_path_string());

    Mock::given(method("HEAD"))
        .and(path(&url_path))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", tarball.gz_bytes.len().to_string()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(&url_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(tarball.gz_bytes.clone()))
        .mount(&server)
        .await;

    let harness = Harness::new(vec![server.uri()]);

    let FetchResult::InProgress(handle) = harness.coordinator.fetch(key.clone()).await else {
        panic!("expected a download to start against a single responsive upstream");
    };
    let committed_key = handle.join().await.expect("download should succeed");

    assert_eq!(committed_key, key);
    assert!(harness.cache.contains(&key));
    let on_disk = harness.cache.path_of(&key).unwrap();
    assert_eq!(
        tokio::fs::read(&on_disk).await.unwrap(),
        tarball.gz_bytes,
        "committed bytes must match what upstream served"
    );
}

#[tokio::test]
async fn concurrent_requests_for_a_new_key_issue_exactly_one_upstream_get() {
    let server = MockServer::start().await;
    let tarball = make_tarball("dedup.txt", b"only fetched once");
    let key = ResourceKey::Artifact {
        hash: tarball.no_skip_hash.clone(),
    };
    let url_path = format!("/{}", key.to_path_string());

    Mock::given(method("HEAD"))
        .and(path(&url_path))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", tarball.gz_bytes.len().to_string()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(&url_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(tarball.gz_bytes.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new(vec![server.uri()]);

    let (first, second) = tokio::join!(
        harness.coordinator.fetch(key.clone()),
        harness.coordinator.fetch(key.clone())
    );

    let handle_a = match first {
        FetchResult::InProgress(h) => h,
        _ => panic!("first fetch should start a download"),
    };
    let handle_b = match second {
        FetchResult::InProgress(h) => h,
        _ => panic!("second fetch should coalesce into the same download"),
    };

    assert!(
        std::sync::Arc::ptr_eq(&handle_a, &handle_b),
        "both callers must observe the identical download handle"
    );

    let (res_a, res_b) = tokio::join!(handle_a.join(), handle_b.join());
    assert_eq!(res_a.unwrap(), key);
    assert_eq!(res_b.unwrap(), key);

    server.verify().await;
    assert!(harness.cache.contains(&key));
}

#[tokio::test]
async fn archaic_skip_empty_hash_installs_under_both_hashes() {
    let server = MockServer::start().await;
    let tarball = make_archaic_tarball("empty-dir/");
    let requested_key = ResourceKey::Artifact {
        hash: tarball.skip_empty_hash.clone(),
    };
    let url_path = format!("/{}", requested_key.to_path_string());

    Mock::given(method("HEAD"))
        .and(path(&url_path))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", tarball.gz_bytes.len().to_string()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(&url_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(tarball.gz_bytes.clone()))
        .mount(&server)
        .await;

    let harness = Harness::new(vec![server.uri()]);

    let FetchResult::InProgress(handle) = harness.coordinator.fetch(requested_key.clone()).await
    else {
        panic!("expected a download to start");
    };
    handle.join().await.expect("download should succeed");

    let canonical_key = ResourceKey::Artifact {
        hash: tarball.no_skip_hash.clone(),
    };

    assert!(
        harness.cache.contains(&requested_key),
        "bytes must be installed under the requested skip-empty hash"
    );
    assert!(
        harness.cache.contains(&canonical_key),
        "bytes must also be installed under the canonical no-skip hash"
    );

    let requested_path = harness.cache.path_of(&requested_key).unwrap();
    let canonical_path = harness.cache.path_of(&canonical_key).unwrap();
    assert_eq!(
        tokio::fs::read(requested_path).await.unwrap(),
        tokio::fs::read(canonical_path).await.unwrap(),
        "both cache entries must hold identical bytes"
    );
}

#[tokio::test]
async fn hash_mismatch_is_recorded_and_not_immediately_retried() {
    let server = MockServer::start().await;
    let tarball = make_tarball("real.txt", b"actual upstream bytes");
    // Request under a hash that the tarball's bytes cannot possibly satisfy.
    let bogus_hash = "f".repeat(40);
    let key = ResourceKey::Artifact {
        hash: bogus_hash.clone(),
    };
    let url_path = format!("/artifact/{bogus_hash}");

    Mock::given(method("HEAD"))
        .and(path(&url_path))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", tarball.gz_bytes.len().to_string()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(&url_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(tarball.gz_bytes.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new(vec![server.uri()]);

    let FetchResult::InProgress(handle) = harness.coordinator.fetch(key.clone()).await else {
        panic!("expected a download attempt");
    };
    let result = handle.join().await;
    assert!(result.is_err(), "bytes matching neither hash must fail verification");
    assert!(!harness.cache.contains(&key));

    // A second fetch must not contact upstream again: it is an instant
    // recent-failure short-circuit.
    match harness.coordinator.fetch(key.clone()).await {
        FetchResult::RecentFailure => {}
        _ => panic!("expected RecentFailure without a second upstream round-trip"),
    }
    server.verify().await;

    // After forgetting the failure, the key becomes eligible for retry again.
    harness.coordinator.forget_failures(&key);
    match harness.coordinator.fetch(key.clone()).await {
        FetchResult::RecentFailure => panic!("failure set should have been cleared"),
        _ => {}
    }
}
