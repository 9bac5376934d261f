// tests/integration/registry_test.rs

//! Registry tracker tick scenario: two storage servers each advertise a
//! different hash for the same registry UUID; both hashes are confirmed by
//! every server once cross-probed, and both pass origin verification,
//! producing a tie that the tracker must break deterministically.

use std::sync::Arc;

use pkgvault::config::{CacheConfig, Config, MetricsConfig, RegistryConfig, SecurityConfig};
use pkgvault::core::cache::Cache;
use pkgvault::core::fetch::FetchCoordinator;
use pkgvault::core::registry::RegistryTracker;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::test_helpers::make_tarball;

const UUID: &str = "23338552-e32b-11e9-3998-5254009c5e99";

fn test_config(storage_servers: Vec<String>, origin_base: &str, root: &std::path::Path) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        log_level: "warn".to_string(),
        hostname: "localhost".to_string(),
        storage_servers,
        registries: vec![RegistryConfig {
            uuid: UUID.to_string(),
            origin_url_template: format!("{origin_base}/origin/{{hash}}"),
        }],
        registry_poll_interval_secs: 3600,
        cache: CacheConfig {
            size_limit_bytes: 10 * 1024 * 1024,
            root: root.join("cache").to_string_lossy().to_string(),
            temp_root: root.join("tmp").to_string_lossy().to_string(),
        },
        security: SecurityConfig {
            allowed_fetch_domains: Vec::new(),
            allow_private_fetch_ips: true,
        },
        metrics: MetricsConfig {
            enabled: false,
            port: 0,
        },
    }
}

/// Mounts a HEAD+GET pair serving `tarball` at `/registry/{UUID}/{hash}` on `srv`.
async fn mount_resource(
    srv: &MockServer,
    hash: &str,
    tarball: &super::test_helpers::Tarball,
) {
    let url_path = format!("/registry/{UUID}/{hash}");
    Mock::given(method("HEAD"))
        .and(path(&url_path))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", tarball.gz_bytes.len().to_string()),
        )
        .mount(srv)
        .await;
    Mock::given(method("GET"))
        .and(path(&url_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(tarball.gz_bytes.clone()))
        .mount(srv)
        .await;
}

#[tokio::test]
async fn tied_candidate_hashes_resolve_deterministically_and_publish_the_index() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;
    let origin = MockServer::start().await;

    let tarball_1 = make_tarball("a.txt", b"registry tree one");
    let tarball_2 = make_tarball("b.txt", b"registry tree two");
    let hash1 = tarball_1.no_skip_hash.clone();
    let hash2 = tarball_2.no_skip_hash.clone();

    // A advertises hash1, B advertises hash2.
    Mock::given(method("GET"))
        .and(path("/registries"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!("/registry/{UUID}/{hash1}\n")))
        .mount(&server_a)
        .await;
    Mock::given(method("GET"))
        .and(path("/registries"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!("/registry/{UUID}/{hash2}\n")))
        .mount(&server_b)
        .await;

    // Each server actually has both hashes (so cross-probing confirms the
    // one it didn't advertise, producing a 2-vs-2 tie).
    mount_resource(&server_a, &hash1, &tarball_1).await;
    mount_resource(&server_a, &hash2, &tarball_2).await;
    mount_resource(&server_b, &hash1, &tarball_1).await;
    mount_resource(&server_b, &hash2, &tarball_2).await;

    // Origin verifies both hashes.
    Mock::given(method("HEAD"))
        .and(path(format!("/origin/{hash1}")))
        .respond_with(ResponseTemplate::new(200))
        .mount(&origin)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/origin/{hash2}")))
        .respond_with(ResponseTemplate::new(200))
        .mount(&origin)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(
        vec![server_a.uri(), server_b.uri()],
        &origin.uri(),
        tmp.path(),
    );

    tokio::fs::create_dir_all(&config.cache.root).await.unwrap();
    tokio::fs::create_dir_all(&config.cache.temp_root).await.unwrap();

    let cache = Arc::new(Cache::new(
        config.cache.root.clone(),
        config.cache.size_limit_bytes,
    ));
    let coordinator = Arc::new(FetchCoordinator::new(
        reqwest::Client::new(),
        config.storage_servers.clone(),
        config.security.clone(),
        config.cache.temp_root.clone().into(),
        Arc::clone(&cache),
    ));

    let tracker = RegistryTracker::new(&config, cache, coordinator);
    tracker.tick().await.expect("tick should succeed");

    let chosen = tracker
        .latest_hash(UUID)
        .expect("a hash should have been chosen from the tie");
    assert!(
        chosen == hash1 || chosen == hash2,
        "chosen hash must be one of the two tied candidates"
    );

    let published = tokio::fs::read_to_string(
        std::path::Path::new(&config.cache.root)
            .join("static")
            .join("registries"),
    )
    .await
    .unwrap();
    assert_eq!(published, format!("/registry/{UUID}/{chosen}\n"));

    // Re-running the tick is idempotent: the same winner is chosen again.
    let tracker2_cache = Arc::new(Cache::new(
        config.cache.root.clone(),
        config.cache.size_limit_bytes,
    ));
    let tracker2_coordinator = Arc::new(FetchCoordinator::new(
        reqwest::Client::new(),
        config.storage_servers.clone(),
        config.security.clone(),
        config.cache.temp_root.clone().into(),
        Arc::clone(&tracker2_cache),
    ));
    let tracker2 = RegistryTracker::new(&config, tracker2_cache, tracker2_coordinator);
    tracker2.tick().await.expect("second tick should succeed");
    assert_eq!(tracker2.latest_hash(UUID).unwrap(), chosen);
}
