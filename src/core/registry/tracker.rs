// src/core/registry/tracker.rs

//! The registry tracker (C6): periodically asks every storage server which
//! registry hashes it advertises, verifies candidates against their origin,
//! and publishes the preferred hash per registry UUID.
//!
//! The tick loop follows the same `tokio::select!` interval-plus-shutdown
//! pattern used by this codebase's other background maintenance tasks.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::Client;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, RegistryConfig, SecurityConfig};
use crate::core::cache::lru::Cache;
use crate::core::errors::PkgVaultError;
use crate::core::fetch::coordinator::{FetchCoordinator, FetchResult};
use crate::core::fetch::selector::validate_fetch_url;
use crate::core::metrics;
use crate::core::resource::ResourceKey;

pub struct RegistryTracker {
    client: Client,
    servers: Vec<String>,
    registries: Vec<RegistryConfig>,
    security: SecurityConfig,
    latest_hashes: RwLock<HashMap<String, String>>,
    published_path: PathBuf,
    temp_root: PathBuf,
    cache: Arc<Cache>,
    coordinator: Arc<FetchCoordinator>,
}

impl RegistryTracker {
    pub fn new(config: &Config, cache: Arc<Cache>, coordinator: Arc<FetchCoordinator>) -> Self {
        Self {
            client: Client::new(),
            servers: config.storage_servers.clone(),
            registries: config.registries.clone(),
            security: config.security.clone(),
            latest_hashes: RwLock::new(HashMap::new()),
            published_path: PathBuf::from(&config.cache.root).join("static").join("registries"),
            temp_root: PathBuf::from(&config.cache.temp_root),
            cache,
            coordinator,
        }
    }

    pub fn latest_hash(&self, uuid: &str) -> Option<String> {
        self.latest_hashes.read().get(uuid).cloned()
    }

    /// Runs one tick per `interval` until `shutdown_rx` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "registry tracker tick failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("registry tracker shutting down");
                    return;
                }
            }
        }
    }

    pub async fn tick(&self) -> Result<(), PkgVaultError> {
        metrics::REGISTRY_TICKS_TOTAL.inc();

        let advertisements = self.gather_advertisements().await;
        let mut changed = false;

        for registry in &self.registries {
            let Some(candidates) = advertisements.get(&registry.uuid) else {
                continue;
            };

            let mut ordered: Vec<(String, usize)> = candidates
                .iter()
                .map(|(hash, servers)| (hash.clone(), servers.len()))
                .collect();
            // Ascending advertiser count: prefer the hash advertised by fewest
            // servers, i.e. the newest. Tie-break lexicographically so the
            // outcome is deterministic regardless of HashMap iteration order.
            ordered.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

            if let Some(chosen) = self.resolve_latest_hash(registry, ordered).await {
                let mut latest = self.latest_hashes.write();
                if latest.get(&registry.uuid) != Some(&chosen) {
                    latest.insert(registry.uuid.clone(), chosen);
                    changed = true;
                }
            }
        }

        if changed || !self.published_path.exists() {
            self.publish_index().await?;
        }

        Ok(())
    }

    async fn gather_advertisements(&self) -> HashMap<String, HashMap<String, HashSet<String>>> {
        let mut result: HashMap<String, HashMap<String, HashSet<String>>> = HashMap::new();
        let known_uuids: HashSet<&str> = self.registries.iter().map(|r| r.uuid.as_str()).collect();

        for server in &self.servers {
            let url = format!("{}/registries", server.trim_end_matches('/'));
            let response = match self.client.get(&url).send().await {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    debug!(url, status = %r.status(), "registries listing returned non-2xx");
                    continue;
                }
                Err(e) => {
                    debug!(url, error = %e, "registries listing request failed");
                    continue;
                }
            };
            let body = match response.text().await {
                Ok(b) => b,
                Err(_) => continue,
            };

            for line in body.lines() {
                let Ok(key) = ResourceKey::parse(line.trim()) else {
                    continue;
                };
                if let ResourceKey::Registry { uuid, hash } = key {
                    if !known_uuids.contains(uuid.as_str()) {
                        continue;
                    }
                    result
                        .entry(uuid)
                        .or_default()
                        .entry(hash)
                        .or_default()
                        .insert(server.clone());
                }
            }
        }

        // Probe servers that didn't advertise a candidate hash, in case they
        // have it but omitted it from their index.
        for (uuid, hashes) in result.iter_mut() {
            for (hash, advertisers) in hashes.iter_mut() {
                for server in &self.servers {
                    if advertisers.contains(server) {
                        continue;
                    }
                    let url = format!(
                        "{}/registry/{}/{}",
                        server.trim_end_matches('/'),
                        uuid,
                        hash
                    );
                    if let Ok(resp) = self.client.head(&url).send().await {
                        if resp.status().is_success() {
                            advertisers.insert(server.clone());
                        }
                    }
                }
            }
        }

        result
    }

    async fn resolve_latest_hash(
        &self,
        registry: &RegistryConfig,
        candidates: Vec<(String, usize)>,
    ) -> Option<String> {
        for (hash, _count) in candidates {
            if !self.verify_origin(registry, &hash).await {
                metrics::REGISTRY_UNTRUSTED_TOTAL.inc();
                continue;
            }

            let key = ResourceKey::Registry {
                uuid: registry.uuid.clone(),
                hash: hash.clone(),
            };
            if self.cache.contains(&key) {
                return Some(hash);
            }
            match self.coordinator.fetch(key).await {
                FetchResult::InProgress(handle) => match handle.join().await {
                    Ok(_) => return Some(hash),
                    Err(e) => {
                        debug!(uuid = %registry.uuid, hash, error = %e, "candidate hash failed to download");
                    }
                },
                FetchResult::RecentFailure | FetchResult::NoUpstream => {}
            }
        }
        None
    }

    async fn verify_origin(&self, registry: &RegistryConfig, hash: &str) -> bool {
        let url = registry.origin_url_template.replace("{hash}", hash);
        if let Err(e) = validate_fetch_url(&url, &self.security) {
            warn!(uuid = %registry.uuid, hash, error = %e, "origin URL failed SSRF validation");
            return false;
        }
        match self.client.head(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn publish_index(&self) -> Result<(), PkgVaultError> {
        let latest = self.latest_hashes.read().clone();
        let mut uuids: Vec<&String> = latest.keys().collect();
        uuids.sort();

        let mut content = String::new();
        for uuid in uuids {
            content.push_str(&format!("/registry/{}/{}\n", uuid, latest[uuid]));
        }

        if let Some(parent) = self.published_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::create_dir_all(&self.temp_root).await?;
        let staging = self
            .temp_root
            .join(format!("registries.tmp.{}", Uuid::new_v4()));
        tokio::fs::write(&staging, content).await?;
        tokio::fs::rename(&staging, &self.published_path).await?;
        metrics::REGISTRY_HASH_UPDATES_TOTAL.inc();
        info!(path = %self.published_path.display(), "published registries index");
        Ok(())
    }
}
