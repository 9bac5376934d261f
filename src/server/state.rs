// src/server/state.rs

//! Shared application state handed to every Axum handler.

use std::sync::Arc;

use reqwest::Client;

use crate::config::Config;
use crate::core::cache::lru::Cache;
use crate::core::fetch::coordinator::FetchCoordinator;
use crate::core::registry::RegistryTracker;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<Cache>,
    pub coordinator: Arc<FetchCoordinator>,
    pub registry_tracker: Arc<RegistryTracker>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let cache = Arc::new(Cache::new(
            config.cache.root.clone(),
            config.cache.size_limit_bytes,
        ));
        let client = Client::new();
        let coordinator = Arc::new(FetchCoordinator::new(
            client,
            config.storage_servers.clone(),
            config.security.clone(),
            config.cache.temp_root.clone().into(),
            Arc::clone(&cache),
        ));
        let registry_tracker = Arc::new(RegistryTracker::new(
            &config,
            Arc::clone(&cache),
            Arc::clone(&coordinator),
        ));

        Self {
            config,
            cache,
            coordinator,
            registry_tracker,
        }
    }
}
