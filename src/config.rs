// src/config.rs

//! Layered configuration: a [`RawConfig`] deserialized straight from TOML with
//! `#[serde(default = "...")]` on every field, resolved into a validated [`Config`]
//! by [`Config::from_file`].

use std::fs;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_hostname")]
    hostname: String,

    #[serde(default = "default_storage_servers")]
    storage_servers: Vec<String>,

    #[serde(default)]
    registries: Vec<RawRegistryConfig>,

    #[serde(default = "default_registry_poll_interval_secs")]
    registry_poll_interval_secs: u64,

    #[serde(default)]
    cache: RawCacheConfig,

    #[serde(default)]
    security: SecurityConfig,

    #[serde(default)]
    metrics: MetricsConfig,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            hostname: default_hostname(),
            storage_servers: default_storage_servers(),
            registries: Vec::new(),
            registry_poll_interval_secs: default_registry_poll_interval_secs(),
            cache: RawCacheConfig::default(),
            security: SecurityConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawRegistryConfig {
    uuid: String,
    origin_url_template: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawCacheConfig {
    #[serde(default = "default_cache_size_limit")]
    size_limit: String,
    #[serde(default = "default_cache_root")]
    root: String,
    #[serde(default = "default_temp_root")]
    temp_root: String,
}

impl Default for RawCacheConfig {
    fn default() -> Self {
        Self {
            size_limit: default_cache_size_limit(),
            root: default_cache_root(),
            temp_root: default_temp_root(),
        }
    }
}

/// SSRF protections shared by the upstream selector and the registry tracker's
/// origin verification.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Glob patterns for domains the selector and tracker may connect to.
    /// Empty means all domains are allowed.
    #[serde(default)]
    pub allowed_fetch_domains: Vec<String>,
    /// If false, refuse to connect to private, loopback, link-local, or other
    /// non-globally-routable IPs, to prevent SSRF.
    #[serde(default)]
    pub allow_private_fetch_ips: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_fetch_domains: Vec::new(),
            allow_private_fetch_ips: false,
        }
    }
}

/// Controls the side-channel Prometheus metrics server.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8787
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_hostname() -> String {
    "localhost".to_string()
}
fn default_storage_servers() -> Vec<String> {
    Vec::new()
}
fn default_registry_poll_interval_secs() -> u64 {
    300
}
fn default_cache_size_limit() -> String {
    "10gb".to_string()
}
fn default_cache_root() -> String {
    "pkgvault_data/cache".to_string()
}
fn default_temp_root() -> String {
    "pkgvault_data/tmp".to_string()
}
fn default_metrics_port() -> u16 {
    8878
}

/// One configured upstream registry: its UUID and the URL template used to derive
/// an archive URL on its origin for verification (`{hash}` is substituted in).
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub uuid: String,
    pub origin_url_template: String,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub size_limit_bytes: u64,
    pub root: String,
    pub temp_root: String,
}

/// The fully resolved, validated configuration used throughout the process.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub hostname: String,
    pub storage_servers: Vec<String>,
    pub registries: Vec<RegistryConfig>,
    pub registry_poll_interval_secs: u64,
    pub cache: CacheConfig,
    pub security: SecurityConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML from '{path}'"))?;
        Self::from_raw(raw)
    }

    /// Builds a [`Config`] with all defaults, used by tests and by `--port`-only
    /// invocations that skip a config file entirely.
    pub fn default_with_overrides(host: Option<String>, port: Option<u16>) -> Result<Self> {
        let mut raw = RawConfig::default();
        if let Some(host) = host {
            raw.host = host;
        }
        if let Some(port) = port {
            raw.port = port;
        }
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let size_limit_bytes = parse_byte_size(&raw.cache.size_limit)?;

        let registries = raw
            .registries
            .into_iter()
            .map(|r| RegistryConfig {
                uuid: r.uuid,
                origin_url_template: r.origin_url_template,
            })
            .collect();

        let config = Config {
            host: raw.host,
            port: raw.port,
            log_level: raw.log_level,
            hostname: raw.hostname,
            storage_servers: raw.storage_servers,
            registries,
            registry_poll_interval_secs: raw.registry_poll_interval_secs,
            cache: CacheConfig {
                size_limit_bytes,
                root: raw.cache.root,
                temp_root: raw.cache.temp_root,
            },
            security: raw.security,
            metrics: raw.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("`port` must be non-zero"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("`host` must not be empty"));
        }
        if self.hostname.trim().is_empty() {
            return Err(anyhow!("`hostname` must not be empty"));
        }
        if self.cache.size_limit_bytes == 0 {
            return Err(anyhow!("`cache.size_limit` must be non-zero"));
        }
        if self.cache.root.trim().is_empty() {
            return Err(anyhow!("`cache.root` must not be empty"));
        }
        if self.registry_poll_interval_secs == 0 {
            return Err(anyhow!("`registry_poll_interval_secs` must be non-zero"));
        }
        for reg in &self.registries {
            if reg.uuid.trim().is_empty() {
                return Err(anyhow!("a configured registry has an empty uuid"));
            }
            if !reg.origin_url_template.contains("{hash}") {
                return Err(anyhow!(
                    "registry '{}' origin_url_template must contain a {{hash}} placeholder",
                    reg.uuid
                ));
            }
        }
        if self.metrics.enabled && self.metrics.port == self.port {
            return Err(anyhow!(
                "metrics.port must differ from the main server port"
            ));
        }
        Ok(())
    }
}

/// Parses a byte-size string with an optional unit suffix (`gb`, `g`, `mb`, `m`,
/// `kb`, `k`), the same convention used for `maxmemory`-style settings.
fn parse_byte_size(input: &str) -> Result<u64> {
    let s = input.trim();
    if s.is_empty() {
        return Err(anyhow!("empty byte size value"));
    }
    let lower = s.to_ascii_lowercase();

    let (value_str, multiplier) = if let Some(v) = lower.strip_suffix("gb").or(lower.strip_suffix("g"))
    {
        (v, 1024 * 1024 * 1024)
    } else if let Some(v) = lower.strip_suffix("mb").or(lower.strip_suffix("m")) {
        (v, 1024 * 1024)
    } else if let Some(v) = lower.strip_suffix("kb").or(lower.strip_suffix("k")) {
        (v, 1024)
    } else {
        (lower.as_str(), 1)
    };

    let value: u64 = value_str
        .trim()
        .parse()
        .with_context(|| format!("invalid number in byte size value: '{input}'"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("byte size value '{input}' overflows a 64-bit integer"))
}
