// src/core/fetch/selector.rs

//! Upstream selection (C4): a concurrent HEAD-probe race across candidate
//! storage servers. The first 200 OK wins; the rest are abandoned.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::Client;
use tracing::{debug, warn};
use wildmatch::WildMatch;

use crate::config::SecurityConfig;
use crate::core::errors::PkgVaultError;
use crate::core::resource::ResourceKey;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RETRIES: u32 = 2;

/// The outcome of a winning HEAD probe.
#[derive(Debug, Clone)]
pub struct SelectedUpstream {
    pub server: String,
    pub content_length: Option<u64>,
}

/// Races a HEAD request against every server for `key`, returning the first
/// one to answer 200 OK. Every candidate URL is validated against SSRF
/// protections before being dialed.
pub async fn select(
    client: &Client,
    servers: &[String],
    key: &ResourceKey,
    security: &SecurityConfig,
) -> Option<SelectedUpstream> {
    let mut probes = FuturesUnordered::new();
    for server in servers {
        let url = format!("{}/{}", server.trim_end_matches('/'), key.to_path_string());
        if let Err(e) = validate_fetch_url(&url, security) {
            warn!(url = %url, error = %e, "skipping candidate server: failed SSRF validation");
            continue;
        }
        let server = server.clone();
        let client = client.clone();
        probes.push(async move { probe_once(&client, &server, &url).await });
    }

    while let Some(result) = probes.next().await {
        if let Some(selected) = result {
            return Some(selected);
        }
    }
    None
}

async fn probe_once(client: &Client, server: &str, url: &str) -> Option<SelectedUpstream> {
    for attempt in 0..=DEFAULT_RETRIES {
        let response = client.head(url).timeout(DEFAULT_TIMEOUT).send().await;
        match response {
            Ok(resp) if resp.status().is_success() => {
                let content_length = resp
                    .headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                return Some(SelectedUpstream {
                    server: server.to_string(),
                    content_length,
                });
            }
            Ok(resp) => {
                debug!(url, status = %resp.status(), attempt, "probe returned non-2xx");
                return None;
            }
            Err(e) => {
                debug!(url, error = %e, attempt, "probe failed, retrying");
            }
        }
    }
    None
}

/// Validates a candidate fetch URL against the configured domain allowlist and
/// rejects targets that resolve to a non-globally-routable IP, unless private
/// fetches are explicitly allowed. This is the same SSRF protection a
/// fetch-to-arbitrary-origin operation needs anywhere in this codebase.
pub fn validate_fetch_url(url_str: &str, security: &SecurityConfig) -> Result<(), PkgVaultError> {
    let url = url::Url::parse(url_str)
        .map_err(|e| PkgVaultError::InvalidRequest(format!("invalid URL '{url_str}': {e}")))?;

    let host = url
        .host_str()
        .ok_or_else(|| PkgVaultError::InvalidRequest(format!("URL '{url_str}' has no host")))?;

    if !security.allowed_fetch_domains.is_empty() {
        let allowed = security
            .allowed_fetch_domains
            .iter()
            .any(|pattern| WildMatch::new(pattern).matches(host));
        if !allowed {
            return Err(PkgVaultError::SecurityViolation(format!(
                "domain '{host}' is not in the allowed_fetch_domains allowlist"
            )));
        }
    }

    if security.allow_private_fetch_ips {
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(443);
    let host_with_port = format!("{host}:{port}");
    let addrs: Vec<SocketAddr> = host_with_port
        .to_socket_addrs()
        .map_err(|e| {
            PkgVaultError::SecurityViolation(format!("could not resolve host '{host}': {e}"))
        })?
        .collect();

    if addrs.is_empty() {
        return Err(PkgVaultError::SecurityViolation(format!(
            "host '{host}' resolved to no addresses"
        )));
    }

    for addr in addrs {
        if !is_globally_routable(addr.ip()) {
            return Err(PkgVaultError::SecurityViolation(format!(
                "host '{host}' resolves to non-globally-routable address {}",
                addr.ip()
            )));
        }
    }

    Ok(())
}

fn is_globally_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !v4.is_private()
                && !v4.is_loopback()
                && !v4.is_link_local()
                && !v4.is_broadcast()
                && !v4.is_documentation()
                && !v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return false;
            }
            // Global unicast: top three bits are 001 (2000::/3).
            (v6.segments()[0] & 0xe000) == 0x2000
        }
    }
}
