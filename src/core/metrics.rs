// src/core/metrics.rs

//! Prometheus metrics for the cache, fetch, and registry-tracker subsystems.
//!
//! `lazy_static` ensures metrics register exactly once for the process lifetime.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Cache (C1) ---
    /// Total number of resource requests served directly from the on-disk cache.
    pub static ref CACHE_HITS_TOTAL: Counter =
        register_counter!("pkgvault_cache_hits_total", "Total number of cache hits.").unwrap();
    /// Total number of resource requests that missed the on-disk cache.
    pub static ref CACHE_MISSES_TOTAL: Counter =
        register_counter!("pkgvault_cache_misses_total", "Total number of cache misses.").unwrap();
    /// Total number of cache entries evicted to stay under the size budget.
    pub static ref CACHE_EVICTIONS_TOTAL: Counter =
        register_counter!("pkgvault_cache_evictions_total", "Total number of cache entries evicted.").unwrap();
    /// Current total size, in bytes, of all resident cache entries.
    pub static ref CACHE_SIZE_BYTES: Gauge =
        register_gauge!("pkgvault_cache_size_bytes", "Current total size of resident cache entries in bytes.").unwrap();

    // --- Fetch coordinator / downloader (C3, C5) ---
    /// Total number of downloads that joined an already in-flight fetch rather
    /// than starting a new one.
    pub static ref FETCH_COALESCED_TOTAL: Counter =
        register_counter!("pkgvault_fetch_coalesced_total", "Total number of fetches that joined an in-flight download.").unwrap();
    /// Total number of downloads started from scratch.
    pub static ref FETCH_STARTED_TOTAL: Counter =
        register_counter!("pkgvault_fetch_started_total", "Total number of downloads started.").unwrap();
    /// Total number of downloads that failed hash verification.
    pub static ref FETCH_HASH_MISMATCH_TOTAL: Counter =
        register_counter!("pkgvault_fetch_hash_mismatch_total", "Total number of downloads rejected for hash mismatch.").unwrap();
    /// Total number of downloads that failed for any reason, labeled by outcome.
    pub static ref FETCH_FAILURES_TOTAL: CounterVec =
        register_counter_vec!("pkgvault_fetch_failures_total", "Total number of failed fetches, labeled by reason.", &["reason"]).unwrap();
    /// Total decompressed bytes written into the cache across all downloads.
    pub static ref PAYLOAD_BYTES_WRITTEN_TOTAL: Counter =
        register_counter!("pkgvault_payload_bytes_written_total", "Total bytes written to the cache by completed downloads.").unwrap();
    /// Number of downloads currently in flight.
    pub static ref DOWNLOADS_IN_FLIGHT: Gauge =
        register_gauge!("pkgvault_downloads_in_flight", "Number of downloads currently in progress.").unwrap();
    /// Download duration from selector dispatch to commit.
    pub static ref DOWNLOAD_DURATION_SECONDS: Histogram =
        register_histogram!("pkgvault_download_duration_seconds", "Duration of a completed download in seconds.").unwrap();

    // --- Registry tracker (C6) ---
    /// Total number of registry tracker ticks run.
    pub static ref REGISTRY_TICKS_TOTAL: Counter =
        register_counter!("pkgvault_registry_ticks_total", "Total number of registry tracker ticks.").unwrap();
    /// Total number of registry hash updates published.
    pub static ref REGISTRY_HASH_UPDATES_TOTAL: Counter =
        register_counter!("pkgvault_registry_hash_updates_total", "Total number of registry latest-hash updates published.").unwrap();
    /// Total number of registry hashes rejected by origin verification.
    pub static ref REGISTRY_UNTRUSTED_TOTAL: Counter =
        register_counter!("pkgvault_registry_untrusted_total", "Total number of registry hashes rejected by origin verification.").unwrap();

    // --- Range serve (C7) ---
    /// Total bytes served to clients over all resource responses.
    pub static ref BYTES_SERVED_TOTAL: Counter =
        register_counter!("pkgvault_bytes_served_total", "Total bytes served to clients.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
