// src/core/errors.rs

//! The primary error type for the entire application.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// The main error enum, covering every failure kind the core components can surface.
///
/// `thiserror` gives us clean `Display` impls and `#[from]` conversions; callers that
/// need to retry or log differently per kind match on the variant rather than parsing
/// the message.
#[derive(Error, Debug, Clone)]
pub enum PkgVaultError {
    /// An upstream HEAD/GET failed, timed out, or returned a non-2xx status.
    /// Recoverable: the selector tries other servers, the coordinator reports a miss.
    #[error("upstream fetch failed: {0}")]
    TransientUpstream(String),

    /// Downloaded bytes did not hash to either tree-hash convention under the
    /// requested key. The key is recorded in the shard's failed set.
    #[error("downloaded content does not match expected hash")]
    HashMismatch,

    /// A registry hash failed origin verification and was skipped this tick.
    #[error("registry hash for {uuid} could not be verified against origin: {reason}")]
    UntrustedRegistry { uuid: String, reason: String },

    /// A reservation could not evict enough pinned entries to stay under budget.
    /// Not fatal: the reservation proceeds and the cache temporarily exceeds its limit.
    #[error("cache is full and all resident entries are pinned")]
    CacheFull,

    /// A filesystem operation inside the atomic writer or cache failed.
    #[error("disk I/O error: {0}")]
    DiskIo(Arc<std::io::Error>),

    /// A resource key, URL, or configuration value failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A candidate upstream URL was rejected by SSRF protections.
    #[error("security violation: {0}")]
    SecurityViolation(String),

    /// The requested resource is not cached and could not be fetched.
    #[error("resource not found")]
    NotFound,

    /// Violates an internal invariant; should never be triggered by untrusted input.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for PkgVaultError {
    fn from(e: std::io::Error) -> Self {
        PkgVaultError::DiskIo(Arc::new(e))
    }
}

impl From<reqwest::Error> for PkgVaultError {
    fn from(e: reqwest::Error) -> Self {
        PkgVaultError::TransientUpstream(e.to_string())
    }
}

impl From<url::ParseError> for PkgVaultError {
    fn from(e: url::ParseError) -> Self {
        PkgVaultError::InvalidRequest(format!("invalid URL: {e}"))
    }
}

impl IntoResponse for PkgVaultError {
    fn into_response(self) -> Response {
        let status = match &self {
            PkgVaultError::TransientUpstream(_) => StatusCode::BAD_GATEWAY,
            PkgVaultError::HashMismatch => StatusCode::NOT_FOUND,
            PkgVaultError::UntrustedRegistry { .. } => StatusCode::BAD_GATEWAY,
            PkgVaultError::CacheFull => StatusCode::OK,
            PkgVaultError::DiskIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PkgVaultError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PkgVaultError::SecurityViolation(_) => StatusCode::FORBIDDEN,
            PkgVaultError::NotFound => StatusCode::NOT_FOUND,
            PkgVaultError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Internal detail never reaches the client body, matching the taxonomy's
        // propagation policy.
        (status, ()).into_response()
    }
}
