// src/server/range.rs

//! Range-aware streaming serve (C7): parses a single `Range` header, and
//! streams bytes from a file that may still be growing as a download
//! completes it, spin-waiting past not-yet-written bytes and retrying short
//! reads while a `DownloadHandle` reports the file as still in progress.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::error;

use crate::core::cache::CacheGuard;
use crate::core::fetch::coordinator::DownloadHandle;
use crate::core::resource::ResourceKey;

const READ_BUFFER_BYTES: usize = 2 * 1024 * 1024;
const SEEK_SPIN_WAIT: Duration = Duration::from_millis(10);
const READ_RETRY_SLEEP: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
}

/// Parses a single `Range: bytes=a-b` / `bytes=a-` / `bytes=-b` header value.
/// Returns `None` if the header is absent, malformed, or logically invalid
/// (`a > b`) — callers fall back to serving the full body in that case.
pub fn parse_range(header_value: &str, content_length: u64) -> Option<RangeSpec> {
    let spec = header_value.strip_prefix("bytes=")?;
    // Only a single range is supported; reject anything with a comma.
    if spec.contains(',') {
        return None;
    }
    let (start_str, end_str) = spec.split_once('-')?;
    let start_str = start_str.trim();
    let end_str = end_str.trim();

    match (start_str.is_empty(), end_str.is_empty()) {
        (true, true) => None,
        (true, false) => {
            let suffix_len: u64 = end_str.parse().ok()?;
            let start = content_length.saturating_sub(suffix_len);
            Some(RangeSpec {
                start,
                end: content_length.saturating_sub(1),
            })
        }
        (false, true) => {
            let start: u64 = start_str.parse().ok()?;
            if start >= content_length {
                return None;
            }
            Some(RangeSpec {
                start,
                end: content_length.saturating_sub(1),
            })
        }
        (false, false) => {
            let start: u64 = start_str.parse().ok()?;
            let end: u64 = end_str.parse().ok()?;
            if start > end {
                return None;
            }
            Some(RangeSpec {
                start,
                end: end.min(content_length.saturating_sub(1)),
            })
        }
    }
}

/// Serves `path` (which must eventually reach `content_length` bytes) as a GET
/// response, honoring `headers`' `Range` entry if present. `download` is
/// `Some` while the file may still be growing; `None` for a fully resident
/// cache hit.
pub async fn serve_file(
    key: &ResourceKey,
    path: PathBuf,
    content_length: u64,
    content_type: &'static str,
    content_encoding: Option<&'static str>,
    headers: &HeaderMap,
    is_head: bool,
    download: Option<Arc<DownloadHandle>>,
    pin: Option<CacheGuard>,
) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range(v, content_length));

    let (status, start, end) = match range {
        Some(r) => (StatusCode::PARTIAL_CONTENT, r.start, r.end),
        None => (StatusCode::OK, 0, content_length.saturating_sub(1)),
    };
    let body_len = end.saturating_sub(start) + 1;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_LENGTH, body_len.into());
    response_headers.insert(
        header::ACCEPT_RANGES,
        HeaderValue::from_static("bytes"),
    );
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type),
    );
    if let Some(encoding) = content_encoding {
        if encoding != "identity" {
            response_headers.insert(
                header::CONTENT_ENCODING,
                HeaderValue::from_static(encoding),
            );
        }
    }
    if status == StatusCode::PARTIAL_CONTENT {
        response_headers.insert(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{content_length}")
                .parse()
                .unwrap(),
        );
    }

    if is_head {
        let mut resp = StatusCode::OK.into_response();
        *resp.status_mut() = status;
        resp.headers_mut().extend(response_headers);
        return resp;
    }

    let key = key.clone();
    let stream = async_stream::stream! {
        // Held for the entire body transfer so a cache hit cannot be evicted
        // out from under an in-progress response; dropped when the stream
        // finishes or the client disconnects.
        let _pin = pin;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                error!(%key, error = %e, "failed to open cache file for serving");
                return;
            }
        };

        // Spin-wait past the end of the file if the download hasn't written
        // this far yet.
        loop {
            let file_len = match file.metadata().await {
                Ok(m) => m.len(),
                Err(_) => break,
            };
            if file_len >= start || download.as_ref().map(|d| d.is_done()).unwrap_or(true) {
                break;
            }
            tokio::time::sleep(SEEK_SPIN_WAIT).await;
        }
        if let Err(e) = file.seek(std::io::SeekFrom::Start(start)).await {
            error!(%key, error = %e, "failed to seek cache file");
            return;
        }

        let mut remaining = body_len;
        let mut transmitted: u64 = 0;
        let mut buf = vec![0u8; READ_BUFFER_BYTES];

        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            match file.read(&mut buf[..want]).await {
                Ok(0) => {
                    let still_going = download.as_ref().map(|d| !d.is_done()).unwrap_or(false);
                    if still_going {
                        tokio::time::sleep(READ_RETRY_SLEEP).await;
                        continue;
                    }
                    break;
                }
                Ok(n) => {
                    let n64 = n as u64;
                    remaining -= n64.min(remaining);
                    transmitted += n64;
                    yield Ok::<_, std::io::Error>(bytes::Bytes::copy_from_slice(&buf[..n]));
                }
                Err(e) => {
                    error!(%key, error = %e, "error reading cache file during serve");
                    break;
                }
            }
        }

        if transmitted != body_len {
            error!(%key, transmitted, expected = body_len, "serve terminated before declared length");
        }
        crate::core::metrics::BYTES_SERVED_TOTAL.inc_by(transmitted as f64);
    };

    let mut resp = Response::new(Body::from_stream(stream));
    *resp.status_mut() = status;
    resp.headers_mut().extend(response_headers);
    resp
}
