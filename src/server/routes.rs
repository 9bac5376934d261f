// src/server/routes.rs

//! Inbound HTTP surface: the published registries index and the three
//! content-addressed resource paths.

use axum::Router;
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tracing::debug;

use crate::core::fetch::coordinator::FetchResult;
use crate::core::metrics;
use crate::core::resource::ResourceKey;
use crate::server::range;
use crate::server::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/registries", get(registries_index))
        .route("/registry/{uuid}/{hash}", get(serve_registry))
        .route("/package/{uuid}/{hash}", get(serve_package))
        .route("/artifact/{hash}", get(serve_artifact))
        .with_state(state)
}

async fn registries_index(State(state): State<AppState>) -> Response {
    let path = std::path::Path::new(&state.config.cache.root)
        .join("static")
        .join("registries");
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            contents,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "registries index not yet published").into_response(),
    }
}

async fn serve_registry(
    State(state): State<AppState>,
    AxumPath((uuid, hash)): AxumPath<(String, String)>,
    headers: HeaderMap,
    method: axum::http::Method,
) -> Response {
    match ResourceKey::parse(&format!("/registry/{uuid}/{hash}")) {
        Ok(key) => serve_resource(state, key, headers, method.as_str() == "HEAD").await,
        Err(e) => e.into_response(),
    }
}

async fn serve_package(
    State(state): State<AppState>,
    AxumPath((uuid, hash)): AxumPath<(String, String)>,
    headers: HeaderMap,
    method: axum::http::Method,
) -> Response {
    match ResourceKey::parse(&format!("/package/{uuid}/{hash}")) {
        Ok(key) => serve_resource(state, key, headers, method.as_str() == "HEAD").await,
        Err(e) => e.into_response(),
    }
}

async fn serve_artifact(
    State(state): State<AppState>,
    AxumPath(hash): AxumPath<String>,
    headers: HeaderMap,
    method: axum::http::Method,
) -> Response {
    match ResourceKey::parse(&format!("/artifact/{hash}")) {
        Ok(key) => serve_resource(state, key, headers, method.as_str() == "HEAD").await,
        Err(e) => e.into_response(),
    }
}

const CONTENT_TYPE: &str = "application/x-tar";
const CONTENT_ENCODING: &str = "gzip";

async fn serve_resource(
    state: AppState,
    key: ResourceKey,
    headers: HeaderMap,
    is_head: bool,
) -> Response {
    if let Some(path) = state.cache.touch(&key) {
        debug!(%key, "cache hit");
        metrics::CACHE_HITS_TOTAL.inc();
        let guard = state.cache.pin(key.clone());
        let content_length = match tokio::fs::metadata(&path).await {
            Ok(m) => m.len(),
            Err(_) => {
                return StatusCode::NOT_FOUND.into_response();
            }
        };
        return range::serve_file(
            &key,
            path,
            content_length,
            CONTENT_TYPE,
            Some(CONTENT_ENCODING),
            &headers,
            is_head,
            None,
            Some(guard),
        )
        .await;
    }

    metrics::CACHE_MISSES_TOTAL.inc();
    debug!(%key, "cache miss, attempting fetch");

    match state.coordinator.fetch(key.clone()).await {
        FetchResult::InProgress(handle) => {
            if let Some(content_length) = handle.content_length {
                range::serve_file(
                    &key,
                    handle.staging_path.clone(),
                    content_length,
                    CONTENT_TYPE,
                    Some(CONTENT_ENCODING),
                    &headers,
                    is_head,
                    Some(handle),
                    None,
                )
                .await
            } else {
                // No Content-Length from the upstream HEAD probe: wait for the
                // download to finish and serve the committed, fully-sized file.
                match handle.join().await {
                    Ok(committed_key) => {
                        if let Some(path) = state.cache.touch(&committed_key) {
                            let guard = state.cache.pin(committed_key.clone());
                            let content_length =
                                tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
                            range::serve_file(
                                &committed_key,
                                path,
                                content_length,
                                CONTENT_TYPE,
                                Some(CONTENT_ENCODING),
                                &headers,
                                is_head,
                                None,
                                Some(guard),
                            )
                            .await
                        } else {
                            StatusCode::NOT_FOUND.into_response()
                        }
                    }
                    Err(_) => StatusCode::NOT_FOUND.into_response(),
                }
            }
        }
        FetchResult::RecentFailure | FetchResult::NoUpstream => {
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
