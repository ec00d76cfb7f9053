//! HTTP server for file cache endpoints
//!
//! Provides /health, /stats and GET/HEAD/PUT/DELETE on /data/{*key}.

use crate::conditional::{http_date, is_not_modified};
use crate::error::ApiError;
use crate::types::HealthResponse;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use std::io;
use std::sync::Arc;
use stream_file_cache::{
    CacheKey, CacheStats, DeleteStatus, EntryInfo, FileCache, GetStatus, RangeSpec,
};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

/// Shared state for the HTTP server
pub struct ServerState {
    pub cache: FileCache,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(cache: FileCache) -> Self {
        Self {
            cache,
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route(
            "/data/{*key}",
            get(get_entry)
                .head(head_entry)
                .put(put_entry)
                .delete(delete_entry),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server; returns after a shutdown signal once connections drain
pub async fn start_server(state: SharedState, port: u16) -> io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Unable to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Received shutdown signal, draining connections...");
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: state.cache.stats(),
    })
}

async fn stats(State(state): State<SharedState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

/// Headers every successful entry response carries
fn entry_headers(mut builder: axum::http::response::Builder, info: &EntryInfo) -> axum::http::response::Builder {
    builder = builder
        .header(header::ACCEPT_RANGES, "bytes")
        .header(
            header::CONTENT_TYPE,
            info.content_type
                .as_deref()
                .unwrap_or("application/octet-stream"),
        );
    if let Some(etag) = &info.etag {
        builder = builder.header(header::ETAG, etag);
    }
    // Only meaningful once the content is complete
    if info.size.is_some() {
        builder = builder.header(header::LAST_MODIFIED, http_date(info.modified_at));
    }
    builder
}

fn not_modified(info: &EntryInfo) -> Response {
    let mut builder = Response::builder().status(StatusCode::NOT_MODIFIED);
    if let Some(etag) = &info.etag {
        builder = builder.header(header::ETAG, etag);
    }
    builder
        .header(header::LAST_MODIFIED, http_date(info.modified_at))
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// GET /data/{*key}
async fn get_entry(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let key = CacheKey::from(key);

    // Conditional requests are answered without opening a transfer
    if let Ok(info) = state.cache.head(&key) {
        if is_not_modified(&headers, &info) {
            return Ok(not_modified(&info));
        }
    }

    // An unparsable Range header is ignored and the full entry served
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(RangeSpec::parse);

    let response = state.cache.handle_get(&key, range).await?;
    let cache_header = match response.status {
        GetStatus::Found => "HIT",
        GetStatus::NotFoundYet => "MISS",
    };
    debug!(key = %key, range = ?response.range, cache = cache_header, "Serving entry");

    let mut builder = entry_headers(Response::builder(), &response.info).header("X-Cache", cache_header);
    builder = match (response.range, response.info.size) {
        (Some(range), Some(size)) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, range.content_range(size))
            .header(header::CONTENT_LENGTH, range.len()),
        // Range already durable while the population is still running
        (Some(range), None) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, range.content_range_unknown_size())
            .header(header::CONTENT_LENGTH, range.len()),
        (None, Some(size)) => builder
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, size),
        // Still populating: length unknown, body is chunked
        _ => builder.status(StatusCode::OK),
    };

    Ok(builder
        .body(Body::from_stream(response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

/// HEAD /data/{*key}
async fn head_entry(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let info = state.cache.head(&CacheKey::from(key))?;
    if is_not_modified(&headers, &info) {
        return Ok(not_modified(&info));
    }

    let mut builder = entry_headers(Response::builder().status(StatusCode::OK), &info);
    if let Some(size) = info.size {
        builder = builder.header(header::CONTENT_LENGTH, size);
    }
    Ok(builder
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

/// PUT /data/{*key}
async fn put_entry(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<EntryInfo>), ApiError> {
    let key = CacheKey::from(key);
    let content_type = match headers.get(header::CONTENT_TYPE) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| ApiError::BadRequest("Invalid Content-Type".to_string()))?
                .to_string(),
        ),
        None => None,
    };

    let stream = body.into_data_stream().map_err(io::Error::other).boxed();
    let info = state.cache.handle_put(&key, content_type, stream).await?;
    info!(key = %key, generation = info.generation, size = ?info.size, "Stored entry");

    Ok((StatusCode::CREATED, Json(info)))
}

/// DELETE /data/{*key}
async fn delete_entry(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.cache.handle_delete(&CacheKey::from(key)).await {
        DeleteStatus::Deleted => Ok(StatusCode::NO_CONTENT),
        DeleteStatus::NotFound => Err(stream_file_cache::CacheError::NotFound.into()),
    }
}
