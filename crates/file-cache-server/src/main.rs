//! File Cache Server - streaming, concurrency-safe file cache over HTTP
//!
//! Stores byte content by key on the local filesystem and serves it back
//! with range support. Misses can be populated from an upstream origin.

mod conditional;
mod error;
mod origin;
mod server;
mod types;

use crate::error::{Result, ServerError};
use crate::origin::HttpOrigin;
use crate::server::{start_server, ServerState, SharedState};
use crate::types::ServerConfig;
use std::path::PathBuf;
use std::sync::Arc;
use stream_file_cache::{FileCache, DEFAULT_CHUNK_SIZE};
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter =
        EnvFilter::from_default_env().add_directive("file_cache_server=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting file cache server...");

    let config = load_config();
    info!("Port: {}", config.port);
    info!("Cache dir: {:?}", config.cache_dir);
    info!(
        "Max cache size: {} MB",
        config.max_cache_size / (1024 * 1024)
    );
    info!("Max age: {:?} seconds", config.max_age_secs);
    info!("Origin: {}", config.origin_url.as_deref().unwrap_or("none"));

    let mut cache = FileCache::filesystem(config.cache_config());
    if let Some(url) = &config.origin_url {
        cache = cache.with_origin(Arc::new(HttpOrigin::new(url.clone())));
    }
    cache.init().await?;
    let sweeper = cache.spawn_sweeper();

    let state: SharedState = Arc::new(ServerState::new(cache));

    // Serve until a shutdown signal arrives
    let served = start_server(state, config.port)
        .await
        .map_err(ServerError::from);
    sweeper.abort();
    info!("Server shutdown complete");

    served
}

fn load_config() -> ServerConfig {
    let defaults = ServerConfig::default();

    let port = env_parse("PORT").unwrap_or(defaults.port);

    let cache_dir = std::env::var("CACHE_DIR")
        .map(PathBuf::from)
        .unwrap_or(defaults.cache_dir);

    let max_cache_size = env_parse("MAX_CACHE_SIZE").unwrap_or(defaults.max_cache_size);

    let chunk_size = env_parse("CHUNK_SIZE")
        .filter(|&size: &usize| size > 0)
        .unwrap_or(DEFAULT_CHUNK_SIZE);

    let sweep_interval_secs =
        env_parse("SWEEP_INTERVAL_SECS").unwrap_or(defaults.sweep_interval_secs);

    let origin_url = std::env::var("ORIGIN_URL")
        .ok()
        .filter(|url| !url.trim().is_empty());

    ServerConfig {
        port,
        cache_dir,
        max_cache_size,
        max_age_secs: env_parse("CACHE_MAX_AGE_SECS"),
        chunk_size,
        max_entries: env_parse("MAX_ENTRIES"),
        sweep_interval_secs,
        origin_url,
    }
}

/// Parse an environment variable, `None` when unset or malformed
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}
