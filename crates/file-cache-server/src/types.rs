//! Core types for the file cache server

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use stream_file_cache::{CacheConfig, CacheStats, DEFAULT_CHUNK_SIZE};

/// Configuration for the file cache server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub cache_dir: PathBuf,
    pub max_cache_size: u64,
    pub max_age_secs: Option<u64>,
    pub chunk_size: usize,
    pub max_entries: Option<usize>,
    pub sweep_interval_secs: u64,
    /// Base URL GET misses are fetched from
    pub origin_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7070,
            cache_dir: PathBuf::from("./_cache"),
            max_cache_size: 1024 * 1024 * 1024, // 1GB
            max_age_secs: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_entries: None,
            sweep_interval_secs: 60,
            origin_url: None,
        }
    }
}

impl ServerConfig {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            root_dir: self.cache_dir.clone(),
            capacity_bytes: self.max_cache_size,
            max_age: self.max_age_secs.map(Duration::from_secs),
            chunk_size: self.chunk_size,
            max_entries: self.max_entries,
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStats,
}
