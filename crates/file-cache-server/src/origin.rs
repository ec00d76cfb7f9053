//! Upstream HTTP origin for GET misses

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use std::io;
use stream_file_cache::{CacheError, CacheKey, Origin, Result, Upstream};
use tracing::debug;

/// Fetches missing keys from `{base_url}/{key}`
pub struct HttpOrigin {
    client: Client,
    base_url: String,
}

impl HttpOrigin {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Upstream URL for `key`, each path segment percent-encoded
    pub fn object_url(&self, key: &CacheKey) -> String {
        let path: Vec<String> = key
            .to_string()
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}", self.base_url, path.join("/"))
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch(&self, key: &CacheKey) -> Result<Option<Upstream>> {
        let url = self.object_url(key);
        debug!(url = %url, "Fetching from origin");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(CacheError::population)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CacheError::population(format!(
                "origin returned status {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        Ok(Some(Upstream {
            content_type,
            body: response.bytes_stream().map_err(io::Error::other).boxed(),
        }))
    }
}
