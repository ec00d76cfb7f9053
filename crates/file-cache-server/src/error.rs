//! Error types for the file cache server

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::fmt;
use stream_file_cache::CacheError;

/// Errors that stop the server from starting
#[derive(Debug)]
pub enum ServerError {
    Cache(CacheError),
    Io(Box<std::io::Error>),
    Config(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Cache(err) => write!(f, "Cache error: {}", err),
            ServerError::Io(err) => write!(f, "IO error: {}", err),
            ServerError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Cache(err) => Some(err),
            ServerError::Io(err) => Some(err.as_ref()),
            ServerError::Config(_) => None,
        }
    }
}

impl From<CacheError> for ServerError {
    fn from(err: CacheError) -> Self {
        ServerError::Cache(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Io(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for ServerError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ServerError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Request error that converts to an HTTP response
#[derive(Debug)]
pub enum ApiError {
    Cache(CacheError),
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Cache(CacheError::NotFound) => {
                (StatusCode::NOT_FOUND, "Entry not found".into())
            }
            ApiError::Cache(err @ CacheError::RangeNotSatisfiable { size, .. }) => {
                return (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(
                        header::CONTENT_RANGE,
                        byte_range_parser::unsatisfied_content_range(size),
                    )],
                    axum::Json(json!({ "error": err.to_string() })),
                )
                    .into_response();
            }
            ApiError::Cache(CacheError::PopulationFailed(msg)) => {
                tracing::error!(error = %msg, "Population failed");
                (StatusCode::BAD_GATEWAY, format!("Population failed: {}", msg))
            }
            ApiError::Cache(CacheError::StoreIo(e)) => {
                tracing::error!(error = %e, "Store IO error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".into(),
                )
            }
            ApiError::Cache(CacheError::Cancelled) => {
                tracing::warn!("Request cancelled");
                (StatusCode::INTERNAL_SERVER_ERROR, "Request cancelled".into())
            }
        };

        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}

impl From<CacheError> for ApiError {
    fn from(e: CacheError) -> Self {
        ApiError::Cache(e)
    }
}
