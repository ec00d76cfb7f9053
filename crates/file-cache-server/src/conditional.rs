//! Conditional request handling (If-None-Match / If-Modified-Since)

use axum::http::{header, HeaderMap};
use chrono::{DateTime, Utc};
use stream_file_cache::EntryInfo;

/// Format a timestamp as an HTTP date
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Whether the client's cached copy of `info` is still current.
///
/// `If-None-Match` takes precedence; `If-Modified-Since` is only consulted
/// when it is absent.
pub fn is_not_modified(headers: &HeaderMap, info: &EntryInfo) -> bool {
    if let Some(value) = headers.get(header::IF_NONE_MATCH) {
        let Some(etag) = info.etag.as_deref() else {
            return false;
        };
        let Ok(value) = value.to_str() else {
            return false;
        };
        return value.split(',').map(str::trim).any(|candidate| {
            candidate == "*" || candidate.trim_start_matches("W/") == etag
        });
    }

    headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .is_some_and(|since| info.modified_at.timestamp() <= since.timestamp())
}
