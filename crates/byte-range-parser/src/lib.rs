//! Parser for HTTP byte range headers
//!
//! Parses `Range` values of the form `bytes=first-last`, `bytes=first-` and
//! `bytes=-suffix` and resolves them against a known object size.
//! Multi-range lists are not supported and parse as `None`.

use regex::Regex;
use std::sync::LazyLock;

/// A single byte range as requested by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=first-last`, `last` inclusive
    Bounded { first: u64, last: u64 },
    /// `bytes=first-`
    From(u64),
    /// `bytes=-n`, the final `n` bytes
    Suffix(u64),
}

/// A range resolved against a concrete size, `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub end: u64,
}

static RANGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*bytes\s*=\s*(\d*)\s*-\s*(\d*)\s*$").unwrap());

impl RangeSpec {
    /// Parse a `Range` header value like "bytes=0-99"
    pub fn parse(header: &str) -> Option<Self> {
        let caps = RANGE_RE.captures(header)?;
        let first = &caps[1];
        let last = &caps[2];

        match (first.is_empty(), last.is_empty()) {
            (true, true) => None,
            (true, false) => Some(Self::Suffix(last.parse().ok()?)),
            (false, true) => Some(Self::From(first.parse().ok()?)),
            (false, false) => {
                let first: u64 = first.parse().ok()?;
                let last: u64 = last.parse().ok()?;
                if last < first {
                    return None;
                }
                Some(Self::Bounded { first, last })
            }
        }
    }

    /// Start offset and exclusive end, when they do not depend on the size.
    ///
    /// Suffix ranges need the final size and return `None`.
    pub fn offsets(&self) -> Option<(u64, Option<u64>)> {
        match *self {
            Self::Bounded { first, last } => Some((first, Some(last.saturating_add(1)))),
            Self::From(first) => Some((first, None)),
            Self::Suffix(_) => None,
        }
    }

    /// Resolve against the object size, `None` when unsatisfiable
    pub fn resolve(&self, size: u64) -> Option<ResolvedRange> {
        match *self {
            Self::Bounded { first, last } if first < size => Some(ResolvedRange {
                start: first,
                end: last.saturating_add(1).min(size),
            }),
            Self::From(first) if first < size => Some(ResolvedRange {
                start: first,
                end: size,
            }),
            Self::Suffix(n) if n > 0 && size > 0 => Some(ResolvedRange {
                start: size.saturating_sub(n),
                end: size,
            }),
            _ => None,
        }
    }
}

impl ResolvedRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Value for the `Content-Range` response header
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end.saturating_sub(1), size)
    }

    /// `Content-Range` value while the complete length is not yet known
    pub fn content_range_unknown_size(&self) -> String {
        format!("bytes {}-{}/*", self.start, self.end.saturating_sub(1))
    }
}

/// `Content-Range` value for a 416 response
pub fn unsatisfied_content_range(size: u64) -> String {
    format!("bytes */{}", size)
}
