//! Error types for the streaming file cache

use std::fmt;
use std::io;
use std::sync::Arc;

/// Errors surfaced by cache operations.
///
/// Cloneable so one population failure can be handed to every waiter.
#[derive(Debug, Clone)]
pub enum CacheError {
    /// Key was never populated and no population could be requested
    NotFound,
    /// Upstream or backing-store failure while the entry was being written
    PopulationFailed(String),
    /// Requested range starts past the end of the content
    RangeNotSatisfiable { start: u64, size: u64 },
    /// Read, write or delete failure in the backing store
    StoreIo(Arc<io::Error>),
    /// The caller abandoned its own wait
    Cancelled,
}

impl CacheError {
    /// Storage error during population, as seen by waiters
    pub fn population(err: impl fmt::Display) -> Self {
        CacheError::PopulationFailed(err.to_string())
    }

    /// Same error as reported to waiters of a failed population
    pub fn into_population(self) -> Self {
        if matches!(self, CacheError::PopulationFailed(_)) {
            self
        } else {
            CacheError::population(self)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound)
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::NotFound => write!(f, "Entry not found"),
            CacheError::PopulationFailed(msg) => write!(f, "Population failed: {}", msg),
            CacheError::RangeNotSatisfiable { start, size } => {
                write!(f, "Range starting at {} not satisfiable for size {}", start, size)
            }
            CacheError::StoreIo(err) => write!(f, "Store IO error: {}", err),
            CacheError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::StoreIo(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        CacheError::StoreIo(Arc::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::StoreIo(Arc::new(io::Error::new(io::ErrorKind::InvalidData, err)))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_population_failed_display() {
        let err = CacheError::population("disk full");
        assert_eq!(format!("{}", err), "Population failed: disk full");
    }

    #[test]
    fn test_into_population_does_not_nest() {
        let err = CacheError::population("boom").into_population();
        assert_eq!(err.to_string(), "Population failed: boom");

        let err = CacheError::from(io::Error::new(io::ErrorKind::Other, "disk full"));
        assert!(matches!(
            err.into_population(),
            CacheError::PopulationFailed(msg) if msg.contains("disk full")
        ));
    }

    #[test]
    fn test_range_error_display() {
        let err = CacheError::RangeNotSatisfiable { start: 10, size: 5 };
        assert!(format!("{}", err).contains("10"));
    }

    #[test]
    fn test_io_error_has_source() {
        let err = CacheError::from(io::Error::new(io::ErrorKind::Other, "device error"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(format!("{}", err).contains("device error"));
    }

    #[test]
    fn test_error_is_clone() {
        let err = CacheError::from(io::Error::new(io::ErrorKind::Other, "boom"));
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}
