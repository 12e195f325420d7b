//! Error types for sessdex-core

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the sessdex-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Cache store error (write failure, lock contention, corrupt file)
    #[error("store error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The persisted store was written by a newer build
    #[error(
        "store schema version {found} is newer than supported version {expected}; \
         upgrade sessdex or point it at a different database file"
    )]
    Schema { found: i64, expected: i64 },

    /// A root or catalog entry could not be read
    #[error("cannot enumerate {path}: {message}")]
    Enumeration { path: PathBuf, message: String },

    /// A session log could not be parsed
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Session not found
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Filesystem watcher error
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// The index service task is no longer running
    #[error("index service has stopped")]
    ServiceStopped,

    /// A blocking refresh did not finish in time
    #[error("refresh did not complete within {0:?}")]
    Timeout(std::time::Duration),
}

/// Fatal failure to turn a session log into a record.
///
/// Carried on the stored row as `parse_error`; never propagated past the
/// coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub path: PathBuf,
    pub cause: String,
}

impl ParseError {
    pub fn new(path: impl Into<PathBuf>, cause: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cause: cause.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error in {}: {}", self.path.display(), self.cause)
    }
}

impl std::error::Error for ParseError {}

impl Error {
    /// True for errors that mean the cache itself cannot be trusted.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Schema { .. })
    }
}

/// Result type alias for sessdex-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_error_message() {
        let err = Error::Schema {
            found: 9,
            expected: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("9"));
        assert!(msg.contains("3"));
        assert!(err.is_store_failure());
    }

    #[test]
    fn test_parse_error_display() {
        let err: Error = ParseError::new("/tmp/a.jsonl", "no recognizable records").into();
        assert_eq!(
            err.to_string(),
            "parse error in /tmp/a.jsonl: no recognizable records"
        );
        assert!(!err.is_store_failure());
    }
}
