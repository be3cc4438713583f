//! Error types for epss-enrich.
//!
//! Library crates use [`EnrichError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all enrichment operations.
#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    /// The findings listing (or an update response) does not have the expected shape.
    #[error("malformed response: {message}")]
    MalformedResponse { message: String },

    /// A finding has no usable CVE-like identifier at either expected list position.
    #[error("finding at position {position} has no usable vulnerability identifier")]
    MissingIdentifier {
        position: usize,
        remote_id: Option<i64>,
    },

    /// The score feed is not well-formed.
    #[error("malformed feed: {message}")]
    MalformedFeed { message: String },

    /// The tracking service refused one update.
    #[error("update of finding {id} rejected with HTTP {status}")]
    UpdateRejected { id: i64, status: u16 },

    /// Transport-level failure talking to the tracker or the feed host.
    #[error("network error: {0}")]
    Network(String),

    /// Gzip decompression of the feed failed.
    #[error("decompression error: {0}")]
    Decompress(String),

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, EnrichError>;

impl EnrichError {
    /// Create a malformed-response error from any displayable message.
    pub fn response(msg: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: msg.into(),
        }
    }

    /// Create a malformed-feed error from any displayable message.
    pub fn feed(msg: impl Into<String>) -> Self {
        Self::MalformedFeed {
            message: msg.into(),
        }
    }

    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = EnrichError::feed("line 4: expected 3 fields, found 2");
        assert_eq!(
            err.to_string(),
            "malformed feed: line 4: expected 3 fields, found 2"
        );

        let err = EnrichError::UpdateRejected { id: 42, status: 403 };
        assert_eq!(err.to_string(), "update of finding 42 rejected with HTTP 403");
    }

    #[test]
    fn missing_identifier_names_position() {
        let err = EnrichError::MissingIdentifier {
            position: 7,
            remote_id: Some(12),
        };
        assert!(err.to_string().contains("position 7"));
    }
}
