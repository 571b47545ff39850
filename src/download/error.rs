//! Error types for the download module.
//!
//! Every variant carries the context (URL or path) needed to explain the
//! failure on its own. Sources are shared behind `Arc` so a single error can be
//! retained by a file, surfaced by its task and returned to the caller.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur while negotiating or transferring a download.
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS, reset mid-body).
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: Arc<reqwest::Error>,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response on a fresh request or negotiation.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// A resumed request was not answered with 206 Partial Content.
    #[error("resume of {url} rejected: expected HTTP 206, got {status}")]
    ResumeRejected {
        /// The URL being resumed.
        url: String,
        /// The status the server answered with.
        status: u16,
    },

    /// The `Content-Range` header does not match `bytes (<start>-<end>|*)/(<size>|*)`.
    #[error("invalid Content-Range {value:?}: {reason}")]
    RangeParse {
        /// The raw header value.
        value: String,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// Local file system error (open, seek, write, flush, truncate).
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The response body ended before the expected number of bytes arrived.
    #[error("stream truncated: {remaining} of {expected} expected bytes never arrived")]
    Truncated {
        /// Bytes that should have arrived.
        expected: u64,
        /// Bytes still missing when the stream ended.
        remaining: u64,
    },

    /// An unexpected fault inside a read loop, recovered at its boundary.
    #[error("transfer of {url} aborted by internal fault: {message}")]
    Fault {
        /// The URL being transferred.
        url: String,
        /// The panic payload, when it was a string.
        message: String,
    },

    /// The task type is declared but has no transfer implementation.
    #[error("task type {kind} is not supported")]
    UnsupportedTaskType {
        /// Label of the rejected task type.
        kind: &'static str,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source: Arc::new(source),
        }
    }

    /// Creates a network or timeout error, depending on what the request hit.
    pub fn from_request(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::timeout(url)
        } else {
            Self::network(url, source)
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a rejected-resume error.
    pub fn resume_rejected(url: impl Into<String>, status: u16) -> Self {
        Self::ResumeRejected {
            url: url.into(),
            status,
        }
    }

    /// Creates a Content-Range parse error.
    pub fn range_parse(value: impl Into<String>, reason: &'static str) -> Self {
        Self::RangeParse {
            value: value.into(),
            reason,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a truncation error.
    pub fn truncated(expected: u64, remaining: u64) -> Self {
        Self::Truncated {
            expected,
            remaining,
        }
    }

    /// Creates a recovered-fault error.
    pub fn fault(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fault {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Returns true if the error was raised while setting up a request
    /// (URL, connection, status code) rather than mid-transfer.
    #[must_use]
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl { .. }
                | Self::Network { .. }
                | Self::Timeout { .. }
                | Self::HttpStatus { .. }
                | Self::ResumeRejected { .. }
        )
    }
}

// No From<reqwest::Error> / From<std::io::Error>: every variant needs a URL or
// path the source error does not carry. Use the constructors above.
