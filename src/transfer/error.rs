//! Error types for the transfer module.
//!
//! [`TransportError`] covers a single request that never produced a usable
//! response. [`TransferError`] is the taxonomy of session aborts; every variant
//! leaves the output file and the checkpoint sidecar exactly as they were after
//! the last committed chunk, so the export can be resumed.

use thiserror::Error;

use super::checkpoint::CheckpointError;
use super::retry::FatalKind;

/// Failure of a single request below the level of HTTP status codes.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before the response body was complete.
    #[error("timeout requesting {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The response body could not be read or decompressed.
    #[error("failed to read response body from {url}: {source}")]
    Body {
        /// The URL whose body failed to decode.
        url: String,
        /// The underlying decode error.
        #[source]
        source: reqwest::Error,
    },

    /// The request URL could not be built.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// A request that only accepts `200 OK` received another status.
    #[error("HTTP {status} requesting {url}")]
    UnexpectedStatus {
        /// The URL that was requested.
        url: String,
        /// The HTTP status code.
        status: u16,
    },
}

impl TransportError {
    /// Creates a network error, promoting reqwest timeouts to [`TransportError::Timeout`].
    pub fn from_reqwest(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    /// Creates a body decode error.
    pub fn body(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Body {
            url: url.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an unexpected status error.
    pub fn unexpected_status(url: impl Into<String>, status: u16) -> Self {
        Self::UnexpectedStatus {
            url: url.into(),
            status,
        }
    }
}

/// Reasons a transfer session stops before completion.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The server rejected the request with a non-recoverable 4xx status.
    #[error("{kind} (HTTP {status})")]
    ClientFatal {
        /// Which class of client error occurred.
        kind: FatalKind,
        /// The HTTP status code.
        status: u16,
    },

    /// Every retry attempt failed at the transport level.
    #[error(
        "abandoned after {attempts} attempts, last error: {source}\n  Suggestion: check your connection to the internet and resume the download"
    )]
    TransportFatal {
        /// Number of attempts made.
        attempts: u32,
        /// The error from the final attempt.
        #[source]
        source: TransportError,
    },

    /// A chunk body did not contain the rows its address promised.
    #[error("malformed chunk {chunk_index}: {reason}")]
    MalformedChunk {
        /// Index of the offending chunk.
        chunk_index: u64,
        /// What was wrong with the body.
        reason: String,
    },

    /// The total-count probe returned a body that is not the expected envelope.
    #[error("malformed total-count response: {0}")]
    MalformedProbe(#[source] serde_json::Error),

    /// Writing to or flushing the output failed.
    #[error("failed to write output: {0}")]
    Output(#[source] std::io::Error),

    /// Persisting or removing the checkpoint sidecar failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl TransferError {
    /// Creates a malformed chunk error.
    pub fn malformed_chunk(chunk_index: u64, reason: impl Into<String>) -> Self {
        Self::MalformedChunk {
            chunk_index,
            reason: reason.into(),
        }
    }
}
