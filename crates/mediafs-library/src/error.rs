//! Errors returned by the library client.

use thiserror::Error;

/// Errors that can occur while talking to the remote library.
#[derive(Debug, Error)]
pub enum LibraryError {
    /// The HTTP request could not be completed.
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-success status.
    #[error("{endpoint} returned HTTP {status}")]
    Status {
        endpoint: String,
        status: reqwest::StatusCode,
    },

    /// The response body was not the expected JSON document.
    #[error("invalid response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    /// A URL could not be built for the given asset or endpoint.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// The configured token cannot be sent as a header value.
    #[error("invalid auth token header")]
    InvalidToken,
}

/// Result type for library client operations.
pub type LibraryResult<T> = Result<T, LibraryError>;
