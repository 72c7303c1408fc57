//! Ranged fetches against the remote origin.
//!
//! An [`Origin`] opens a byte stream for a resolved download URL starting at
//! a given offset. [`HttpOrigin`] issues `GET` with the auth header and,
//! for non-zero offsets, `Range: bytes=<offset>-`.

use std::io;

use futures::TryStreamExt;
use futures::future::BoxFuture;
use mediafs_library::{LibraryResult, auth_headers};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RANGE};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::debug;
use url::Url;

/// A remote byte stream positioned at the requested offset.
pub type OriginBody = Box<dyn AsyncRead + Send + Unpin>;

/// Errors raised while establishing a remote stream.
#[derive(Debug, Error)]
pub enum OriginError {
    /// The HTTP request failed before a response arrived.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The origin answered with a status other than 200/206.
    #[error("origin returned HTTP {0}")]
    Status(StatusCode),

    /// A ranged request was answered with the full resource.
    #[error("origin ignored range request at offset {0}")]
    RangeIgnored(u64),

    /// Transport-level failure (used by non-HTTP origins).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl OriginError {
    /// True when no connection to the origin could be established at all.
    pub fn is_unreachable(&self) -> bool {
        match self {
            OriginError::Request(e) => e.is_connect(),
            OriginError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::HostUnreachable
                    | io::ErrorKind::NetworkUnreachable
            ),
            OriginError::Status(_) | OriginError::RangeIgnored(_) => false,
        }
    }
}

/// Opens remote byte streams.
pub trait Origin: Send + Sync {
    /// Opens `url` positioned at `offset`.
    fn open<'a>(&'a self, url: &'a Url, offset: u64) -> BoxFuture<'a, Result<OriginBody, OriginError>>;
}

/// HTTP origin backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    client: reqwest::Client,
}

impl HttpOrigin {
    /// Creates an origin that authenticates with `token` in `token_header`.
    ///
    /// Only connection establishment is bounded here; reads are bounded by
    /// the stream deadlines.
    pub fn new(token_header: &str, token: &str, connect_timeout: std::time::Duration) -> LibraryResult<Self> {
        let headers: HeaderMap = auth_headers(token_header, token)?;
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|source| mediafs_library::LibraryError::Request {
                endpoint: "origin".to_string(),
                source,
            })?;
        Ok(Self { client })
    }

    /// Creates an origin from an existing client.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Builds the request for `url` at `offset` without sending it.
    pub fn build_request(&self, url: &Url, offset: u64) -> reqwest::Result<reqwest::Request> {
        let mut builder = self.client.get(url.clone());
        if offset != 0 {
            builder = builder.header(RANGE, format!("bytes={offset}-"));
        }
        builder.build()
    }

    async fn open_stream(&self, url: &Url, offset: u64) -> Result<OriginBody, OriginError> {
        let request = self.build_request(url, offset)?;
        let response = self.client.execute(request).await?;

        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK if offset == 0 => {}
            StatusCode::OK => return Err(OriginError::RangeIgnored(offset)),
            other => return Err(OriginError::Status(other)),
        }
        debug!(%url, offset, %status, "origin stream opened");

        let stream = response.bytes_stream().map_err(io::Error::other);
        Ok(Box::new(StreamReader::new(stream)))
    }
}

impl Origin for HttpOrigin {
    fn open<'a>(&'a self, url: &'a Url, offset: u64) -> BoxFuture<'a, Result<OriginBody, OriginError>> {
        Box::pin(self.open_stream(url, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn origin() -> HttpOrigin {
        HttpOrigin::new("X-Auth-Token", "secret", Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_request_from_start_has_no_range() {
        let url = Url::parse("http://origin.local/api/assets/1/download").unwrap();
        let request = origin().build_request(&url, 0).unwrap();
        assert!(request.headers().get(RANGE).is_none());
        assert_eq!(request.url(), &url);
    }

    #[test]
    fn test_request_with_offset_has_open_range() {
        let url = Url::parse("http://origin.local/file").unwrap();
        let request = origin().build_request(&url, 4096).unwrap();
        assert_eq!(request.headers().get(RANGE).unwrap(), "bytes=4096-");
    }

    #[test]
    fn test_unreachable_classification() {
        let refused = OriginError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(refused.is_unreachable());
        assert!(!OriginError::Status(StatusCode::NOT_FOUND).is_unreachable());
        assert!(!OriginError::RangeIgnored(10).is_unreachable());
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        let url = Url::parse("http://127.0.0.1:9/file").unwrap();
        let Err(err) = origin().open(&url, 0).await else {
            panic!("expected connection failure");
        };
        assert!(err.is_unreachable(), "unexpected error: {err}");
    }
}
