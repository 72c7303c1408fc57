//! Remote library client.
//!
//! The filesystem only needs three things from the library: the movie
//! snapshot, the show snapshot, and a download URL for each asset.
//! [`LibraryClient`] captures that seam; [`HttpLibraryClient`] is the
//! `reqwest`-backed implementation used by the daemon.

use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{LibraryError, LibraryResult};
use crate::models::{Asset, Movie, Show};

/// Default header carrying the auth token.
pub const DEFAULT_TOKEN_HEADER: &str = "X-Auth-Token";

/// Source of library snapshots and download URLs.
pub trait LibraryClient: Send + Sync + 'static {
    /// Fetches the full list of movies.
    fn list_movies(&self) -> impl Future<Output = LibraryResult<Vec<Movie>>> + Send;

    /// Fetches the full list of shows, with nested seasons and episodes.
    fn list_shows(&self) -> impl Future<Output = LibraryResult<Vec<Show>>> + Send;

    /// Resolves the URL that streams the given asset.
    fn resolve_download_url(&self, asset: &Asset) -> LibraryResult<Url>;
}

/// Builds the header map that authenticates requests against the library.
///
/// Shared with the origin fetcher so snapshot requests and streaming
/// requests carry the same credentials.
pub fn auth_headers(token_header: &str, token: &str) -> LibraryResult<HeaderMap> {
    let name =
        HeaderName::from_bytes(token_header.as_bytes()).map_err(|_| LibraryError::InvalidToken)?;
    let mut value = HeaderValue::from_str(token).map_err(|_| LibraryError::InvalidToken)?;
    value.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(name, value);
    Ok(headers)
}

/// HTTP implementation of [`LibraryClient`].
#[derive(Debug, Clone)]
pub struct HttpLibraryClient {
    client: reqwest::Client,
    base: Url,
}

impl HttpLibraryClient {
    /// Creates a client for the library rooted at `base`.
    ///
    /// `timeout` bounds every snapshot request end to end.
    pub fn new(
        base: Url,
        token_header: &str,
        token: &str,
        timeout: Duration,
    ) -> LibraryResult<Self> {
        let client = reqwest::Client::builder()
            .default_headers(auth_headers(token_header, token)?)
            .timeout(timeout)
            .build()
            .map_err(|source| LibraryError::Request {
                endpoint: base.to_string(),
                source,
            })?;
        Ok(Self::from_client(client, base))
    }

    /// Creates a client from an existing [`reqwest::Client`].
    pub fn from_client(client: reqwest::Client, mut base: Url) -> Self {
        // Url::join drops the last segment unless the base ends with '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self { client, base }
    }

    /// Returns the library base URL.
    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> LibraryResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| LibraryError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> LibraryResult<T> {
        let endpoint = url.to_string();
        tracing::trace!(%endpoint, "fetching library snapshot");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| LibraryError::Request {
                endpoint: endpoint.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(LibraryError::Status { endpoint, status });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| LibraryError::Request {
                endpoint: endpoint.clone(),
                source,
            })?;
        serde_json::from_slice(&body).map_err(|source| LibraryError::Decode { endpoint, source })
    }
}

impl LibraryClient for HttpLibraryClient {
    async fn list_movies(&self) -> LibraryResult<Vec<Movie>> {
        let url = self.endpoint(&["api", "movies"])?;
        self.get_json(url).await
    }

    async fn list_shows(&self) -> LibraryResult<Vec<Show>> {
        let url = self.endpoint(&["api", "shows"])?;
        self.get_json(url).await
    }

    fn resolve_download_url(&self, asset: &Asset) -> LibraryResult<Url> {
        self.endpoint(&["api", "assets", &asset.id, "download"])
    }
}
