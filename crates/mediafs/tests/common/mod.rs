//! In-memory fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use mediafs::{EntryNotifier, Node, NodeTree, Origin, OriginBody, OriginError};
use mediafs_library::{
    Asset, AssetKind, Episode, LibraryClient, LibraryError, LibraryResult, Movie, Season, Show,
};
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use url::Url;

// ---------------------------------------------------------------------------
// Library
// ---------------------------------------------------------------------------

/// Library whose snapshots are set by the test. `None` simulates an outage.
#[derive(Default)]
pub struct FakeLibrary {
    movies: Mutex<Option<Vec<Movie>>>,
    shows: Mutex<Option<Vec<Show>>>,
    unresolvable: Mutex<HashSet<String>>,
}

impl FakeLibrary {
    pub fn new(movies: Vec<Movie>, shows: Vec<Show>) -> Self {
        Self {
            movies: Mutex::new(Some(movies)),
            shows: Mutex::new(Some(shows)),
            unresolvable: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_movies(&self, movies: Vec<Movie>) {
        *self.movies.lock() = Some(movies);
    }

    pub fn set_shows(&self, shows: Vec<Show>) {
        *self.shows.lock() = Some(shows);
    }

    pub fn fail_movies(&self) {
        *self.movies.lock() = None;
    }

    pub fn fail_shows(&self) {
        *self.shows.lock() = None;
    }

    /// Makes URL resolution fail for the asset with `id`.
    pub fn break_asset(&self, id: &str) {
        self.unresolvable.lock().insert(id.to_string());
    }
}

fn outage(endpoint: &str) -> LibraryError {
    LibraryError::Status {
        endpoint: endpoint.to_string(),
        status: StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl LibraryClient for FakeLibrary {
    fn list_movies(&self) -> impl Future<Output = LibraryResult<Vec<Movie>>> + Send {
        let snapshot = self.movies.lock().clone();
        async move { snapshot.ok_or_else(|| outage("api/movies")) }
    }

    fn list_shows(&self) -> impl Future<Output = LibraryResult<Vec<Show>>> + Send {
        let snapshot = self.shows.lock().clone();
        async move { snapshot.ok_or_else(|| outage("api/shows")) }
    }

    fn resolve_download_url(&self, asset: &Asset) -> LibraryResult<Url> {
        if self.unresolvable.lock().contains(&asset.id) {
            return Err(outage("api/assets"));
        }
        Ok(asset_url(&asset.id))
    }
}

pub fn asset_url(id: &str) -> Url {
    Url::parse(&format!("http://origin.test/api/assets/{id}/download")).unwrap()
}

pub fn asset(kind: AssetKind, id: &str, name: &str, size: u64) -> Asset {
    Asset {
        kind,
        id: id.to_string(),
        name: name.to_string(),
        size,
        modified: Some(1_700_000_000),
    }
}

pub fn movie(id: &str, title: &str, year: u16, assets: Vec<Asset>) -> Movie {
    Movie {
        id: id.to_string(),
        title: title.to_string(),
        year: Some(year),
        assets,
    }
}

pub fn show(id: &str, title: &str, assets: Vec<Asset>, seasons: Vec<Season>) -> Show {
    Show {
        id: id.to_string(),
        title: title.to_string(),
        year: None,
        assets,
        seasons,
    }
}

pub fn season(number: u32, episodes: Vec<Episode>) -> Season {
    Season { number, episodes }
}

pub fn episode(number: u32, assets: Vec<Asset>) -> Episode {
    Episode {
        number,
        title: None,
        assets,
    }
}

// ---------------------------------------------------------------------------
// Tree inspection
// ---------------------------------------------------------------------------

/// Every entry path under the root, e.g. `movies/Heat (1995)/Heat.mkv`.
pub fn paths(tree: &NodeTree) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect(tree.root(), "", &mut out);
    out
}

fn collect(node: &Arc<Node>, prefix: &str, out: &mut BTreeSet<String>) {
    for child in node.children() {
        let path = if prefix.is_empty() {
            child.name().to_string()
        } else {
            format!("{prefix}/{}", child.name())
        };
        collect(&child, &path, out);
        out.insert(path);
    }
}

/// Everything a reader of the tree can observe, keyed by path.
pub fn observable(tree: &NodeTree) -> Vec<(String, u64, u64, Option<Url>, std::time::SystemTime)> {
    let mut out = Vec::new();
    for path in paths(tree) {
        let node = resolve(tree, &path).unwrap();
        let attrs = node.attrs();
        out.push((path, node.ino(), attrs.size, attrs.url, attrs.mtime));
    }
    out
}

pub fn resolve(tree: &NodeTree, path: &str) -> Option<Arc<Node>> {
    let mut node = Arc::clone(tree.root());
    for part in path.split('/') {
        node = node.get_child(part)?;
    }
    Some(node)
}

pub fn child_names(node: &Node) -> Vec<String> {
    node.children().iter().map(|c| c.name().to_string()).collect()
}

// ---------------------------------------------------------------------------
// Kernel notifier
// ---------------------------------------------------------------------------

/// Records every delete notification.
#[derive(Default)]
pub struct RecordingNotifier {
    deleted: Mutex<Vec<(u64, u64, String)>>,
}

impl RecordingNotifier {
    pub fn deleted(&self) -> Vec<(u64, u64, String)> {
        self.deleted.lock().clone()
    }

    pub fn deleted_names(&self) -> Vec<String> {
        self.deleted.lock().iter().map(|(_, _, n)| n.clone()).collect()
    }
}

impl EntryNotifier for RecordingNotifier {
    fn delete(&self, parent: u64, child: u64, name: &str) -> io::Result<()> {
        self.deleted.lock().push((parent, child, name.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Origins
// ---------------------------------------------------------------------------

/// Serves `data` from memory and records the offset of every open.
pub struct FakeOrigin {
    data: Arc<Vec<u8>>,
    /// Bytes actually served, so a value below `data.len()` ends bodies early.
    served: usize,
    opens: Mutex<Vec<u64>>,
}

impl FakeOrigin {
    pub fn new(data: Vec<u8>) -> Self {
        let served = data.len();
        Self {
            data: Arc::new(data),
            served,
            opens: Mutex::new(Vec::new()),
        }
    }

    /// Origin whose bodies stop after `cut` bytes of the resource.
    pub fn truncated(data: Vec<u8>, cut: usize) -> Self {
        Self {
            served: cut.min(data.len()),
            ..Self::new(data)
        }
    }

    pub fn opens(&self) -> Vec<u64> {
        self.opens.lock().clone()
    }
}

impl Origin for FakeOrigin {
    fn open<'a>(&'a self, _url: &'a Url, offset: u64) -> BoxFuture<'a, Result<OriginBody, OriginError>> {
        self.opens.lock().push(offset);
        let start = usize::try_from(offset).unwrap().min(self.served);
        let body = self.data[start..self.served].to_vec();
        Box::pin(async move { Ok(Box::new(std::io::Cursor::new(body)) as OriginBody) })
    }
}

/// Origin that never answers.
#[derive(Default)]
pub struct StallingOrigin;

impl Origin for StallingOrigin {
    fn open<'a>(&'a self, _url: &'a Url, _offset: u64) -> BoxFuture<'a, Result<OriginBody, OriginError>> {
        Box::pin(futures::future::pending())
    }
}

/// Origin that answers but never sends a byte.
#[derive(Default)]
pub struct SilentOrigin {
    peers: Mutex<Vec<DuplexStream>>,
}

impl Origin for SilentOrigin {
    fn open<'a>(&'a self, _url: &'a Url, _offset: u64) -> BoxFuture<'a, Result<OriginBody, OriginError>> {
        let (body, peer) = tokio::io::duplex(64);
        self.peers.lock().push(peer);
        Box::pin(async move { Ok(Box::new(body) as OriginBody) })
    }
}

/// Origin whose connections are refused.
#[derive(Default)]
pub struct RefusingOrigin;

impl Origin for RefusingOrigin {
    fn open<'a>(&'a self, _url: &'a Url, _offset: u64) -> BoxFuture<'a, Result<OriginBody, OriginError>> {
        Box::pin(async {
            Err(OriginError::Io(io::Error::from(io::ErrorKind::ConnectionRefused)))
        })
    }
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

/// Body that yields `data` and then fails with a connection reset.
pub struct FailingBody {
    data: Vec<u8>,
    pos: usize,
}

impl FailingBody {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl AsyncRead for FailingBody {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.pos >= self.data.len() {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)));
        }
        let n = buf.remaining().min(self.data.len() - self.pos);
        let start = self.pos;
        buf.put_slice(&self.data[start..start + n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

/// Wraps a body and raises a flag when it is dropped.
pub struct DropFlag<R> {
    inner: R,
    dropped: Arc<AtomicBool>,
}

impl<R> DropFlag<R> {
    pub fn new(inner: R) -> (Self, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        (
            Self {
                inner,
                dropped: Arc::clone(&dropped),
            },
            dropped,
        )
    }
}

impl<R> Drop for DropFlag<R> {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DropFlag<R> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Deterministic test content.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
