//! Per-open file state.
//!
//! A [`FileHandle`] binds one file node to at most one live [`AsyncReader`].
//! Reads continuing where the previous one stopped are served by the same
//! reader; any other offset tears it down and opens a fresh ranged request.
//!
//! State machine: `Unopened -> Streaming(offset) -> Closed`. Opening a handle
//! performs no network I/O.

use std::cmp::min;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use crate::config::StreamConfig;
use crate::error::{FsError, StreamError};
use crate::origin::Origin;
use crate::reader::AsyncReader;
use crate::tree::Node;

/// Streaming context for one `open()` of a file.
pub struct FileHandle {
    name: String,
    url: Url,
    size: u64,
    /// Offset following the last byte delivered by the live reader.
    offset: u64,
    reader: Option<AsyncReader>,
    cancel: CancellationToken,
    origin: Arc<dyn Origin>,
    config: StreamConfig,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("offset", &self.offset)
            .field("streaming", &self.reader.is_some())
            .finish_non_exhaustive()
    }
}

impl FileHandle {
    /// Binds a handle to the node's current URL and size.
    ///
    /// The handle's cancellation scope is a child of `parent`, so cancelling
    /// the process-wide token aborts it too.
    pub fn open(
        node: &Node,
        origin: Arc<dyn Origin>,
        config: StreamConfig,
        parent: &CancellationToken,
    ) -> Result<Self, FsError> {
        let Some(url) = node.url() else {
            return Err(FsError::IsADirectory(node.ino()));
        };
        Ok(Self::new(node.name(), url, node.size(), origin, config, parent.child_token()))
    }

    /// Creates a handle for an arbitrary remote resource.
    pub fn new(
        name: impl Into<String>,
        url: Url,
        size: u64,
        origin: Arc<dyn Origin>,
        config: StreamConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            url,
            size,
            offset: 0,
            reader: None,
            cancel,
            origin,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset the live reader will serve next, if one is open.
    pub fn stream_offset(&self) -> Option<u64> {
        self.reader.as_ref().map(|_| self.offset)
    }

    pub fn is_streaming(&self) -> bool {
        self.reader.is_some()
    }

    /// Token cancelled when the handle is released.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Reads up to `size` bytes at `offset`.
    ///
    /// Returns fewer bytes only at the end of the file. A failed read tears
    /// the reader down so the next call reconnects.
    pub async fn read(&mut self, offset: u64, size: usize) -> Result<Vec<u8>, StreamError> {
        if self.cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        if offset >= self.size || size == 0 {
            return Ok(Vec::new());
        }

        if self.reader.is_none() || self.offset != offset {
            if let Some(from) = self.stream_offset() {
                debug!(name = %self.name, from, to = offset, "non-contiguous read, reopening");
            }
            self.teardown().await;
            let reader = self.connect(offset).await?;
            self.reader = Some(reader);
            self.offset = offset;
        }

        let len = usize::try_from(self.size - offset).map_or(size, |left| min(size, left));
        let mut buf = vec![0u8; len];
        let result = self.fill(&mut buf).await;

        match result {
            Ok(filled) => {
                buf.truncate(filled);
                self.offset = offset + filled as u64;
                Ok(buf)
            }
            Err(e) => {
                if e.is_timeout() {
                    warn!(name = %self.name, offset, error = %e, "read deadline exceeded");
                } else {
                    warn!(name = %self.name, offset, error = %e, "read failed");
                }
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Releases the remote connection. A later read reconnects.
    pub async fn flush(&mut self) {
        self.teardown().await;
    }

    /// Cancels everything the handle started and releases its connection.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.teardown().await;
    }

    /// Fills `buf` from the live reader under one read deadline.
    async fn fill(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let Some(reader) = self.reader.as_ref() else {
            return Err(StreamError::Cancelled);
        };
        let budget = self.config.read_timeout;
        let deadline = Instant::now() + budget;

        let mut filled = 0;
        while filled < buf.len() {
            match reader.read_until(&mut buf[filled..], deadline, budget).await? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    }

    /// Opens a ranged request at `offset` and wraps it in a reader.
    async fn connect(&self, offset: u64) -> Result<AsyncReader, StreamError> {
        let budget = self.config.setup_timeout;
        let setup = tokio::time::timeout(budget, self.origin.open(&self.url, offset));

        let body = tokio::select! {
            () = self.cancel.cancelled() => Err(StreamError::Cancelled),
            opened = setup => match opened {
                Ok(Ok(body)) => Ok(body),
                Ok(Err(e)) => Err(StreamError::from(e)),
                Err(_elapsed) => Err(StreamError::Timeout(budget)),
            },
        };

        match body {
            Ok(body) => Ok(AsyncReader::spawn(
                body,
                offset,
                self.size,
                &self.config,
                self.cancel.child_token(),
            )),
            Err(e) => {
                error!(name = %self.name, offset, error = %e, "failed to open remote stream");
                Err(e)
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.close().await;
        }
    }
}
