//! Asynchronous prefetching reader.
//!
//! An [`AsyncReader`] wraps one origin body covering `[start, end)`. A
//! background task pulls fixed-size blocks into a bounded buffer ahead of
//! the consumer; when the buffer reaches the cache bound the task pauses
//! until a read drains it. `read` blocks until enough bytes are buffered,
//! the stream ends, or the deadline passes.
//!
//! Positions: `buffer_pos <= source_pos <= end` at all times, and the
//! buffer holds exactly the bytes `[buffer_pos, source_pos)`.

use std::cmp::min;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::origin::OriginBody;

/// Why the prefetch task stopped.
#[derive(Debug, Clone)]
enum Finish {
    /// `source_pos` reached `end`.
    Complete,
    /// The origin body failed or ended early.
    Failed(Arc<io::Error>),
    Cancelled,
}

#[derive(Debug)]
struct State {
    buffer: BytesMut,
    source_pos: u64,
    buffer_pos: u64,
    end: u64,
    finish: Option<Finish>,
    /// Largest buffer length ever observed.
    peak: usize,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    /// Signalled by the producer after new bytes land or it stops.
    data_ready: Notify,
    /// Signalled by the consumer after it drains bytes.
    space_ready: Notify,
    cache_size: usize,
}

/// Prefetching wrapper around one remote byte stream.
#[derive(Debug)]
pub struct AsyncReader {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl AsyncReader {
    /// Starts prefetching `body`, which must be positioned at `start`, up to
    /// the exclusive offset `end`.
    ///
    /// Must be called from within a tokio runtime. Cancelling `cancel` stops
    /// the background task.
    pub fn spawn(
        body: OriginBody,
        start: u64,
        end: u64,
        config: &StreamConfig,
        cancel: CancellationToken,
    ) -> Self {
        let end = end.max(start);
        let cache_size = config.cache_size.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                buffer: BytesMut::with_capacity(min(config.block_size, cache_size)),
                source_pos: start,
                buffer_pos: start,
                end,
                finish: None,
                peak: 0,
            }),
            data_ready: Notify::new(),
            space_ready: Notify::new(),
            cache_size,
        });

        let block_size = min(config.block_size.max(1), cache_size);
        let task = tokio::spawn(prefetch(Arc::clone(&shared), body, block_size, cancel.clone()));
        debug!(start, end, cache_size, block_size, "prefetch started");

        Self {
            shared,
            cancel,
            task: Some(task),
        }
    }

    /// Reads up to `dest.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` once everything up to `end` has been delivered.
    pub async fn read(&self, dest: &mut [u8], timeout: Duration) -> Result<usize, StreamError> {
        self.read_until(dest, Instant::now() + timeout, timeout).await
    }

    /// Like [`read`](Self::read) but bounded by an absolute deadline.
    ///
    /// `budget` is only used to describe the deadline in a timeout error.
    pub async fn read_until(
        &self,
        dest: &mut [u8],
        deadline: Instant,
        budget: Duration,
    ) -> Result<usize, StreamError> {
        let wanted = {
            let state = self.shared.state.lock();
            let remaining = usize::try_from(state.end - state.buffer_pos).unwrap_or(usize::MAX);
            // A request larger than the cache could never be satisfied at once
            min(min(dest.len(), remaining), self.shared.cache_size)
        };
        if wanted == 0 {
            return Ok(0);
        }

        loop {
            // Registered before checking so a notify between check and await is kept
            let notified = self.shared.data_ready.notified();
            {
                let mut state = self.shared.state.lock();
                let available = state.buffer.len();
                // Bytes that made it in before the producer stopped are still served
                let drained = matches!(state.finish, Some(Finish::Complete | Finish::Failed(_)));
                if available >= wanted || (drained && available > 0) {
                    let n = min(wanted, available);
                    dest[..n].copy_from_slice(&state.buffer[..n]);
                    state.buffer.advance(n);
                    state.buffer_pos += n as u64;
                    drop(state);
                    self.shared.space_ready.notify_one();
                    return Ok(n);
                }
                match &state.finish {
                    Some(Finish::Failed(e)) => return Err(StreamError::Origin(Arc::clone(e))),
                    Some(Finish::Cancelled) => return Err(StreamError::Cancelled),
                    Some(Finish::Complete) => return Ok(0),
                    None => {}
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(StreamError::Timeout(budget));
            }
        }
    }

    /// Bytes pulled from the origin so far (absolute offset).
    pub fn source_pos(&self) -> u64 {
        self.shared.state.lock().source_pos
    }

    /// Bytes delivered to the consumer so far (absolute offset).
    pub fn buffer_pos(&self) -> u64 {
        self.shared.state.lock().buffer_pos
    }

    /// Exclusive upper bound of the range.
    pub fn end(&self) -> u64 {
        self.shared.state.lock().end
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// Largest buffer length observed over the reader's lifetime.
    pub fn peak_buffered(&self) -> usize {
        self.shared.state.lock().peak
    }

    /// Configured buffer bound.
    pub fn cache_size(&self) -> usize {
        self.shared.cache_size
    }

    /// True once the background task has stopped for any reason.
    pub fn is_finished(&self) -> bool {
        self.shared.state.lock().finish.is_some()
    }

    /// Cancels the background task, waits for it to exit and releases the
    /// origin stream.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "prefetch task did not exit cleanly");
        }
    }
}

impl Drop for AsyncReader {
    fn drop(&mut self) {
        // Readers dropped without close() must not leave the task running
        self.cancel.cancel();
    }
}

async fn prefetch(shared: Arc<Shared>, mut body: OriginBody, block_size: usize, cancel: CancellationToken) {
    let mut block = vec![0u8; block_size];

    let finish = loop {
        let want = {
            let state = shared.state.lock();
            if state.source_pos >= state.end {
                break Finish::Complete;
            }
            let remaining = usize::try_from(state.end - state.source_pos).unwrap_or(usize::MAX);
            let room = shared.cache_size.saturating_sub(state.buffer.len());
            min(min(block_size, remaining), room)
        };

        if want == 0 {
            // Buffer full: wait for the consumer to drain it
            tokio::select! {
                () = cancel.cancelled() => break Finish::Cancelled,
                () = shared.space_ready.notified() => continue,
            }
        }

        let read = tokio::select! {
            () = cancel.cancelled() => break Finish::Cancelled,
            read = body.read(&mut block[..want]) => read,
        };
        let n = match read {
            Ok(0) => {
                break Finish::Failed(Arc::new(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "origin closed the stream before the declared size",
                )));
            }
            Ok(n) => n,
            Err(e) => break Finish::Failed(Arc::new(e)),
        };

        {
            let mut state = shared.state.lock();
            state.buffer.extend_from_slice(&block[..n]);
            state.source_pos += n as u64;
            state.peak = state.peak.max(state.buffer.len());
        }
        trace!(bytes = n, "prefetched block");
        shared.data_ready.notify_one();
    };

    // The origin connection is released here, once, whatever the outcome
    drop(body);

    match &finish {
        Finish::Complete => debug!("prefetch complete"),
        Finish::Failed(e) => warn!(error = %e, "prefetch stopped on origin error"),
        Finish::Cancelled => debug!("prefetch cancelled"),
    }
    shared.state.lock().finish = Some(finish);
    shared.data_ready.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn config(block_size: usize, cache_size: usize) -> StreamConfig {
        StreamConfig {
            block_size,
            cache_size,
            ..StreamConfig::default()
        }
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_reads_whole_range() {
        let data = content(10_000);
        let body: OriginBody = Box::new(Cursor::new(data.clone()));
        let reader = AsyncReader::spawn(body, 0, 10_000, &config(1024, 4096), CancellationToken::new());

        let mut out = Vec::new();
        let mut buf = vec![0u8; 3000];
        loop {
            let n = reader.read(&mut buf, Duration::from_secs(5)).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
        assert_eq!(reader.buffer_pos(), 10_000);
        assert_eq!(reader.source_pos(), 10_000);
        reader.close().await;
    }

    #[tokio::test]
    async fn test_short_body_is_an_error() {
        let body: OriginBody = Box::new(Cursor::new(content(100)));
        let reader = AsyncReader::spawn(body, 0, 200, &config(64, 1024), CancellationToken::new());

        let mut buf = vec![0u8; 200];
        let mut served = 0;
        let err = loop {
            match reader.read(&mut buf, Duration::from_secs(5)).await {
                Ok(n) => served += n,
                Err(e) => break e,
            }
        };
        assert_eq!(served, 100);
        assert!(matches!(err, StreamError::Origin(_)));
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[tokio::test]
    async fn test_cancelled_reader_reports_cancellation() {
        let (client, _server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let reader = AsyncReader::spawn(Box::new(client), 0, 100, &config(16, 64), cancel.clone());
        cancel.cancel();

        let mut buf = vec![0u8; 10];
        let err = reader.read(&mut buf, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, StreamError::Cancelled));
    }

    #[tokio::test]
    async fn test_empty_range_is_eof() {
        let body: OriginBody = Box::new(Cursor::new(Vec::new()));
        let reader = AsyncReader::spawn(body, 50, 50, &config(16, 64), CancellationToken::new());
        let mut buf = vec![0u8; 10];
        assert_eq!(reader.read(&mut buf, Duration::from_secs(1)).await.unwrap(), 0);
        reader.close().await;
    }
}
