//! Refresh signals.
//!
//! `SIGUSR1` refreshes the movie subtree and `SIGUSR2` the show subtree.
//! The default action of both is to terminate the process, so the handlers
//! must be installed before any slow startup work, then forwarded to the
//! reconciler once it runs.

use std::io;

use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::reconcile::Trigger;

/// Installed `SIGUSR1`/`SIGUSR2` handlers.
#[derive(Debug)]
pub struct RefreshSignals {
    movies: Signal,
    shows: Signal,
}

impl RefreshSignals {
    /// Installs both handlers. Must be called within a tokio runtime.
    ///
    /// From this point on the signals no longer terminate the process; they
    /// are queued until [`forward`](Self::forward) drains them.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            movies: signal(SignalKind::user_defined1())?,
            shows: signal(SignalKind::user_defined2())?,
        })
    }

    /// Turns received signals into triggers until `shutdown` fires.
    ///
    /// Signals arriving while the trigger queue is full are dropped.
    pub async fn forward(mut self, tx: mpsc::Sender<Trigger>, shutdown: CancellationToken) {
        loop {
            let trigger = tokio::select! {
                () = shutdown.cancelled() => return,
                Some(()) = self.movies.recv() => Trigger::Movies,
                Some(()) = self.shows.recv() => Trigger::Shows,
                else => return,
            };
            info!(?trigger, "Refresh requested");
            if let Err(e) = tx.try_send(trigger) {
                debug!(error = %e, "Refresh already pending");
            }
        }
    }
}
