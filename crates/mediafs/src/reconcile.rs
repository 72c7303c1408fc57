//! Tree reconciliation against the remote library.
//!
//! A pass fetches the full snapshot of one subtree, creates or updates the
//! nodes it describes, and prunes everything else. A failed fetch clears the
//! subtree: an unreachable backend shows up as an empty listing, never as a
//! stale one. Passes run at startup, on a timer and on explicit triggers.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use mediafs_library::{Asset, AssetKind, LibraryClient, LibraryError, Movie, Show};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MountConfig;
use crate::tree::{Node, NodeTree};

/// Out-of-band request to refresh one subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Movies,
    Shows,
}

/// Errors that abort a reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("snapshot fetch failed: {0}")]
    Fetch(#[from] LibraryError),

    #[error("snapshot fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Outcome of one successful pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Files placed or refreshed.
    pub files: usize,
    /// Assets left out (bad name or unresolvable URL).
    pub skipped: usize,
    /// Entries removed because the snapshot no longer lists them.
    pub pruned: usize,
}

/// Returns a usable entry name, or `None` if `raw` cannot name an entry.
///
/// Path separators and NUL bytes are replaced; empty names and the `.` /
/// `..` names are rejected.
pub fn sanitize_name(raw: &str) -> Option<String> {
    let name: String = raw
        .trim()
        .chars()
        .map(|c| if c == '/' || c == '\0' { '_' } else { c })
        .collect();
    match name.as_str() {
        "" | "." | ".." => None,
        _ => Some(name),
    }
}

/// Builds and refreshes the movie and show subtrees.
pub struct Reconciler<C> {
    client: Arc<C>,
    tree: Arc<NodeTree>,
    fetch_timeout: Duration,
    period: Duration,
}

impl<C: LibraryClient> Reconciler<C> {
    pub fn new(client: Arc<C>, tree: Arc<NodeTree>, config: &MountConfig) -> Self {
        Self {
            client,
            tree,
            fetch_timeout: config.stream.setup_timeout,
            period: config.refresh_period,
        }
    }

    pub fn tree(&self) -> &Arc<NodeTree> {
        &self.tree
    }

    /// Reconciles the movie subtree against a fresh snapshot.
    pub async fn refresh_movies(&self) -> Result<PassReport, ReconcileError> {
        let subtree = Arc::clone(self.tree.movies());
        let movies = match self.fetch(self.client.list_movies()).await {
            Ok(movies) => movies,
            Err(e) => return Err(self.fail(&subtree, e)),
        };

        subtree.mark_all_invalid();
        let mut report = PassReport::default();
        for movie in &movies {
            self.place_movie(&subtree, movie, &mut report);
        }
        report.pruned = self.tree.prune(&subtree);

        info!(
            subtree = subtree.name(),
            movies = movies.len(),
            files = report.files,
            skipped = report.skipped,
            pruned = report.pruned,
            "reconciled"
        );
        Ok(report)
    }

    /// Reconciles the show subtree against a fresh snapshot.
    pub async fn refresh_shows(&self) -> Result<PassReport, ReconcileError> {
        let subtree = Arc::clone(self.tree.shows());
        let shows = match self.fetch(self.client.list_shows()).await {
            Ok(shows) => shows,
            Err(e) => return Err(self.fail(&subtree, e)),
        };

        subtree.mark_all_invalid();
        let mut report = PassReport::default();
        for show in &shows {
            self.place_show(&subtree, show, &mut report);
        }
        report.pruned = self.tree.prune(&subtree);

        info!(
            subtree = subtree.name(),
            shows = shows.len(),
            files = report.files,
            skipped = report.skipped,
            pruned = report.pruned,
            "reconciled"
        );
        Ok(report)
    }

    /// Reconciles both subtrees concurrently. Failures are already logged.
    pub async fn refresh_all(&self) {
        let (movies, shows) = tokio::join!(self.refresh_movies(), self.refresh_shows());
        if movies.is_err() || shows.is_err() {
            debug!("reconciliation finished with a degraded subtree");
        }
    }

    /// Runs timer- and trigger-driven passes until `shutdown` fires.
    ///
    /// A trigger refreshes its subtree immediately and restarts the timer.
    /// In-flight fetches are abandoned on shutdown.
    pub async fn run(&self, triggers: mpsc::Receiver<Trigger>, shutdown: CancellationToken) {
        let mut triggers = Some(triggers);
        let mut next = Instant::now() + self.period;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep_until(next) => {
                    debug!("periodic reconciliation");
                    if guarded(&shutdown, self.refresh_all()).await.is_none() {
                        break;
                    }
                }
                trigger = next_trigger(&mut triggers) => {
                    debug!(?trigger, "triggered reconciliation");
                    let finished = match trigger {
                        Trigger::Movies => guarded(&shutdown, self.refresh_movies()).await.is_some(),
                        Trigger::Shows => guarded(&shutdown, self.refresh_shows()).await.is_some(),
                    };
                    if !finished {
                        break;
                    }
                }
            }
            next = Instant::now() + self.period;
        }
        info!("reconciler stopped");
    }

    async fn fetch<T>(
        &self,
        request: impl Future<Output = Result<T, LibraryError>>,
    ) -> Result<T, ReconcileError> {
        match tokio::time::timeout(self.fetch_timeout, request).await {
            Ok(result) => Ok(result?),
            Err(_elapsed) => Err(ReconcileError::Timeout(self.fetch_timeout)),
        }
    }

    /// Empties `subtree` after a failed fetch.
    fn fail(&self, subtree: &Arc<Node>, error: ReconcileError) -> ReconcileError {
        let removed = self.tree.clear(subtree);
        warn!(subtree = subtree.name(), removed, error = %error, "snapshot unavailable, subtree cleared");
        error
    }

    fn place_movie(&self, subtree: &Arc<Node>, movie: &Movie, report: &mut PassReport) {
        let Some(name) = sanitize_name(&movie.display_name()) else {
            warn!(id = %movie.id, title = %movie.title, "movie has no usable name, skipping");
            report.skipped += movie.assets.len();
            return;
        };
        let dir = self.tree.ensure_dir(subtree, &name, self.newest(&movie.assets));
        self.place_assets(&dir, &movie.assets, report);
    }

    fn place_show(&self, subtree: &Arc<Node>, show: &Show, report: &mut PassReport) {
        let Some(name) = sanitize_name(&show.display_name()) else {
            warn!(id = %show.id, title = %show.title, "show has no usable name, skipping");
            report.skipped += show.assets.len()
                + show
                    .seasons
                    .iter()
                    .flat_map(|s| &s.episodes)
                    .map(|e| e.assets.len())
                    .sum::<usize>();
            return;
        };
        let show_dir = self.tree.ensure_dir(subtree, &name, self.newest(&show.assets));
        self.place_assets(&show_dir, &show.assets, report);

        for season in &show.seasons {
            let episode_assets: Vec<&Asset> =
                season.episodes.iter().flat_map(|e| e.assets.iter()).collect();
            let mtime = self.newest(episode_assets.iter().copied());
            let season_dir = self.tree.ensure_dir(&show_dir, &season.display_name(), mtime);
            for episode in &season.episodes {
                self.place_assets(&season_dir, &episode.assets, report);
            }
        }
    }

    /// Places each asset as a file under `dir`. Videos, subtitles, cover
    /// art and metadata all go through the same routine.
    fn place_assets<'a>(
        &self,
        dir: &Arc<Node>,
        assets: impl IntoIterator<Item = &'a Asset>,
        report: &mut PassReport,
    ) {
        for asset in assets {
            if self.place_asset(dir, asset).is_some() {
                report.files += 1;
            } else {
                report.skipped += 1;
            }
        }
    }

    fn place_asset(&self, dir: &Arc<Node>, asset: &Asset) -> Option<Arc<Node>> {
        let Some(name) = sanitize_name(&asset.name) else {
            warn!(id = %asset.id, kind = kind_label(asset.kind), "asset has no usable name, skipping");
            return None;
        };
        let url = match self.client.resolve_download_url(asset) {
            Ok(url) => url,
            Err(e) => {
                warn!(name, kind = kind_label(asset.kind), error = %e, "cannot resolve download URL");
                return None;
            }
        };
        let mtime = asset.modified_time().unwrap_or_else(|| self.tree.epoch());
        Some(self.tree.upsert_file(dir, &name, asset.size, mtime, url))
    }

    /// Newest asset timestamp, or the tree's shared timestamp.
    fn newest<'a>(&self, assets: impl IntoIterator<Item = &'a Asset>) -> SystemTime {
        assets
            .into_iter()
            .filter_map(Asset::modified_time)
            .max()
            .unwrap_or_else(|| self.tree.epoch())
    }
}

/// Runs `pass` unless `shutdown` fires first.
async fn guarded<T>(shutdown: &CancellationToken, pass: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        () = shutdown.cancelled() => None,
        out = pass => Some(out),
    }
}

async fn next_trigger(triggers: &mut Option<mpsc::Receiver<Trigger>>) -> Trigger {
    if let Some(rx) = triggers {
        if let Some(trigger) = rx.recv().await {
            return trigger;
        }
        debug!("trigger channel closed, timer only");
        *triggers = None;
    }
    std::future::pending().await
}

fn kind_label(kind: AssetKind) -> &'static str {
    match kind {
        AssetKind::Video => "video",
        AssetKind::Subtitle => "subtitle",
        AssetKind::Cover => "cover",
        AssetKind::Metadata => "metadata",
    }
}
