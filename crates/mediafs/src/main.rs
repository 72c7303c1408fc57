//! mediafs - Mount a remote media library as a read-only filesystem.
//!
//! Usage: mediafs --endpoint <url> --token <token> <mountpoint>
//!
//! `SIGUSR1` refreshes the movie listing and `SIGUSR2` the show listing
//! without waiting for the timer. `SIGINT`, `SIGTERM` and `SIGHUP` unmount.
//!
//! ## Debugging with tokio-console
//!
//! Build with the `tokio-console` feature for async task introspection:
//! ```bash
//! cargo build -p mediafs --features tokio-console
//! ```
//!
//! Then run `tokio-console` in another terminal to connect (default: 127.0.0.1:6669).

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::sync::{Arc, mpsc};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mediafs::config::{DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_SIZE};
use mediafs::mount::{self, mount_options};
use mediafs::{HttpOrigin, MediaFs, MountConfig, NodeTree, Reconciler, RefreshSignals};
use mediafs_library::{DEFAULT_TOKEN_HEADER, HttpLibraryClient};
use tokio::sync::mpsc as async_mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

/// How long to wait for background tasks once the mount is gone.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "mediafs")]
#[command(about = "Mount a remote media library as a read-only filesystem")]
#[command(version)]
struct Cli {
    /// Mountpoint for the filesystem
    mountpoint: PathBuf,

    /// Base URL of the media library API
    #[arg(long, env = "MEDIAFS_ENDPOINT")]
    endpoint: Url,

    /// Auth token sent with every request
    #[arg(long, env = "MEDIAFS_TOKEN", hide_env_values = true)]
    token: String,

    /// Header carrying the auth token
    #[arg(long, default_value = DEFAULT_TOKEN_HEADER)]
    token_header: String,

    /// Name of the movie directory under the mount root
    #[arg(long, default_value = "movies")]
    movies_dir: String,

    /// Name of the show directory under the mount root
    #[arg(long, default_value = "shows")]
    shows_dir: String,

    /// Seconds between listing refreshes (also the attribute cache TTL)
    #[arg(long, default_value_t = 60)]
    refresh: u64,

    /// Seconds allowed to establish a remote connection or fetch a listing
    #[arg(long, default_value_t = 30)]
    setup_timeout: u64,

    /// Seconds allowed for a single read to be satisfied
    #[arg(long, default_value_t = 30)]
    read_timeout: u64,

    /// Upper bound of each open file's prefetch buffer, in bytes
    #[arg(long, default_value_t = DEFAULT_CACHE_SIZE)]
    cache_size: usize,

    /// Bytes pulled from the origin per step
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Owner uid reported for every entry (default: current user)
    #[arg(long)]
    uid: Option<u32>,

    /// Owner gid reported for every entry (default: current group)
    #[arg(long)]
    gid: Option<u32>,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    fn mount_config(&self) -> MountConfig {
        let defaults = MountConfig::default();
        MountConfig::default()
            .subtrees(&self.movies_dir, &self.shows_dir)
            .refresh_period(Duration::from_secs(self.refresh.max(1)))
            .setup_timeout(Duration::from_secs(self.setup_timeout))
            .read_timeout(Duration::from_secs(self.read_timeout))
            .block_size(self.block_size)
            .cache_size(self.cache_size)
            .ownership(self.uid.unwrap_or(defaults.uid), self.gid.unwrap_or(defaults.gid))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;
    let guard = runtime.enter();

    init_tracing(cli.debug);

    // Installed before the initial fetch so an early refresh signal is not fatal
    let refresh_signals = RefreshSignals::install().context("Failed to install refresh signal handlers")?;

    if cli.token.trim().is_empty() {
        anyhow::bail!("An auth token is required (--token or MEDIAFS_TOKEN)");
    }
    if !cli.mountpoint.is_dir() {
        anyhow::bail!("Mountpoint does not exist: {}", cli.mountpoint.display());
    }

    let config = cli.mount_config();
    let setup_timeout = config.stream.setup_timeout;

    let client = HttpLibraryClient::new(cli.endpoint.clone(), &cli.token_header, &cli.token, setup_timeout)
        .context("Failed to create library client")?;
    let origin = HttpOrigin::new(&cli.token_header, &cli.token, setup_timeout)
        .context("Failed to create origin client")?;

    let tree = Arc::new(NodeTree::new(&config));
    let shutdown = CancellationToken::new();
    let reconciler = Arc::new(Reconciler::new(Arc::new(client), Arc::clone(&tree), &config));

    info!(endpoint = %cli.endpoint, "Fetching initial library listing");
    runtime.block_on(reconciler.refresh_all());

    let fs = MediaFs::new(
        tree,
        Arc::new(origin),
        config,
        runtime.handle().clone(),
        shutdown.clone(),
    );

    // Set up channel for signal handling
    let (tx, rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to set signal handler")?;

    info!("Mounting filesystem (press Ctrl+C to unmount)");
    let session = mount::mount(fs, &cli.mountpoint, &mount_options(cli.allow_other))
        .context("Failed to mount filesystem")?;

    let (trigger_tx, trigger_rx) = async_mpsc::channel(4);
    runtime.spawn(refresh_signals.forward(trigger_tx, shutdown.clone()));
    let reconcile_task = {
        let reconciler = Arc::clone(&reconciler);
        let shutdown = shutdown.clone();
        runtime.spawn(async move { reconciler.run(trigger_rx, shutdown).await })
    };

    match rx.recv() {
        Ok(()) => info!("Received termination signal, unmounting..."),
        Err(_) => warn!("Signal channel closed unexpectedly"),
    }

    // Abort in-flight transfers first so open handles stop holding the mount
    shutdown.cancel();
    session.unmount();

    if let Err(e) = runtime.block_on(reconcile_task) {
        warn!(error = %e, "Reconciler task did not exit cleanly");
    }
    drop(guard);
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    info!("Filesystem unmounted");
    Ok(())
}

fn init_tracing(debug: bool) {
    let filter = if debug { "debug" } else { "info" };
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter))
    };

    #[cfg(feature = "tokio-console")]
    {
        use std::net::SocketAddr;
        use tracing_subscriber::Layer;

        let console_port: u16 = std::env::var("TOKIO_CONSOLE_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(6669);
        let console_addr: SocketAddr = ([127, 0, 0, 1], console_port).into();

        if std::net::TcpListener::bind(console_addr).is_ok() {
            let console_layer = console_subscriber::ConsoleLayer::builder()
                .server_addr(console_addr)
                .spawn();
            tracing_subscriber::registry()
                .with(console_layer)
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter()))
                .init();
            info!("tokio-console enabled, connect with: tokio-console http://127.0.0.1:{console_port}");
        } else {
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter()))
                .init();
            warn!(
                "tokio-console port {console_port} already in use, running without console instrumentation. \
                 Set TOKIO_CONSOLE_PORT to use a different port."
            );
        }
    }

    #[cfg(not(feature = "tokio-console"))]
    {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(env_filter())
            .init();
    }
}
