//! Read-only FUSE filesystem streaming a remote media library.
//!
//! Movies and shows reachable only through the library's HTTP API are
//! exposed as a local directory tree, so unmodified players can stream them
//! without downloading first.
//!
//! # Components
//!
//! - [`tree`]: in-memory node tree with per-node locking and a sharded inode index
//! - [`reconcile`]: rebuilds the tree from remote snapshots on startup, on a
//!   timer and on triggers
//! - [`reader`]: bounded prefetching reader over one remote byte stream
//! - [`handle`]: per-open file state that reconnects on seeks
//! - [`filesystem`]: the fuser adapter mapping kernel calls onto the above
//! - [`signals`]: `SIGUSR1`/`SIGUSR2` refresh triggers
//!
//! # Usage
//!
//! ```ignore
//! use mediafs::{MediaFs, MountConfig, NodeTree, Reconciler, mount};
//!
//! let tree = Arc::new(NodeTree::new(&config));
//! Reconciler::new(client, Arc::clone(&tree), &config).refresh_all().await;
//! let fs = MediaFs::new(tree, origin, config, runtime.handle().clone(), shutdown);
//! let session = mount::mount(fs, mountpoint, &mount::mount_options(false))?;
//! ```

pub mod async_bridge;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod handle;
pub mod handles;
pub mod mount;
pub mod origin;
pub mod reader;
pub mod reconcile;
pub mod signals;
pub mod tree;

pub use async_bridge::{BridgeError, BridgeSnapshot, BridgeStats};
pub use config::{MountConfig, StreamConfig};
pub use error::{FsError, FsResult, StreamError};
pub use filesystem::{DirEntry, MediaFs};
pub use handle::FileHandle;
pub use handles::HandleTable;
pub use mount::{MountError, MountSession};
pub use origin::{HttpOrigin, Origin, OriginBody, OriginError};
pub use reader::AsyncReader;
pub use reconcile::{PassReport, ReconcileError, Reconciler, Trigger, sanitize_name};
pub use signals::RefreshSignals;
pub use tree::{EntryNotifier, Node, NodeKind, NodeTree, ROOT_INODE};
