//! FUSE filesystem implementation for the media library.
//!
//! [`MediaFs`] serves metadata straight from the [`NodeTree`] and hands
//! reads to one worker task per open file. The worker executes that
//! handle's operations in submission order, so the kernel's concurrent
//! read-ahead never looks like a seek to the [`FileHandle`].

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, Request,
};
use libc::c_int;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::async_bridge::{self, BridgeStats};
use crate::config::MountConfig;
use crate::error::{FsError, FsResult};
use crate::handle::FileHandle;
use crate::handles::HandleTable;
use crate::origin::Origin;
use crate::tree::{DIR_BLOCK_SIZE, Node, NodeKind, NodeTree};

/// Longest entry name reported by `statfs`.
const NAME_MAX: u32 = 255;

/// How long `destroy` waits for handle workers to release their streams.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Work queued to a handle's worker.
enum HandleOp {
    Read {
        offset: u64,
        size: usize,
        reply: ReplyData,
    },
    Flush {
        reply: ReplyEmpty,
    },
    Release {
        reply: ReplyEmpty,
    },
}

/// Table entry for one open file.
struct OpenFile {
    ino: u64,
    ops: mpsc::UnboundedSender<HandleOp>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

/// One line of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: FileType,
    pub name: String,
}

/// Read-only FUSE filesystem exposing the media library.
pub struct MediaFs {
    tree: Arc<NodeTree>,
    config: MountConfig,
    origin: Arc<dyn Origin>,
    runtime: Handle,
    /// Parent of every handle's cancellation scope.
    shutdown: CancellationToken,
    handles: HandleTable<OpenFile>,
    stats: Arc<BridgeStats>,
}

impl MediaFs {
    /// Creates the filesystem over `tree`.
    ///
    /// Handle workers are spawned on `runtime`; cancelling `shutdown` aborts
    /// every in-flight transfer.
    pub fn new(
        tree: Arc<NodeTree>,
        origin: Arc<dyn Origin>,
        config: MountConfig,
        runtime: Handle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            tree,
            config,
            origin,
            runtime,
            shutdown,
            handles: HandleTable::new(),
            stats: BridgeStats::new(),
        }
    }

    pub fn tree(&self) -> &Arc<NodeTree> {
        &self.tree
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }

    /// Number of files currently open.
    pub fn open_files(&self) -> usize {
        self.handles.len()
    }

    fn ttl(&self) -> Duration {
        self.config.attr_ttl()
    }

    fn attr(&self, node: &Node) -> FileAttr {
        node.file_attr(self.config.uid, self.config.gid)
    }

    fn node(&self, ino: u64) -> FsResult<Arc<Node>> {
        self.tree.get(ino).ok_or(FsError::InvalidInode(ino))
    }

    fn dir(&self, ino: u64) -> FsResult<Arc<Node>> {
        let node = self.node(ino)?;
        if node.is_dir() {
            Ok(node)
        } else {
            Err(FsError::NotADirectory(ino))
        }
    }

    /// Resolves `name` inside the directory `parent`.
    pub fn lookup_child(&self, parent: u64, name: &OsStr) -> FsResult<Arc<Node>> {
        let dir = self.dir(parent)?;
        let name = name.to_str().ok_or_else(|| FsError::NotFound(name.to_string_lossy().into_owned()))?;
        dir.get_child(name).ok_or_else(|| FsError::NotFound(name.to_string()))
    }

    /// Lists `ino` including `.` and `..`, sorted by name.
    pub fn list_directory(&self, ino: u64) -> FsResult<Vec<DirEntry>> {
        let dir = self.dir(ino)?;
        let mut entries = vec![
            DirEntry {
                ino,
                kind: FileType::Directory,
                name: ".".to_string(),
            },
            DirEntry {
                ino: dir.parent(),
                kind: FileType::Directory,
                name: "..".to_string(),
            },
        ];
        entries.extend(dir.children().iter().map(|child| DirEntry {
            ino: child.ino(),
            kind: file_type(child.kind()),
            name: child.name().to_string(),
        }));
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Index in `entries` to resume a listing from after `offset`.
    ///
    /// Offsets are name hashes, so a listing survives entries appearing or
    /// disappearing between calls. An unknown offset restarts from the top.
    pub fn resume_index(entries: &[DirEntry], offset: i64) -> usize {
        if offset == 0 {
            return 0;
        }
        if let Some(idx) = entries
            .iter()
            .position(|e| Self::name_to_offset(&e.name) == offset)
        {
            return idx + 1;
        }
        debug!(offset, entries = entries.len(), "readdir offset vanished, restarting listing");
        0
    }

    /// Stable, positive, non-zero directory offset for an entry name.
    pub fn name_to_offset(name: &str) -> i64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        let masked = hasher.finish() & 0x7FFF_FFFF_FFFF_FFFF;
        i64::try_from(masked).map_or(1, |offset| offset.max(1))
    }

    /// Allocates a handle for a file node and starts its worker.
    ///
    /// Write access is refused. No network I/O happens here.
    pub fn open_file(&self, ino: u64, flags: i32) -> FsResult<u64> {
        let node = self.node(ino)?;
        if node.is_dir() {
            return Err(FsError::IsADirectory(ino));
        }
        if (flags & libc::O_ACCMODE) != libc::O_RDONLY || (flags & libc::O_TRUNC) != 0 {
            return Err(FsError::ReadOnly);
        }

        let handle = FileHandle::open(
            &node,
            Arc::clone(&self.origin),
            self.config.stream,
            &self.shutdown,
        )?;
        let cancel = handle.cancellation_token().clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = self
            .runtime
            .spawn(run_handle(handle, rx, Arc::clone(&self.stats)));

        let fh = self.handles.insert_auto(OpenFile {
            ino,
            ops: tx,
            cancel,
            worker,
        });
        debug!(ino, fh, name = node.name(), "file opened");
        Ok(fh)
    }

    /// Queues `op` on the worker for `fh`, handing the op back if there is none.
    fn submit(&self, fh: u64, op: HandleOp) -> Result<(), HandleOp> {
        match self.handles.get(fh) {
            Some(file) => file.ops.send(op).map_err(|e| e.0),
            None => Err(op),
        }
    }
}

fn file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Directory => FileType::Directory,
        NodeKind::File => FileType::RegularFile,
    }
}

/// Executes one handle's operations in order until release.
async fn run_handle(
    mut file: FileHandle,
    mut ops: mpsc::UnboundedReceiver<HandleOp>,
    stats: Arc<BridgeStats>,
) {
    while let Some(op) = ops.recv().await {
        match op {
            HandleOp::Read {
                offset,
                size,
                reply,
            } => {
                stats.record_start();
                match file.read(offset, size).await {
                    Ok(data) => {
                        stats.record_complete();
                        reply.data(&data);
                    }
                    Err(e) => {
                        if e.is_timeout() {
                            stats.record_timeout();
                        } else {
                            stats.record_failure();
                        }
                        reply.error(e.to_errno());
                    }
                }
            }
            HandleOp::Flush { reply } => {
                file.flush().await;
                reply.ok();
            }
            HandleOp::Release { reply } => {
                trace!(name = file.name(), "handle released");
                file.close().await;
                reply.ok();
                return;
            }
        }
    }
    // Sender dropped without a release: the filesystem is going away
    file.close().await;
}

impl Filesystem for MediaFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!(entries = self.tree.len(), "media filesystem initialized");
        Ok(())
    }

    /// Clean up on unmount.
    ///
    /// Cancels every open handle and waits a bounded time for the workers
    /// to close their remote streams.
    fn destroy(&mut self) {
        let open = self.handles.drain();
        let mut workers = Vec::with_capacity(open.len());
        for (fh, file) in open {
            trace!(fh, ino = file.ino, "cancelling open handle");
            file.cancel.cancel();
            drop(file.ops);
            workers.push(file.worker);
        }
        if !workers.is_empty() {
            let pending = workers.len();
            if let Err(e) = async_bridge::execute(&self.runtime, SHUTDOWN_GRACE, async move {
                futures::future::join_all(workers).await;
            }) {
                warn!(pending, error = %e, "handle workers did not stop in time");
            }
        }

        let stats = self.stats.snapshot();
        info!(
            reads = stats.started,
            completed = stats.completed,
            failed = stats.failed,
            timed_out = stats.timed_out,
            "media filesystem destroyed"
        );
    }

    /// Look up a directory entry by name and get its attributes.
    ///
    /// Entries carry the reconciliation period as TTL. Generation is always
    /// 0 since inode numbers are never reused within one mount.
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!(parent, name = ?name, "lookup");
        match self.lookup_child(parent, name) {
            Ok(node) => reply.entry(&self.ttl(), &self.attr(&node), 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!(inode = ino, "getattr");
        match self.node(ino) {
            Ok(node) => reply.attr(&self.ttl(), &self.attr(&node)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    /// Open a file for reading.
    ///
    /// Binds a [`FileHandle`] to the node's current URL and size. The remote
    /// connection is made lazily by the first read.
    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, flags, "open");
        match self.open_file(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    /// Read data from an open file.
    ///
    /// Returns immediately; the handle's worker replies once the bytes are
    /// buffered or the read deadline passes.
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(inode = ino, fh, offset, size, "read");
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let op = HandleOp::Read {
            offset,
            size: size as usize,
            reply,
        };
        if let Err(HandleOp::Read { reply, .. }) = self.submit(fh, op) {
            reply.error(FsError::InvalidHandle(fh).to_errno());
        }
    }

    /// Flush an open file.
    ///
    /// Drops the handle's remote connection; the next read reconnects.
    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!(inode = ino, fh, "flush");
        if let Err(HandleOp::Flush { reply }) = self.submit(fh, HandleOp::Flush { reply }) {
            reply.error(FsError::InvalidHandle(fh).to_errno());
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(inode = ino, fh, "release");
        let Some(file) = self.handles.remove(fh) else {
            reply.error(FsError::InvalidHandle(fh).to_errno());
            return;
        };
        file.cancel.cancel();
        if let Err(e) = file.ops.send(HandleOp::Release { reply })
            && let HandleOp::Release { reply } = e.0
        {
            reply.ok();
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        trace!(inode = ino, "opendir");
        match self.dir(ino) {
            Ok(_) => reply.opened(0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    /// Read directory entries.
    ///
    /// Each entry's offset is a hash of its name. A listing resumed after a
    /// reconciliation pass never skips surviving entries; if the last entry
    /// returned was pruned it restarts from the top and may repeat some.
    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(inode = ino, offset, "readdir");
        let entries = match self.list_directory(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        let start = Self::resume_index(&entries, offset);
        for entry in entries.iter().skip(start) {
            if reply.add(entry.ino, Self::name_to_offset(&entry.name), entry.kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let files = self.tree.len() as u64;
        reply.statfs(0, 0, 0, files, 0, DIR_BLOCK_SIZE, NAME_MAX, DIR_BLOCK_SIZE);
    }

    /// Check access permissions. Any write access is refused.
    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        trace!(inode = ino, mask, "access");
        if self.tree.get(ino).is_none() {
            reply.error(libc::ENOENT);
        } else if mask & libc::W_OK != 0 {
            reply.error(FsError::ReadOnly.to_errno());
        } else {
            reply.ok();
        }
    }
}
