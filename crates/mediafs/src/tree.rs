//! In-memory node tree exposed through the mount.
//!
//! The tree mirrors the remote library as `movies/<title>/<files>` and
//! `shows/<title>/<season>/<files>`. Every [`Node`] guards its own children
//! with its own lock; there is no tree-wide lock, so disjoint subtrees can be
//! read and reconciled at the same time.
//!
//! [`NodeTree`] owns the root, allocates inode numbers, keeps the
//! inode → node index used by the protocol adapter, and tells the kernel
//! about entries that disappear.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use dashmap::DashMap;
use fuser::{FileAttr, FileType};
use parking_lot::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::config::MountConfig;

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// Size reported for every directory.
pub const DIR_BLOCK_SIZE: u32 = 4096;

/// Directory permissions (r-xr-xr-x).
const DIR_PERM: u16 = 0o555;

/// File permissions (r--r--r--).
const FILE_PERM: u16 = 0o444;

/// Kernel-side invalidation hook.
///
/// Implemented for `fuser::Notifier`; tests substitute a recorder.
pub trait EntryNotifier: Send + Sync {
    /// Tells the kernel that `name` (inode `child`) was removed from `parent`.
    fn delete(&self, parent: u64, child: u64, name: &str) -> io::Result<()>;
}

impl EntryNotifier for fuser::Notifier {
    fn delete(&self, parent: u64, child: u64, name: &str) -> io::Result<()> {
        fuser::Notifier::delete(self, parent, child, OsStr::new(name))
    }
}

/// Whether a node is a directory or a streamable file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

/// Mutable attributes of a node, replaced in place on every pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttrs {
    pub size: u64,
    pub mtime: SystemTime,
    /// Download URL; always `None` for directories.
    pub url: Option<Url>,
}

/// One filesystem entry.
#[derive(Debug)]
pub struct Node {
    ino: u64,
    parent: u64,
    name: String,
    kind: NodeKind,
    attrs: RwLock<NodeAttrs>,
    /// Set when the current reconciliation pass has seen this node.
    valid: AtomicBool,
    children: RwLock<BTreeMap<String, Arc<Node>>>,
}

impl Node {
    fn new(ino: u64, parent: u64, name: String, kind: NodeKind, attrs: NodeAttrs) -> Self {
        Self {
            ino,
            parent,
            name,
            kind,
            attrs: RwLock::new(attrs),
            valid: AtomicBool::new(true),
            children: RwLock::new(BTreeMap::new()),
        }
    }

    /// Creates a detached directory node.
    pub fn new_dir(ino: u64, parent: u64, name: impl Into<String>, mtime: SystemTime) -> Self {
        let attrs = NodeAttrs {
            size: u64::from(DIR_BLOCK_SIZE),
            mtime,
            url: None,
        };
        Self::new(ino, parent, name.into(), NodeKind::Directory, attrs)
    }

    /// Creates a detached file node backed by `url`.
    pub fn new_file(
        ino: u64,
        parent: u64,
        name: impl Into<String>,
        size: u64,
        mtime: SystemTime,
        url: Url,
    ) -> Self {
        let attrs = NodeAttrs {
            size,
            mtime,
            url: Some(url),
        };
        Self::new(ino, parent, name.into(), NodeKind::File, attrs)
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Inode of the containing directory (the root is its own parent).
    pub fn parent(&self) -> u64 {
        self.parent
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Returns a copy of the current attributes.
    pub fn attrs(&self) -> NodeAttrs {
        self.attrs.read().clone()
    }

    pub fn size(&self) -> u64 {
        self.attrs.read().size
    }

    pub fn url(&self) -> Option<Url> {
        self.attrs.read().url.clone()
    }

    /// Replaces size, timestamp and URL of a file node.
    ///
    /// Returns `true` if anything changed.
    pub fn update_file(&self, size: u64, mtime: SystemTime, url: Url) -> bool {
        let mut attrs = self.attrs.write();
        let changed = attrs.size != size || attrs.mtime != mtime || attrs.url.as_ref() != Some(&url);
        if changed {
            attrs.size = size;
            attrs.mtime = mtime;
            attrs.url = Some(url);
        }
        changed
    }

    /// Replaces the timestamp. Returns `true` if it changed.
    pub fn set_mtime(&self, mtime: SystemTime) -> bool {
        let mut attrs = self.attrs.write();
        let changed = attrs.mtime != mtime;
        attrs.mtime = mtime;
        changed
    }

    pub fn mark_valid(&self) {
        self.valid.store(true, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Inserts `child`, replacing any child with the same name.
    ///
    /// Returns the replaced child, if any.
    pub fn add_child(&self, child: Arc<Node>) -> Option<Arc<Node>> {
        self.children.write().insert(child.name.clone(), child)
    }

    pub fn get_child(&self, name: &str) -> Option<Arc<Node>> {
        self.children.read().get(name).cloned()
    }

    pub fn remove_child(&self, name: &str) -> Option<Arc<Node>> {
        self.children.write().remove(name)
    }

    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    /// Snapshot of the children in name order.
    pub fn children(&self) -> Vec<Arc<Node>> {
        self.children.read().values().cloned().collect()
    }

    /// Detaches every child and returns them.
    pub fn remove_all_children(&self) -> Vec<Arc<Node>> {
        let removed = std::mem::take(&mut *self.children.write());
        removed.into_values().collect()
    }

    /// Clears the valid flag on every descendant.
    pub fn mark_all_invalid(&self) {
        for child in self.children() {
            child.valid.store(false, Ordering::Release);
            if child.is_dir() {
                child.mark_all_invalid();
            }
        }
    }

    /// Removes every descendant that was not re-validated since the last
    /// [`mark_all_invalid`](Self::mark_all_invalid).
    ///
    /// Returns the detached nodes. A detached directory is returned once;
    /// its own descendants are not listed separately.
    pub fn prune_invalid(&self) -> Vec<Arc<Node>> {
        let (mut pruned, kept) = {
            let mut children = self.children.write();
            let mut pruned = Vec::new();
            children.retain(|_, child| {
                if child.is_valid() {
                    true
                } else {
                    pruned.push(Arc::clone(child));
                    false
                }
            });
            let kept: Vec<_> = children.values().filter(|c| c.is_dir()).cloned().collect();
            (pruned, kept)
        };

        for dir in kept {
            pruned.extend(dir.prune_invalid());
        }
        pruned
    }

    /// Builds the attributes reported to the kernel.
    ///
    /// Directories report a fixed size and a link count equal to their
    /// child count; files report their real size. All three timestamps carry
    /// the node's single timestamp.
    pub fn file_attr(&self, uid: u32, gid: u32) -> FileAttr {
        let attrs = self.attrs.read();
        let (kind, perm, nlink, size) = match self.kind {
            NodeKind::Directory => {
                let nlink = u32::try_from(self.child_count()).unwrap_or(u32::MAX);
                (FileType::Directory, DIR_PERM, nlink, u64::from(DIR_BLOCK_SIZE))
            }
            NodeKind::File => (FileType::RegularFile, FILE_PERM, 1, attrs.size),
        };
        FileAttr {
            ino: self.ino,
            size,
            blocks: size.div_ceil(512),
            atime: attrs.mtime,
            mtime: attrs.mtime,
            ctime: attrs.mtime,
            crtime: attrs.mtime,
            kind,
            perm,
            nlink,
            uid,
            gid,
            rdev: 0,
            blksize: DIR_BLOCK_SIZE,
            flags: 0,
        }
    }
}

/// The mounted hierarchy: a root owning the movie and show subtrees.
pub struct NodeTree {
    root: Arc<Node>,
    movies: Arc<Node>,
    shows: Arc<Node>,
    /// Inode index for kernel lookups by number (sharded, not a tree lock).
    index: DashMap<u64, Arc<Node>>,
    next_ino: AtomicU64,
    /// Synthetic timestamp for nodes without a more specific one.
    epoch: SystemTime,
    /// Kernel notifier, injected once the mount is live.
    notifier: OnceLock<Arc<dyn EntryNotifier>>,
}

impl NodeTree {
    /// Creates a tree whose shared timestamp is the current time.
    pub fn new(config: &MountConfig) -> Self {
        Self::with_epoch(config, SystemTime::now())
    }

    /// Creates a tree with an explicit shared timestamp.
    pub fn with_epoch(config: &MountConfig, epoch: SystemTime) -> Self {
        let root = Arc::new(Node::new_dir(ROOT_INODE, ROOT_INODE, "", epoch));
        let movies = Arc::new(Node::new_dir(2, ROOT_INODE, config.movies_dir.clone(), epoch));
        let shows = Arc::new(Node::new_dir(3, ROOT_INODE, config.shows_dir.clone(), epoch));
        root.add_child(Arc::clone(&movies));
        root.add_child(Arc::clone(&shows));

        let index = DashMap::new();
        for node in [&root, &movies, &shows] {
            index.insert(node.ino(), Arc::clone(node));
        }

        Self {
            root,
            movies,
            shows,
            index,
            next_ino: AtomicU64::new(4),
            epoch,
            notifier: OnceLock::new(),
        }
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    pub fn movies(&self) -> &Arc<Node> {
        &self.movies
    }

    pub fn shows(&self) -> &Arc<Node> {
        &self.shows
    }

    pub fn epoch(&self) -> SystemTime {
        self.epoch
    }

    /// Looks up a live node by inode number.
    pub fn get(&self, ino: u64) -> Option<Arc<Node>> {
        self.index.get(&ino).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Installs the kernel notifier. Returns `false` if one was already set.
    pub fn set_notifier(&self, notifier: Arc<dyn EntryNotifier>) -> bool {
        self.notifier.set(notifier).is_ok()
    }

    /// Returns the directory `name` under `parent`, creating it if absent.
    ///
    /// The returned node is marked valid. An existing file of the same name
    /// is replaced.
    pub fn ensure_dir(&self, parent: &Arc<Node>, name: &str, mtime: SystemTime) -> Arc<Node> {
        if let Some(existing) = self.existing_child(parent, name, NodeKind::Directory) {
            existing.set_mtime(mtime);
            return existing;
        }
        let node = Node::new_dir(self.allocate_ino(), parent.ino(), name, mtime);
        self.attach(parent, node)
    }

    /// Creates or updates the file `name` under `parent`.
    ///
    /// The returned node is marked valid. An existing directory of the same
    /// name is replaced.
    pub fn upsert_file(
        &self,
        parent: &Arc<Node>,
        name: &str,
        size: u64,
        mtime: SystemTime,
        url: Url,
    ) -> Arc<Node> {
        if let Some(existing) = self.existing_child(parent, name, NodeKind::File) {
            if existing.update_file(size, mtime, url) {
                trace!(name, size, "file attributes updated");
            }
            return existing;
        }
        let node = Node::new_file(self.allocate_ino(), parent.ino(), name, size, mtime, url);
        self.attach(parent, node)
    }

    /// Removes every descendant of `subtree` not validated in this pass.
    ///
    /// Returns the number of detached entries.
    pub fn prune(&self, subtree: &Arc<Node>) -> usize {
        let pruned = subtree.prune_invalid();
        for node in &pruned {
            self.detach(node);
        }
        pruned.len()
    }

    /// Removes every child of `subtree`. Returns the number removed.
    pub fn clear(&self, subtree: &Arc<Node>) -> usize {
        let removed = subtree.remove_all_children();
        for node in &removed {
            self.detach(node);
        }
        removed.len()
    }

    fn allocate_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::Relaxed)
    }

    fn existing_child(&self, parent: &Arc<Node>, name: &str, kind: NodeKind) -> Option<Arc<Node>> {
        let existing = parent.get_child(name)?;
        if existing.kind() == kind {
            existing.mark_valid();
            return Some(existing);
        }
        if let Some(old) = parent.remove_child(name) {
            debug!(name, "entry changed kind, replacing");
            self.detach(&old);
        }
        None
    }

    fn attach(&self, parent: &Arc<Node>, node: Node) -> Arc<Node> {
        let node = Arc::new(node);
        self.index.insert(node.ino(), Arc::clone(&node));
        if let Some(replaced) = parent.add_child(Arc::clone(&node)) {
            self.detach(&replaced);
        }
        node
    }

    /// Drops a detached node (and its descendants) from the index and
    /// notifies the kernel.
    fn detach(&self, node: &Arc<Node>) {
        self.unregister(node);
        if let Some(notifier) = self.notifier.get()
            && let Err(e) = notifier.delete(node.parent(), node.ino(), node.name())
        {
            // ENOENT just means the kernel never cached the entry
            trace!(name = node.name(), error = %e, "kernel delete notification failed");
        }
    }

    fn unregister(&self, node: &Arc<Node>) {
        self.index.remove(&node.ino());
        for child in node.children() {
            self.unregister(&child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(u64, u64, String)>>);

    impl EntryNotifier for Recorder {
        fn delete(&self, parent: u64, child: u64, name: &str) -> io::Result<()> {
            self.0.lock().push((parent, child, name.to_string()));
            Ok(())
        }
    }

    fn url(path: &str) -> Url {
        Url::parse("http://origin.local/").unwrap().join(path).unwrap()
    }

    fn tree() -> NodeTree {
        NodeTree::with_epoch(&MountConfig::default(), SystemTime::UNIX_EPOCH)
    }

    #[test]
    fn test_root_layout() {
        let tree = tree();
        assert_eq!(tree.root().ino(), ROOT_INODE);
        assert_eq!(tree.root().child_count(), 2);
        assert_eq!(tree.root().get_child("movies").unwrap().ino(), tree.movies().ino());
        assert_eq!(tree.root().get_child("shows").unwrap().ino(), tree.shows().ino());
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_child_names_are_unique() {
        let tree = tree();
        let dir = tree.ensure_dir(tree.movies(), "Heat (1995)", tree.epoch());
        let again = tree.ensure_dir(tree.movies(), "Heat (1995)", tree.epoch());
        assert_eq!(dir.ino(), again.ino());
        assert_eq!(tree.movies().child_count(), 1);
    }

    #[test]
    fn test_upsert_updates_in_place() {
        let tree = tree();
        let dir = tree.ensure_dir(tree.movies(), "Heat", tree.epoch());
        let file = tree.upsert_file(&dir, "heat.mkv", 10, tree.epoch(), url("a"));
        let later = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let updated = tree.upsert_file(&dir, "heat.mkv", 20, later, url("b"));

        assert_eq!(file.ino(), updated.ino());
        let attrs = updated.attrs();
        assert_eq!(attrs.size, 20);
        assert_eq!(attrs.mtime, later);
        assert_eq!(attrs.url, Some(url("b")));
    }

    #[test]
    fn test_kind_change_replaces_node() {
        let tree = tree();
        let file = tree.upsert_file(tree.movies(), "thing", 1, tree.epoch(), url("x"));
        let dir = tree.ensure_dir(tree.movies(), "thing", tree.epoch());
        assert_ne!(file.ino(), dir.ino());
        assert!(tree.get(file.ino()).is_none());
        assert!(tree.get(dir.ino()).unwrap().is_dir());
    }

    #[test]
    fn test_prune_invalid_removes_unseen() {
        let tree = tree();
        let recorder = Arc::new(Recorder::default());
        assert!(tree.set_notifier(recorder.clone()));

        let a = tree.ensure_dir(tree.movies(), "A", tree.epoch());
        let b = tree.ensure_dir(tree.movies(), "B", tree.epoch());
        let b_file = tree.upsert_file(&b, "b.mkv", 5, tree.epoch(), url("b"));

        tree.movies().mark_all_invalid();
        assert!(!a.is_valid());
        assert!(!b_file.is_valid());

        tree.ensure_dir(tree.movies(), "A", tree.epoch());
        assert_eq!(tree.prune(tree.movies()), 1);

        assert!(tree.movies().get_child("A").is_some());
        assert!(tree.movies().get_child("B").is_none());
        assert!(tree.get(b.ino()).is_none());
        assert!(tree.get(b_file.ino()).is_none());

        let events = recorder.0.lock().clone();
        assert_eq!(events, vec![(tree.movies().ino(), b.ino(), "B".to_string())]);
    }

    #[test]
    fn test_prune_recurses_into_valid_directories() {
        let tree = tree();
        let show = tree.ensure_dir(tree.shows(), "Lost", tree.epoch());
        let season = tree.ensure_dir(&show, "Season 01", tree.epoch());
        tree.upsert_file(&season, "e1.mkv", 1, tree.epoch(), url("1"));
        tree.upsert_file(&season, "e2.mkv", 1, tree.epoch(), url("2"));

        tree.shows().mark_all_invalid();
        let show = tree.ensure_dir(tree.shows(), "Lost", tree.epoch());
        let season = tree.ensure_dir(&show, "Season 01", tree.epoch());
        tree.upsert_file(&season, "e1.mkv", 1, tree.epoch(), url("1"));

        assert_eq!(tree.prune(tree.shows()), 1);
        let names: Vec<_> = season.children().iter().map(|n| n.name().to_string()).collect();
        assert_eq!(names, vec!["e1.mkv"]);
    }

    #[test]
    fn test_clear_unregisters_descendants() {
        let tree = tree();
        let dir = tree.ensure_dir(tree.movies(), "A", tree.epoch());
        let file = tree.upsert_file(&dir, "a.mkv", 1, tree.epoch(), url("a"));

        assert_eq!(tree.clear(tree.movies()), 1);
        assert_eq!(tree.movies().child_count(), 0);
        assert!(tree.get(file.ino()).is_none());
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_file_attr() {
        let tree = tree();
        let dir = tree.ensure_dir(tree.movies(), "A", tree.epoch());
        tree.upsert_file(&dir, "a.mkv", 1000, tree.epoch(), url("a"));
        tree.upsert_file(&dir, "a.srt", 10, tree.epoch(), url("s"));

        let attr = dir.file_attr(1000, 1000);
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.size, u64::from(DIR_BLOCK_SIZE));

        let file = dir.get_child("a.mkv").unwrap().file_attr(1000, 1000);
        assert_eq!(file.kind, FileType::RegularFile);
        assert_eq!(file.size, 1000);
        assert_eq!(file.blocks, 2);
        assert_eq!(file.atime, file.mtime);
        assert_eq!(file.ctime, tree.epoch());
        assert_eq!(file.perm, 0o444);
    }

    #[test]
    fn test_concurrent_subtree_updates() {
        use std::thread;

        let tree = Arc::new(tree());
        let handles: Vec<_> = [true, false]
            .into_iter()
            .map(|movies| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    let subtree = if movies { tree.movies().clone() } else { tree.shows().clone() };
                    for i in 0..100 {
                        let dir = tree.ensure_dir(&subtree, &format!("dir_{i}"), tree.epoch());
                        tree.upsert_file(&dir, "f.mkv", i, tree.epoch(), url(&format!("{i}")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tree.movies().child_count(), 100);
        assert_eq!(tree.shows().child_count(), 100);
        assert_eq!(tree.len(), 3 + 400);
    }
}
