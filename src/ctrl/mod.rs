//! Control filesystem tree.
//!
//! System internals are exposed as a POSIX directory tree so anything
//! that can read and write files can inspect or steer the running
//! service. The tree itself is kernel-agnostic; [`fs`] adapts it to the
//! kernel FUSE API. Five node kinds exist: directories, variables (read
//! and/or write callbacks), events (write-only triggers), constants
//! (fixed strings) and trackers (per-open counters).
//!
//! Registration is two-phase: a node becomes visible to lookup and
//! readdir only once `publish` has run, so a concurrent walker can never
//! observe a node whose callbacks are not yet installed.

pub mod fs;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::debug;
use parking_lot::RwLock;

/// Constants are bounded so getattr can report an exact size.
pub const CTRL_CONST_MAX: usize = 128;

pub type ReadCb = Box<dyn Fn() -> String + Send + Sync>;
/// Returns a POSIX errno on rejection.
pub type WriteCb = Box<dyn Fn(&str) -> Result<(), i32> + Send + Sync>;
pub type EventCb = Box<dyn Fn() + Send + Sync>;
/// Runs on every open of the tracker node; the returned value is what
/// that open reads back.
pub type TrackerOpenCb = Box<dyn Fn() -> i64 + Send + Sync>;
pub type TrackerCloseCb = Box<dyn Fn(i64) + Send + Sync>;

pub enum NodeKind {
    Dir {
        children: RwLock<Vec<Arc<CtrlNode>>>,
    },
    Variable {
        read: Option<ReadCb>,
        write: Option<WriteCb>,
    },
    Event {
        fire: EventCb,
    },
    Constant {
        value: String,
    },
    Tracker {
        open: TrackerOpenCb,
        close: Option<TrackerCloseCb>,
    },
}

pub struct CtrlNode {
    pub name: String,
    pub ino: u64,
    initialized: AtomicBool,
    /// Length of the node's content: exact for constants, otherwise the
    /// most recent read or write length.
    size: AtomicU64,
    pub kind: NodeKind,
}

impl std::fmt::Debug for CtrlNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtrlNode")
            .field("name", &self.name)
            .field("ino", &self.ino)
            .field("initialized", &self.initialized)
            .field("size", &self.size)
            .finish()
    }
}

impl CtrlNode {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir { .. })
    }

    pub fn is_published(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn publish(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Permission bits follow from which callbacks exist.
    pub fn perm(&self) -> u16 {
        match &self.kind {
            NodeKind::Dir { .. } => 0o500,
            NodeKind::Variable { read, write } => {
                let mut perm = 0;
                if read.is_some() {
                    perm |= 0o400;
                }
                if write.is_some() {
                    perm |= 0o200;
                }
                perm
            }
            NodeKind::Event { .. } => 0o200,
            NodeKind::Constant { .. } => 0o400,
            NodeKind::Tracker { .. } => 0o400,
        }
    }

    /// Size reported by getattr: the cached content length, updated by
    /// every read and write.
    pub fn size_hint(&self) -> u64 {
        match &self.kind {
            NodeKind::Dir { .. } => 0,
            _ => self.size.load(Ordering::Relaxed),
        }
    }

    /// Record the length of the content just read or written.
    pub fn note_size(&self, len: usize) {
        self.size.store(len as u64, Ordering::Relaxed);
    }

    /// Find a published child by name.
    pub fn child(&self, name: &str) -> Option<Arc<CtrlNode>> {
        match &self.kind {
            NodeKind::Dir { children } => children
                .read()
                .iter()
                .find(|c| c.is_published() && c.name == name)
                .cloned(),
            _ => None,
        }
    }

    /// Published children in insertion order.
    pub fn children(&self) -> Vec<Arc<CtrlNode>> {
        match &self.kind {
            NodeKind::Dir { children } => children
                .read()
                .iter()
                .filter(|c| c.is_published())
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }
}

pub struct CtrlTree {
    root: Arc<CtrlNode>,
    by_ino: RwLock<HashMap<u64, Arc<CtrlNode>>>,
    next_ino: AtomicU64,
}

impl CtrlTree {
    pub fn new() -> Arc<CtrlTree> {
        let root = Arc::new(CtrlNode {
            name: String::new(),
            ino: 1,
            initialized: AtomicBool::new(true),
            size: AtomicU64::new(0),
            kind: NodeKind::Dir {
                children: RwLock::new(Vec::new()),
            },
        });
        let tree = CtrlTree {
            root: Arc::clone(&root),
            by_ino: RwLock::new(HashMap::new()),
            next_ino: AtomicU64::new(2),
        };
        tree.by_ino.write().insert(1, root);
        Arc::new(tree)
    }

    pub fn root(&self) -> Arc<CtrlNode> {
        Arc::clone(&self.root)
    }

    pub fn node_by_ino(&self, ino: u64) -> Option<Arc<CtrlNode>> {
        self.by_ino.read().get(&ino).cloned()
    }

    fn alloc(&self, name: &str, kind: NodeKind) -> Arc<CtrlNode> {
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        let size = match &kind {
            NodeKind::Constant { value } => value.len() as u64,
            _ => 0,
        };
        let node = Arc::new(CtrlNode {
            name: name.to_string(),
            ino,
            initialized: AtomicBool::new(false),
            size: AtomicU64::new(size),
            kind,
        });
        self.by_ino.write().insert(ino, Arc::clone(&node));
        node
    }

    /// Insert `child` under `parent`.  A name conflict is `EEXIST` unless
    /// both the existing node and the new one are directories, in which
    /// case the existing directory is reused.
    fn insert(
        &self,
        parent: &Arc<CtrlNode>,
        child: Arc<CtrlNode>,
    ) -> Result<Arc<CtrlNode>, i32> {
        let NodeKind::Dir { children } = &parent.kind else {
            return Err(libc::ENOTDIR);
        };
        let mut children = children.write();
        if let Some(existing) = children.iter().find(|c| c.name == child.name) {
            if existing.is_dir() && child.is_dir() {
                self.by_ino.write().remove(&child.ino);
                return Ok(Arc::clone(existing));
            }
            debug!("ctrl node conflict on '{}'", child.name);
            self.by_ino.write().remove(&child.ino);
            return Err(libc::EEXIST);
        }
        children.push(Arc::clone(&child));
        Ok(child)
    }

    fn add(
        &self,
        parent: &Arc<CtrlNode>,
        name: &str,
        kind: NodeKind,
    ) -> Result<Arc<CtrlNode>, i32> {
        if name.is_empty() || name.contains('/') {
            return Err(libc::EINVAL);
        }
        let node = self.insert(parent, self.alloc(name, kind))?;
        node.publish();
        Ok(node)
    }

    pub fn create_subdir(
        &self,
        parent: &Arc<CtrlNode>,
        name: &str,
    ) -> Result<Arc<CtrlNode>, i32> {
        self.add(
            parent,
            name,
            NodeKind::Dir {
                children: RwLock::new(Vec::new()),
            },
        )
    }

    pub fn register_variable(
        &self,
        parent: &Arc<CtrlNode>,
        name: &str,
        read: Option<ReadCb>,
        write: Option<WriteCb>,
    ) -> Result<Arc<CtrlNode>, i32> {
        self.add(parent, name, NodeKind::Variable { read, write })
    }

    pub fn register_event(
        &self,
        parent: &Arc<CtrlNode>,
        name: &str,
        fire: EventCb,
    ) -> Result<Arc<CtrlNode>, i32> {
        self.add(parent, name, NodeKind::Event { fire })
    }

    pub fn register_constant(
        &self,
        parent: &Arc<CtrlNode>,
        name: &str,
        value: &str,
    ) -> Result<Arc<CtrlNode>, i32> {
        if value.len() > CTRL_CONST_MAX {
            return Err(libc::EINVAL);
        }
        self.add(
            parent,
            name,
            NodeKind::Constant {
                value: value.to_string(),
            },
        )
    }

    pub fn register_constant_u64(
        &self,
        parent: &Arc<CtrlNode>,
        name: &str,
        value: u64,
    ) -> Result<Arc<CtrlNode>, i32> {
        self.register_constant(parent, name, &value.to_string())
    }

    pub fn register_constant_i64(
        &self,
        parent: &Arc<CtrlNode>,
        name: &str,
        value: i64,
    ) -> Result<Arc<CtrlNode>, i32> {
        self.register_constant(parent, name, &value.to_string())
    }

    pub fn register_tracker(
        &self,
        parent: &Arc<CtrlNode>,
        name: &str,
        open: TrackerOpenCb,
        close: Option<TrackerCloseCb>,
    ) -> Result<Arc<CtrlNode>, i32> {
        self.add(parent, name, NodeKind::Tracker { open, close })
    }

    /// Walk an absolute path to a published node.
    pub fn find_path_node(&self, path: &str) -> Option<Arc<CtrlNode>> {
        let mut node = self.root();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            node = node.child(part)?;
        }
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    #[test]
    fn path_walk_and_conflicts() {
        let tree = CtrlTree::new();
        let root = tree.root();
        let iof = tree.create_subdir(&root, "iof").unwrap();
        let again = tree.create_subdir(&root, "iof").unwrap();
        assert_eq!(iof.ino, again.ino);
        tree.register_constant(&iof, "ionss_count", "1").unwrap();
        assert_eq!(
            tree.create_subdir(&iof, "ionss_count").unwrap_err(),
            libc::EEXIST
        );
        let node = tree.find_path_node("/iof/ionss_count").unwrap();
        match &node.kind {
            NodeKind::Constant { value } => assert_eq!(value, "1"),
            _ => panic!("expected a constant"),
        }
        assert!(tree.find_path_node("/iof/nope").is_none());
        assert_eq!(tree.find_path_node("/").unwrap().ino, 1);
    }

    #[test]
    fn oversized_constant_rejected() {
        let tree = CtrlTree::new();
        let root = tree.root();
        let big = "x".repeat(CTRL_CONST_MAX + 1);
        assert_eq!(
            tree.register_constant(&root, "big", &big).unwrap_err(),
            libc::EINVAL
        );
    }

    #[test]
    fn permissions_follow_callbacks() {
        let tree = CtrlTree::new();
        let root = tree.root();
        let ro = tree
            .register_variable(&root, "ro", Some(Box::new(|| "1".into())), None)
            .unwrap();
        assert_eq!(ro.perm(), 0o400);
        let rw = tree
            .register_variable(
                &root,
                "rw",
                Some(Box::new(|| "1".into())),
                Some(Box::new(|_| Ok(()))),
            )
            .unwrap();
        assert_eq!(rw.perm(), 0o600);
        let ev = tree.register_event(&root, "ev", Box::new(|| ())).unwrap();
        assert_eq!(ev.perm(), 0o200);
    }

    #[test]
    fn size_follows_content() {
        let tree = CtrlTree::new();
        let root = tree.root();
        let konst = tree.register_constant(&root, "count", "42").unwrap();
        assert_eq!(konst.size_hint(), 2);

        let var = tree
            .register_variable(
                &root,
                "val",
                Some(Box::new(|| "1234".into())),
                Some(Box::new(|_| Ok(()))),
            )
            .unwrap();
        // Nothing read or written yet.
        assert_eq!(var.size_hint(), 0);
        var.note_size(4);
        assert_eq!(var.size_hint(), 4);
        // A shorter write shrinks it again.
        var.note_size(1);
        assert_eq!(var.size_hint(), 1);
    }

    #[test]
    fn unpublished_nodes_are_invisible() {
        let tree = CtrlTree::new();
        let root = tree.root();
        let node = tree.alloc(
            "pending",
            NodeKind::Constant {
                value: "v".to_string(),
            },
        );
        tree.insert(&root, Arc::clone(&node)).unwrap();
        assert!(root.child("pending").is_none());
        assert!(root.children().is_empty());
        node.publish();
        assert!(root.child("pending").is_some());
        assert_eq!(root.children().len(), 1);
    }

    #[test]
    fn tracker_counts_opens() {
        let tree = CtrlTree::new();
        let root = tree.root();
        let count = Arc::new(AtomicI64::new(0));
        let c = Arc::clone(&count);
        let node = tree
            .register_tracker(
                &root,
                "client",
                Box::new(move || c.fetch_add(1, Ordering::SeqCst) + 1),
                None,
            )
            .unwrap();
        let NodeKind::Tracker { open, .. } = &node.kind else {
            panic!("expected tracker");
        };
        let values: Vec<i64> = (0..4).map(|_| open()).collect();
        assert_eq!(values, vec![1, 2, 3, 4]);
    }
}
