//! Kernel adapter for the control tree.
//!
//! Serves a [`CtrlTree`](super::CtrlTree) through the FUSE lowlevel API.
//! Values are snapshotted per open handle, only offset-0 reads and writes
//! are honored, and truncation is accepted and ignored so shell
//! redirection (`echo 1 > online`) works.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use log::{debug, warn};
use parking_lot::Mutex;

use super::{CtrlNode, CtrlTree, NodeKind};

const TTL: Duration = Duration::ZERO;

struct OpenHandle {
    node: Arc<CtrlNode>,
    /// Snapshot served to reads on this handle.
    content: Option<String>,
    /// Tracker value returned by the open callback.
    tracker_value: Option<i64>,
}

pub struct CtrlFs {
    tree: Arc<CtrlTree>,
    handles: Mutex<HashMap<u64, OpenHandle>>,
    next_fh: AtomicU64,
    uid: u32,
    gid: u32,
    started: SystemTime,
}

impl CtrlFs {
    pub fn new(tree: Arc<CtrlTree>) -> CtrlFs {
        CtrlFs {
            tree,
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            started: SystemTime::now(),
        }
    }

    /// Mount at `mountpoint` on a dedicated session thread.
    pub fn mount(
        tree: Arc<CtrlTree>,
        mountpoint: &Path,
    ) -> std::io::Result<fuser::BackgroundSession> {
        let options = [
            MountOption::FSName("ctrlfs".to_string()),
            MountOption::AutoUnmount,
        ];
        fuser::spawn_mount2(CtrlFs::new(tree), mountpoint, &options)
    }

    fn attr(&self, node: &CtrlNode) -> FileAttr {
        let kind = if node.is_dir() {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        FileAttr {
            ino: node.ino,
            size: node.size_hint(),
            blocks: 0,
            atime: self.started,
            mtime: self.started,
            ctime: self.started,
            crtime: UNIX_EPOCH,
            kind,
            perm: node.perm(),
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

impl Filesystem for CtrlFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent) = self.tree.node_by_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match parent.child(name) {
            Some(node) => reply.entry(&TTL, &self.attr(&node), 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.tree.node_by_ino(ino) {
            Some(node) => reply.attr(&TTL, &self.attr(&node)),
            None => reply.error(libc::ENOENT),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(node) = self.tree.node_by_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        // Truncate is a no-op so `>` redirection works.  A bare touch of
        // an event node still counts as a trigger.
        if size.is_none() && (atime.is_some() || mtime.is_some()) {
            if let NodeKind::Event { fire } = &node.kind {
                fire();
            }
        }
        reply.attr(&TTL, &self.attr(&node));
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(node) = self.tree.node_by_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let accmode = flags & libc::O_ACCMODE;
        let wants_read = accmode == libc::O_RDONLY || accmode == libc::O_RDWR;
        let wants_write = accmode == libc::O_WRONLY || accmode == libc::O_RDWR;
        let perm = node.perm();
        if wants_read && perm & 0o400 == 0 {
            reply.error(libc::EACCES);
            return;
        }
        if wants_write && perm & 0o200 == 0 {
            reply.error(libc::EACCES);
            return;
        }
        let mut handle = OpenHandle {
            node: Arc::clone(&node),
            content: None,
            tracker_value: None,
        };
        if let NodeKind::Tracker { open, .. } = &node.kind {
            let value = open();
            let content = value.to_string();
            node.note_size(content.len());
            handle.content = Some(content);
            handle.tracker_value = Some(value);
        }
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(fh, handle);
        reply.opened(fh, fuser::consts::FOPEN_DIRECT_IO);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let mut handles = self.handles.lock();
        let Some(handle) = handles.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        if offset != 0 {
            // Short first reads already signal EOF; anything else is a
            // seek we do not support.
            reply.error(libc::EINVAL);
            return;
        }
        if handle.content.is_none() {
            let content = match &handle.node.kind {
                NodeKind::Constant { value } => Some(value.clone()),
                NodeKind::Variable {
                    read: Some(read), ..
                } => Some(read()),
                _ => None,
            };
            match content {
                Some(content) => {
                    handle.node.note_size(content.len());
                    handle.content = Some(content);
                }
                None => {
                    reply.error(libc::EACCES);
                    return;
                }
            }
        }
        let content = handle.content.as_deref().unwrap_or("");
        let take = content.len().min(size as usize);
        reply.data(&content.as_bytes()[..take]);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let handles = self.handles.lock();
        let Some(handle) = handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        if offset != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let text = String::from_utf8_lossy(data);
        let text = text.trim_end_matches(['\n', '\r']);
        match &handle.node.kind {
            NodeKind::Variable {
                write: Some(write), ..
            } => match write(text) {
                Ok(()) => {
                    handle.node.note_size(data.len());
                    reply.written(data.len() as u32);
                }
                Err(errno) => reply.error(errno),
            },
            NodeKind::Event { fire } => {
                fire();
                handle.node.note_size(data.len());
                reply.written(data.len() as u32);
            }
            _ => reply.error(libc::EACCES),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(handle) = self.handles.lock().remove(&fh) {
            if let (NodeKind::Tracker { close: Some(close), .. }, Some(value)) =
                (&handle.node.kind, handle.tracker_value)
            {
                close(value);
            }
        } else {
            warn!("release of unknown ctrl handle {fh}");
        }
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.tree.node_by_ino(ino) {
            Some(node) if node.is_dir() => reply.opened(0, 0),
            Some(_) => reply.error(libc::ENOTDIR),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(node) = self.tree.node_by_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if !node.is_dir() {
            reply.error(libc::ENOTDIR);
            return;
        }
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (node.ino, FileType::Directory, ".".to_string()),
            (node.ino, FileType::Directory, "..".to_string()),
        ];
        for child in node.children() {
            let kind = if child.is_dir() {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            entries.push((child.ino, kind, child.name.clone()));
        }
        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn destroy(&mut self) {
        debug!("ctrl fs session ending");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    // Drive the Filesystem impl through the tree directly; the kernel
    // mount is exercised by the running daemon, not unit tests.
    #[test]
    fn tracker_open_read_release_cycle() {
        let tree = CtrlTree::new();
        let root = tree.root();
        let opens = Arc::new(AtomicI64::new(0));
        let last_closed = Arc::new(AtomicI64::new(-1));
        let o = Arc::clone(&opens);
        let c = Arc::clone(&last_closed);
        tree.register_tracker(
            &root,
            "client",
            Box::new(move || o.fetch_add(1, Ordering::SeqCst) + 1),
            Some(Box::new(move |v| c.store(v, Ordering::SeqCst))),
        )
        .unwrap();

        let fs = CtrlFs::new(Arc::clone(&tree));
        let node = tree.find_path_node("/client").unwrap();

        // Simulate two opens through the handle table.
        for expect in 1..=2i64 {
            let NodeKind::Tracker { open, close } = &node.kind else {
                panic!("expected tracker");
            };
            let value = open();
            assert_eq!(value, expect);
            if let Some(close) = close {
                close(value);
            }
            assert_eq!(last_closed.load(Ordering::SeqCst), expect);
        }
        drop(fs);
    }

    #[test]
    fn variable_snapshot_is_per_open() {
        let tree = CtrlTree::new();
        let root = tree.root();
        let counter = Arc::new(AtomicI64::new(0));
        let c = Arc::clone(&counter);
        tree.register_variable(
            &root,
            "val",
            Some(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst).to_string()
            })),
            None,
        )
        .unwrap();
        let node = tree.find_path_node("/val").unwrap();
        let NodeKind::Variable { read: Some(read), .. } = &node.kind else {
            panic!("expected readable variable");
        };
        assert_eq!(read(), "0");
        assert_eq!(read(), "1");
    }
}
