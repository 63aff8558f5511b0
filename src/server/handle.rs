//! Server-side resource handles.
//!
//! Three things live behind GAHs on a server: file handles (an open fd,
//! interned by `(inode, open-flags)` so clients opening the same file
//! share one descriptor), inode handles (`O_PATH` fds minted by lookup,
//! interned the same way), and directory streams. Reference counts track
//! protocol-level ownership: one count per client holding the GAH plus
//! one per handler currently using the handle. The fd itself closes when
//! the last in-memory reference drops, which is always after the store
//! and intern locks have been released.

use std::collections::HashMap;
use std::ffi::OsString;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::gah::{Gah, GahError};

use super::{ServerBase, ServerProjection};

/// Key of the intern table.  Inode handles are keyed by `O_PATH`, which
/// the client-side flag filter guarantees never appears on a real open.
pub type InternKey = (u64, i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// An fd opened on behalf of client open/create.
    Open,
    /// An `O_PATH` fd minted by lookup, mkdir or symlink.
    Inode,
    /// The projection root.
    Root,
}

pub struct FileHandle {
    pub projection: Arc<ServerProjection>,
    pub fd: OwnedFd,
    pub ino: u64,
    pub flags: i32,
    pub kind: HandleKind,
    gah: OnceLock<Gah>,
    refs: AtomicU32,
}

impl FileHandle {
    /// Create a handle, intern it and mint its GAH. If `(ino, flags)` is
    /// already interned the fresh fd is dropped and the existing handle
    /// gains a reference, per the interning rule.
    pub fn publish(
        base: &Arc<ServerBase>,
        projection: &Arc<ServerProjection>,
        fd: OwnedFd,
        ino: u64,
        flags: i32,
        kind: HandleKind,
    ) -> Arc<FileHandle> {
        let key: InternKey = (ino, flags);
        let mut intern = projection.intern.lock();
        if let Some(existing) = intern.get(&key) {
            existing.refs.fetch_add(1, Ordering::AcqRel);
            debug!("reusing {} for ino {ino} flags 0{flags:o}", existing.gah());
            return Arc::clone(existing);
        }
        let handle = Arc::new(FileHandle {
            projection: Arc::clone(projection),
            fd,
            ino,
            flags,
            kind,
            gah: OnceLock::new(),
            refs: AtomicU32::new(1),
        });
        let gah = base
            .store
            .write()
            .allocate(base.rank as u8, 0, super::Resource::File(Arc::clone(&handle)));
        handle.gah.set(gah).expect("gah set once");
        intern.insert(key, Arc::clone(&handle));
        debug!("handle {gah} ino {ino} flags 0{flags:o} {kind:?}");
        handle
    }

    /// Mint the projection root handle.  Not interned.
    pub fn publish_root(
        base: &Arc<ServerBase>,
        projection: &Arc<ServerProjection>,
        fd: OwnedFd,
        ino: u64,
    ) -> Arc<FileHandle> {
        let handle = Arc::new(FileHandle {
            projection: Arc::clone(projection),
            fd,
            ino,
            flags: libc::O_PATH,
            kind: HandleKind::Root,
            gah: OnceLock::new(),
            refs: AtomicU32::new(1),
        });
        let gah = base
            .store
            .write()
            .allocate(base.rank as u8, 0, super::Resource::File(Arc::clone(&handle)));
        handle.gah.set(gah).expect("gah set once");
        handle
    }

    pub fn gah(&self) -> Gah {
        *self.gah.get().expect("handle published")
    }

    pub fn addref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Drop `count` references.  At zero the handle leaves the intern
    /// table and the store; the fd closes when the last `Arc` goes away.
    pub fn decref(self: &Arc<Self>, base: &ServerBase, count: u32) {
        let old = self.refs.fetch_sub(count, Ordering::AcqRel);
        if old != count {
            debug!("keeping {} ref {}", self.gah(), old - count);
            return;
        }
        let gah = self.gah();
        debug!("dropping {gah}");
        if self.kind != HandleKind::Root {
            let mut intern = self.projection.intern.lock();
            let key: InternKey = (self.ino, self.flags);
            if let Some(entry) = intern.get(&key) {
                if Arc::ptr_eq(entry, self) {
                    intern.remove(&key);
                }
            }
        }
        if let Err(err) = base.store.write().deallocate(&gah) {
            error!("failed to release {gah}: {err}");
        }
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FileHandle({} fd {} ino {} {:?})",
            self.gah(),
            self.fd.as_raw_fd(),
            self.ino,
            self.kind
        )
    }
}

/// An open directory stream plus the cursor it was last left at.
pub struct DirHandle {
    pub stream: Mutex<DirStream>,
}

impl DirHandle {
    pub fn new(stream: DirStream) -> Arc<DirHandle> {
        Arc::new(DirHandle {
            stream: Mutex::new(stream),
        })
    }
}

/// Thin wrapper over `DIR *`; the `nix` directory type has no seek/tell,
/// which readdir continuation needs.
pub struct DirStream {
    dir: std::ptr::NonNull<libc::DIR>,
    fd: i32,
    /// Cursor after the last entry handed out.
    pub offset: i64,
}

// DIR* is confined to one progress thread at a time by the mutex above.
unsafe impl Send for DirStream {}

impl DirStream {
    /// Takes ownership of `fd`, which is consumed by `fdopendir`.
    pub fn from_fd(fd: OwnedFd) -> std::io::Result<DirStream> {
        let raw = fd.as_raw_fd();
        let dir = unsafe { libc::fdopendir(raw) };
        let Some(dir) = std::ptr::NonNull::new(dir) else {
            return Err(std::io::Error::last_os_error());
        };
        // The DIR now owns the fd.
        std::mem::forget(fd);
        Ok(DirStream {
            dir,
            fd: raw,
            offset: 0,
        })
    }

    pub fn raw_fd(&self) -> i32 {
        self.fd
    }

    /// Borrow the stream's fd for `*at` calls against it.
    pub fn borrowed_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        // The DIR owns this fd for the stream's whole lifetime.
        unsafe { std::os::fd::BorrowedFd::borrow_raw(self.fd) }
    }

    pub fn seek(&mut self, offset: i64) {
        unsafe { libc::seekdir(self.dir.as_ptr(), offset) };
        self.offset = offset;
    }

    pub fn tell(&self) -> i64 {
        unsafe { libc::telldir(self.dir.as_ptr()) }
    }

    /// Next entry name, None at end of stream.
    pub fn next_entry(&mut self) -> Result<Option<OsString>, i32> {
        use std::os::unix::ffi::OsStringExt;
        loop {
            nix::errno::Errno::clear();
            let entry = unsafe { libc::readdir(self.dir.as_ptr()) };
            if entry.is_null() {
                let errno = nix::errno::Errno::last_raw();
                if errno == 0 {
                    return Ok(None);
                }
                return Err(errno);
            }
            let name = unsafe { std::ffi::CStr::from_ptr((*entry).d_name.as_ptr()) };
            let bytes = name.to_bytes();
            if bytes == b"." || bytes == b".." {
                continue;
            }
            self.offset = self.tell();
            return Ok(Some(OsString::from_vec(bytes.to_vec())));
        }
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        if unsafe { libc::closedir(self.dir.as_ptr()) } != 0 {
            warn!("closedir failed on fd {}", self.fd);
        }
    }
}

/// Resolve a GAH to its file handle, taking a protocol reference.
pub fn find_fh(base: &ServerBase, gah: &Gah) -> Result<Arc<FileHandle>, GahError> {
    let store = base.store.read();
    match store.get_info(gah)? {
        super::Resource::File(handle) => {
            handle.addref();
            Ok(Arc::clone(handle))
        }
        super::Resource::Dir(_) => Err(GahError::InvalidParam),
    }
}

/// Resolve a GAH to its directory handle.
pub fn find_dirh(base: &ServerBase, gah: &Gah) -> Result<Arc<DirHandle>, GahError> {
    let store = base.store.read();
    match store.get_info(gah)? {
        super::Resource::Dir(handle) => Ok(Arc::clone(handle)),
        super::Resource::File(_) => Err(GahError::InvalidParam),
    }
}

/// The intern table of a projection.
pub type InternTable = Mutex<HashMap<InternKey, Arc<FileHandle>>>;

/// Reopen a handle's fd with new flags, through procfs.  This is how an
/// `O_PATH` inode handle becomes a real open without a path walk.
pub fn reopen(fd: &impl AsFd, flags: i32) -> nix::Result<OwnedFd> {
    let path = format!("/proc/self/fd/{}", fd.as_fd().as_raw_fd());
    nix::fcntl::open(
        path.as_str(),
        nix::fcntl::OFlag::from_bits_truncate(flags & !(libc::O_CREAT | libc::O_EXCL)),
        nix::sys::stat::Mode::empty(),
    )
}
