//! Client-side open handles and transfer buffers.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::gah::Gah;
use crate::pool::Poolable;
use crate::proto::wire::BulkId;
use crate::rpc::{BulkBuf, RpcContext};

/// An open file as FUSE sees it.  `gah_ok` is cleared the moment the
/// server rejects the handle or the rank is evicted, so later operations
/// fail locally instead of targeting a dead peer.
pub struct OpenFile {
    gah: Mutex<Gah>,
    gah_ok: AtomicBool,
    pub ino: u64,
}

impl OpenFile {
    pub fn new(gah: Gah, ino: u64) -> Arc<OpenFile> {
        Arc::new(OpenFile {
            gah: Mutex::new(gah),
            gah_ok: AtomicBool::new(true),
            ino,
        })
    }

    pub fn gah(&self) -> Gah {
        *self.gah.lock()
    }

    pub fn is_valid(&self) -> bool {
        self.gah_ok.load(Ordering::Acquire)
    }

    pub fn set_invalid(&self) {
        self.gah_ok.store(false, Ordering::Release);
    }
}

/// One directory entry as cached on the client between readdir RPCs.
#[derive(Debug, Clone)]
pub struct ClientDirent {
    pub ino: u64,
    pub mode: u32,
    pub name: OsString,
    /// Server cursor to resume after this entry.
    pub nextoff: i64,
}

#[derive(Default)]
pub struct DirState {
    /// Entries received but not yet handed to the kernel.
    pub entries: VecDeque<ClientDirent>,
    /// Server-side cursor for the next batch RPC.
    pub cursor: u64,
    /// Server signalled end-of-stream.
    pub last: bool,
    /// Cleared on a hard error; no further reads are attempted.
    pub valid: bool,
    /// Number of batch RPCs issued, visible to tests.
    pub rpcs: u64,
}

/// An open directory: GAH, pinned reply buffer and the reply-batch
/// cursor state.
pub struct OpenDir {
    gah: Mutex<Gah>,
    gah_ok: AtomicBool,
    pub ino: u64,
    pub buf: BulkBuf,
    pub bulk_id: BulkId,
    pub state: Mutex<DirState>,
    ctx: Arc<dyn RpcContext>,
}

impl OpenDir {
    pub fn new(
        ctx: &Arc<dyn RpcContext>,
        gah: Gah,
        ino: u64,
        readdir_size: usize,
    ) -> Arc<OpenDir> {
        let buf: BulkBuf = Arc::new(Mutex::new(vec![0u8; readdir_size]));
        let bulk_id = ctx.bulk_register(Arc::clone(&buf));
        Arc::new(OpenDir {
            gah: Mutex::new(gah),
            gah_ok: AtomicBool::new(true),
            ino,
            buf,
            bulk_id,
            state: Mutex::new(DirState {
                valid: true,
                ..DirState::default()
            }),
            ctx: Arc::clone(ctx),
        })
    }

    pub fn gah(&self) -> Gah {
        *self.gah.lock()
    }

    pub fn is_valid(&self) -> bool {
        self.gah_ok.load(Ordering::Acquire)
    }

    pub fn set_invalid(&self) {
        self.gah_ok.store(false, Ordering::Release);
    }
}

impl Drop for OpenDir {
    fn drop(&mut self) {
        self.ctx.bulk_deregister(self.bulk_id);
    }
}

/// A pooled transfer buffer, registered for bulk once at creation and
/// reused across requests.  Backs both the read pools and the write
/// pool.
pub struct XferBuf {
    pub buf: BulkBuf,
    pub bulk_id: BulkId,
    ctx: Arc<dyn RpcContext>,
}

impl Poolable for XferBuf {
    /// Context to register with, and the buffer size.
    type Seed = (Arc<dyn RpcContext>, usize);

    fn create(seed: &Self::Seed) -> Option<Self> {
        let (ctx, size) = seed;
        let buf: BulkBuf = Arc::new(Mutex::new(vec![0u8; *size]));
        let bulk_id = ctx.bulk_register(Arc::clone(&buf));
        Some(XferBuf {
            buf,
            bulk_id,
            ctx: Arc::clone(ctx),
        })
    }
}

impl Drop for XferBuf {
    fn drop(&mut self) {
        self.ctx.bulk_deregister(self.bulk_id);
    }
}
