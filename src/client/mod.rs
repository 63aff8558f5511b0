//! Compute-node client.
//!
//! The client service attaches to a server group, queries the projection
//! list, and builds one [`Projection`] per export. Each projection owns
//! its inode table, open-handle maps, transfer-buffer pools and a
//! dedicated progress context, so its I/O is independent of the shared
//! control context the service itself uses for query/detach.

pub mod dispatch;
pub mod handles;
pub mod inode;
pub mod ops;
pub mod request;

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::ctrl::CtrlTree;
use crate::failover::{self, EvictionSink, ServiceGroup};
use crate::gah::Gah;
use crate::pool::Pool;
use crate::proto::wire::{FsInfo, GahIn, QueryOut};
use crate::proto::{FsFlags, OpCode, decode, encode};
use crate::rpc::{
    Completion, CompletionFn, Endpoint, Fabric, RpcContext, RpcStatus,
    progress::ProgressThread, wait_tracker,
};
use crate::stats::ProjectionStats;
use crate::tracker::Tracker;

use handles::{OpenDir, OpenFile, XferBuf};
use inode::{InodeTable, ROOT_INO};

/// Reads at or under this size draw from the page pool.
fn page_threshold() -> usize {
    page_size::get()
}

pub struct Projection {
    pub fs_id: u32,
    root_gah: Mutex<Gah>,
    pub group: Arc<ServiceGroup>,
    pub ctx: Arc<dyn RpcContext>,
    pub poll_interval: Duration,
    pub flags: FsFlags,
    pub max_read: u32,
    pub max_write: u32,
    pub max_iov_read: u32,
    pub max_iov_write: u32,
    pub readdir_size: u32,
    /// Export basename; the mount point is `<prefix>/<mount_dir>`.
    pub mount_dir: OsString,
    pub stats: ProjectionStats,
    offline_reason: AtomicI32,
    pub inodes: InodeTable,
    pub open_files: Mutex<HashMap<u64, Arc<OpenFile>>>,
    pub open_dirs: Mutex<HashMap<u64, Arc<OpenDir>>>,
    next_fh: AtomicU64,
    pub rb_pool_page: Arc<Pool<XferBuf>>,
    pub rb_pool_large: Arc<Pool<XferBuf>>,
    pub wb_pool: Arc<Pool<XferBuf>>,
    progress: Mutex<Option<ProgressThread>>,
}

impl Projection {
    pub fn new(
        group: &Arc<ServiceGroup>,
        info: &FsInfo,
        poll_interval: Duration,
    ) -> Arc<Projection> {
        let ctx = group.fabric.create_context();
        let rb_pool_page = Pool::new("read_page", (Arc::clone(&ctx), page_threshold()));
        let rb_pool_large = Pool::new("read_large", (Arc::clone(&ctx), info.max_read as usize));
        let wb_pool = Pool::new("write", (Arc::clone(&ctx), info.max_write as usize));
        let projection = Arc::new(Projection {
            fs_id: info.id,
            root_gah: Mutex::new(info.gah),
            group: Arc::clone(group),
            ctx: Arc::clone(&ctx),
            poll_interval,
            flags: FsFlags::from_bits_truncate(info.flags),
            max_read: info.max_read,
            max_write: info.max_write,
            max_iov_read: info.max_iov_read,
            max_iov_write: info.max_iov_write,
            readdir_size: info.readdir_size,
            mount_dir: info.dir_name.as_os_str().to_os_string(),
            stats: ProjectionStats::default(),
            offline_reason: AtomicI32::new(0),
            inodes: InodeTable::default(),
            open_files: Mutex::new(HashMap::new()),
            open_dirs: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            rb_pool_page: Arc::clone(&rb_pool_page),
            rb_pool_large: Arc::clone(&rb_pool_large),
            wb_pool: Arc::clone(&wb_pool),
            progress: Mutex::new(None),
        });
        let thread = ProgressThread::start(
            &format!("proj-{}", info.id),
            ctx,
            poll_interval,
            vec![
                rb_pool_page.restocker(),
                rb_pool_large.restocker(),
                wb_pool.restocker(),
            ],
        );
        *projection.progress.lock() = Some(thread);
        info!(
            "projection {} '{}' flags {:?} max_read {} max_iov_read {}",
            info.id,
            projection.mount_dir.to_string_lossy(),
            projection.flags,
            info.max_read,
            info.max_iov_read
        );
        projection
    }

    pub fn root_gah(&self) -> Gah {
        *self.root_gah.lock()
    }

    pub fn is_writeable(&self) -> bool {
        self.flags.contains(FsFlags::WRITEABLE)
    }

    pub fn offline_reason(&self) -> i32 {
        self.offline_reason.load(Ordering::Acquire)
    }

    pub fn set_online(&self) {
        self.offline_reason.store(0, Ordering::Release);
    }

    /// GAH for an inode the kernel names, `None` if unknown.
    pub fn find_gah(&self, ino: u64) -> Option<Gah> {
        if ino == ROOT_INO {
            Some(self.root_gah())
        } else {
            self.inodes.find_gah(ino)
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.group.primary())
    }

    /// Queue a request on the projection context.  Callers check the
    /// offline reason first.  The callback fires exactly once either
    /// way: a send that fails before queuing is completed inline with
    /// `Failed`.
    pub fn send(&self, op: OpCode, payload: Vec<u8>, cb: CompletionFn) -> Result<(), i32> {
        match self.ctx.send_rpc(self.endpoint(), op, payload, cb) {
            Ok(()) => Ok(()),
            Err(failure) => {
                warn!("send of {op:?} failed locally: {}", failure.error);
                (failure.cb)(Completion {
                    status: RpcStatus::Failed,
                    reply: Vec::new(),
                });
                Err(libc::EIO)
            }
        }
    }

    pub fn register_file(&self, file: Arc<OpenFile>) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.open_files.lock().insert(fh, file);
        fh
    }

    pub fn file(&self, fh: u64) -> Option<Arc<OpenFile>> {
        self.open_files.lock().get(&fh).cloned()
    }

    pub fn remove_file(&self, fh: u64) -> Option<Arc<OpenFile>> {
        self.open_files.lock().remove(&fh)
    }

    pub fn register_dir(&self, dir: Arc<OpenDir>) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.open_dirs.lock().insert(fh, dir);
        fh
    }

    pub fn dir(&self, fh: u64) -> Option<Arc<OpenDir>> {
        self.open_dirs.lock().get(&fh).cloned()
    }

    pub fn remove_dir(&self, fh: u64) -> Option<Arc<OpenDir>> {
        self.open_dirs.lock().remove(&fh)
    }

    /// Fire a close for a GAH whose owner is going away; the reply only
    /// signals `done` when provided.
    pub fn send_close(&self, op: OpCode, gah: Gah, done: Option<Arc<Tracker>>) {
        if self.offline_reason() != 0 {
            if let Some(done) = done {
                done.signal();
            }
            return;
        }
        let payload = encode(&GahIn { gah });
        let result = self.send(
            op,
            payload,
            Box::new(move |_| {
                if let Some(done) = done {
                    done.signal();
                }
            }),
        );
        if let Err(errno) = result {
            // The tracker was still signalled by the inline completion.
            debug!("close of {gah} not sent: {errno}");
        }
    }

    /// Release every open handle and inode, stop progress, and tear the
    /// context down once it has drained.
    pub fn teardown(&self) {
        let files: Vec<Arc<OpenFile>> = self.open_files.lock().drain().map(|(_, f)| f).collect();
        let dirs: Vec<Arc<OpenDir>> = self.open_dirs.lock().drain().map(|(_, d)| d).collect();
        let inodes = self.inodes.drain();
        let closes = files.iter().filter(|f| f.is_valid()).count()
            + dirs.iter().filter(|d| d.is_valid()).count()
            + inodes.len();
        if closes > 0 && self.offline_reason() == 0 {
            let done = Arc::new(Tracker::new(closes));
            for file in files.iter().filter(|f| f.is_valid()) {
                self.send_close(OpCode::Close, file.gah(), Some(Arc::clone(&done)));
            }
            for dir in dirs.iter().filter(|d| d.is_valid()) {
                self.send_close(OpCode::Closedir, dir.gah(), Some(Arc::clone(&done)));
            }
            for entry in &inodes {
                self.send_close(OpCode::Close, entry.gah(), Some(Arc::clone(&done)));
            }
            if !done.wait_timeout(Duration::from_secs(5)) {
                warn!(
                    "projection {}: {} closes still outstanding",
                    self.fs_id,
                    done.remaining()
                );
            }
        }
        if let Some(thread) = self.progress.lock().take() {
            thread.stop_and_join();
        }
        for pool in [&self.rb_pool_page, &self.rb_pool_large, &self.wb_pool] {
            pool.reclaim();
        }
        let mut spins = 0u32;
        while self.ctx.destroy().is_err() {
            spins += 1;
            if spins % 100 == 0 {
                warn!(
                    "projection {}: context busy with {} in-flight requests",
                    self.fs_id,
                    self.ctx.in_flight()
                );
            }
            self.ctx.progress(Duration::from_millis(10), None);
        }
    }
}

impl EvictionSink for Projection {
    fn fs_id(&self) -> u32 {
        self.fs_id
    }

    fn has_failover(&self) -> bool {
        self.flags.contains(FsFlags::FAILOVER)
    }

    fn mark_offline(&self, errno: i32) {
        self.offline_reason.store(errno, Ordering::Release);
    }

    fn invalidate_handles(&self) {
        for file in self.open_files.lock().values() {
            file.set_invalid();
        }
        for dir in self.open_dirs.lock().values() {
            dir.set_invalid();
        }
    }
}

/// The whole client side of one service group.
pub struct ClientService {
    pub group: Arc<ServiceGroup>,
    pub ctx: Arc<dyn RpcContext>,
    pub projections: Vec<Arc<Projection>>,
    pub poll_interval: Duration,
    progress: Mutex<Option<ProgressThread>>,
}

#[derive(Debug)]
pub enum AttachError {
    Transport(RpcStatus),
    BadReply,
    Send(i32),
}

impl std::fmt::Display for AttachError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachError::Transport(status) => write!(f, "query failed: {status:?}"),
            AttachError::BadReply => write!(f, "malformed query reply"),
            AttachError::Send(errno) => write!(f, "query not sent: errno {errno}"),
        }
    }
}

impl std::error::Error for AttachError {}

impl ClientService {
    /// Attach to the group's primary rank, query the projection list and
    /// stand up one projection per advertised export.
    pub fn attach(fabric: Arc<dyn Fabric>) -> Result<ClientService, AttachError> {
        let group = ServiceGroup::new(fabric);
        let ctx = group.fabric.create_context();
        let progress = ProgressThread::start(
            "client",
            Arc::clone(&ctx),
            Duration::from_millis(100),
            Vec::new(),
        );

        let reply: Arc<Mutex<Option<Result<(QueryOut, Vec<FsInfo>), AttachError>>>> =
            Arc::new(Mutex::new(None));
        let tracker = Arc::new(Tracker::new(1));
        let reply2 = Arc::clone(&reply);
        let tracker2 = Arc::clone(&tracker);
        ctx.send_rpc(
            Endpoint::new(group.primary()),
            OpCode::QueryPsr,
            Vec::new(),
            Box::new(move |completion| {
                let result = if completion.status != RpcStatus::Ok {
                    Err(AttachError::Transport(completion.status))
                } else {
                    parse_query(&completion.reply).ok_or(AttachError::BadReply)
                };
                *reply2.lock() = Some(result);
                tracker2.signal();
            }),
        )
        .map_err(|failure| {
            warn!("query not sent: {}", failure.error);
            (failure.cb)(Completion {
                status: RpcStatus::Failed,
                reply: Vec::new(),
            });
            AttachError::Send(libc::EIO)
        })?;
        wait_tracker(&ctx, true, Duration::from_millis(100), &tracker);

        let (query, list) = match reply.lock().take() {
            Some(Ok(parsed)) => parsed,
            Some(Err(err)) => return Err(err),
            None => return Err(AttachError::BadReply),
        };
        let poll_interval = Duration::from_millis(query.poll_interval.max(1) as u64);
        info!(
            "attached to {}: {} projections, poll {}ms",
            group.name(),
            query.count,
            query.poll_interval
        );

        let projections: Vec<Arc<Projection>> = list
            .iter()
            .map(|info| Projection::new(&group, info, poll_interval))
            .collect();

        // Eviction updates re-target the group before per-request
        // callbacks observe the failure.
        let sinks: Vec<Arc<dyn EvictionSink>> = projections
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn EvictionSink>)
            .collect();
        let group2 = Arc::clone(&group);
        group.fabric.register_eviction_cb(
            &ctx,
            Box::new(move |_, rank| {
                failover::eviction_update(&group2, rank, &sinks);
            }),
        );

        Ok(ClientService {
            group,
            ctx,
            projections,
            poll_interval,
            progress: Mutex::new(Some(progress)),
        })
    }

    pub fn projection(&self, fs_id: u32) -> Option<Arc<Projection>> {
        self.projections.get(fs_id as usize).cloned()
    }

    /// Detach from the group and tear everything down.
    pub fn detach(&self) {
        for projection in &self.projections {
            projection.teardown();
        }
        let tracker = Arc::new(Tracker::new(1));
        let tracker2 = Arc::clone(&tracker);
        let sent = self.ctx.send_rpc(
            Endpoint::new(self.group.primary()),
            OpCode::Detach,
            Vec::new(),
            Box::new(move |_| tracker2.signal()),
        );
        match sent {
            Ok(()) => {
                if !tracker.wait_timeout(Duration::from_secs(5)) {
                    warn!("detach reply not received");
                }
            }
            Err(failure) => {
                warn!("detach not sent: {}", failure.error);
                (failure.cb)(Completion {
                    status: RpcStatus::Failed,
                    reply: Vec::new(),
                });
            }
        }
        if let Some(thread) = self.progress.lock().take() {
            thread.stop_and_join();
        }
        while self.ctx.destroy().is_err() {
            self.ctx.progress(Duration::from_millis(10), None);
        }
    }

    /// Populate the control tree with the layout the tools expect.
    pub fn register_ctrl(
        &self,
        tree: &Arc<CtrlTree>,
        on_shutdown: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<(), i32> {
        let root = tree.root();

        let shutdown_cb = Arc::clone(&on_shutdown);
        tree.register_event(&root, "shutdown", Box::new(move || shutdown_cb()))?;
        tree.register_event(
            &root,
            "dump_log",
            Box::new(|| log::logger().flush()),
        )?;

        // Attached-client tracker: every open reads a fresh count.
        let attached = Arc::new(std::sync::atomic::AtomicI64::new(0));
        let attached2 = Arc::clone(&attached);
        let attached3 = Arc::clone(&attached);
        tree.register_tracker(
            &root,
            "client",
            Box::new(move || attached2.fetch_add(1, Ordering::SeqCst) + 1),
            Some(Box::new(move |value| {
                debug!("ctrl client tracker close (open #{value})");
                attached3.fetch_sub(1, Ordering::SeqCst);
            })),
        )?;

        let iof = tree.create_subdir(&root, "iof")?;
        tree.register_constant_u64(&iof, "ionss_count", 1)?;
        tree.register_constant_u64(
            &iof,
            "ioctl_version",
            crate::proto::wire::GAH_INFO_VERSION as u64,
        )?;

        let ionss = tree.create_subdir(&iof, "ionss")?;
        let group_dir = tree.create_subdir(&ionss, self.group.name())?;
        tree.register_constant_u64(&group_dir, "psr_rank", self.group.primary() as u64)?;
        tree.register_constant_u64(&group_dir, "psr_tag", 0)?;
        tree.register_constant(&group_dir, "name", self.group.name())?;

        let projections_dir = tree.create_subdir(&iof, "projections")?;
        for projection in &self.projections {
            let dir = tree.create_subdir(&projections_dir, &projection.fs_id.to_string())?;
            tree.register_constant(
                &dir,
                "mount_point",
                &projection.mount_dir.to_string_lossy(),
            )?;
            let mode = if projection.is_writeable() { "rw" } else { "ro" };
            tree.register_constant(&dir, "mode", mode)?;
            tree.register_constant_u64(&dir, "fs_id", projection.fs_id as u64)?;
            tree.register_constant(&dir, "group_id", self.group.name())?;
            tree.register_constant(&dir, "fs_type", "remote")?;
            tree.register_constant_u64(&dir, "max_read", projection.max_read as u64)?;
            tree.register_constant_u64(&dir, "max_iov_read", projection.max_iov_read as u64)?;
            tree.register_constant_u64(&dir, "max_write", projection.max_write as u64)?;
            tree.register_constant_u64(&dir, "max_iov_write", projection.max_iov_write as u64)?;
            tree.register_constant_u64(&dir, "readdir_size", projection.readdir_size as u64)?;

            let proj_read = Arc::clone(projection);
            let proj_write = Arc::clone(projection);
            tree.register_variable(
                &dir,
                "online",
                Some(Box::new(move || {
                    if proj_read.offline_reason() == 0 { "1" } else { "0" }.to_string()
                })),
                Some(Box::new(move |text| match text.trim() {
                    "0" => {
                        proj_write.mark_offline(libc::EHOSTDOWN);
                        Ok(())
                    }
                    "1" => {
                        proj_write.set_online();
                        Ok(())
                    }
                    _ => Err(libc::EINVAL),
                })),
            )?;

            let stats_dir = tree.create_subdir(&dir, "stats")?;
            for (name, _) in projection.stats.entries() {
                // The closure owns a projection reference, which keeps
                // the counter alive for the lifetime of the node.
                let counter_owner = Arc::clone(projection);
                tree.register_variable(
                    &stats_dir,
                    name,
                    Some(Box::new(move || {
                        counter_owner
                            .stats
                            .entries()
                            .iter()
                            .find(|(n, _)| *n == name)
                            .map(|(_, c)| c.get().to_string())
                            .unwrap_or_default()
                    })),
                    None,
                )?;
            }
        }
        Ok(())
    }
}

fn parse_query(payload: &[u8]) -> Option<(QueryOut, Vec<FsInfo>)> {
    let (header, mut tail) = decode::<QueryOut>(payload).ok()?;
    let mut list = Vec::with_capacity(header.count as usize);
    for _ in 0..header.count {
        let (info, rest) = decode::<FsInfo>(tail).ok()?;
        list.push(info);
        tail = rest;
    }
    Some((header, list))
}
