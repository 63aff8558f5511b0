//! I/O node service.
//!
//! One server rank exports a set of directories as projections. Each
//! projection owns its root `O_PATH` descriptor, the intern table of
//! open handles and a bounded-concurrency read engine. The base ties the
//! projections to the GAH store, counts attached clients and coordinates
//! group-wide shutdown when the last one detaches.

pub mod handle;
pub mod handlers;
pub mod read;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::gah::GahStore;
use crate::pool::Pool;
use crate::proto::wire::{FsInfo, WireName};
use crate::proto::{FsFlags, OpCode};
use crate::rpc::{Fabric, Rank, RpcContext, RpcStatus};

use handle::{DirHandle, FileHandle, InternTable};
use read::{ActiveRead, ReadEngine};

/// What a GAH slot points at on this server.
#[derive(Clone)]
pub enum Resource {
    File(Arc<FileHandle>),
    Dir(Arc<DirHandle>),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub poll_interval: Duration,
    pub max_read: u32,
    pub max_write: u32,
    pub readdir_size: u32,
    pub max_iov_read: u32,
    pub max_iov_write: u32,
    /// Concurrent reads per projection.
    pub max_read_count: usize,
    pub progress_cb: bool,
    pub writeable: bool,
    pub failover: bool,
    /// Advertise the threaded kernel session to clients.
    pub cnss_threads: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            poll_interval: Duration::from_millis(100),
            max_read: 1024 * 1024,
            max_write: 1024 * 1024,
            readdir_size: 64 * 1024,
            max_iov_read: 64,
            max_iov_write: 64,
            max_read_count: 3,
            progress_cb: true,
            writeable: true,
            failover: true,
            cnss_threads: false,
        }
    }
}

impl ServerConfig {
    pub fn fs_flags(&self) -> FsFlags {
        let mut flags = FsFlags::empty();
        if self.writeable {
            flags |= FsFlags::WRITEABLE;
        }
        if self.failover {
            flags |= FsFlags::FAILOVER;
        }
        if self.cnss_threads {
            flags |= FsFlags::CNSS_MT;
        }
        flags
    }
}

/// One exported directory.
pub struct ServerProjection {
    pub id: u32,
    pub export_path: PathBuf,
    pub fs_type: String,
    /// Device number of the export root, for cross-mount detection.
    pub dev_no: u64,
    pub flags: FsFlags,
    pub intern: InternTable,
    root: std::sync::OnceLock<Arc<FileHandle>>,
    pub read_engine: Mutex<ReadEngine>,
    pub max_read_count: usize,
    pub ar_pool: Arc<Pool<ActiveRead>>,
}

impl ServerProjection {
    pub fn root(&self) -> &Arc<FileHandle> {
        self.root.get().expect("projection root published")
    }

    pub fn is_writeable(&self) -> bool {
        self.flags.contains(FsFlags::WRITEABLE)
    }
}

pub struct ServerBase {
    pub store: RwLock<GahStore<Resource>>,
    projections: RwLock<Vec<Arc<ServerProjection>>>,
    pub rank: Rank,
    pub fabric: Arc<dyn Fabric>,
    pub config: ServerConfig,
    client_count: AtomicU32,
    shutdown: AtomicBool,
}

impl ServerBase {
    pub fn new(fabric: Arc<dyn Fabric>, rank: Rank, config: ServerConfig) -> Arc<ServerBase> {
        Arc::new(ServerBase {
            store: RwLock::new(GahStore::new()),
            projections: RwLock::new(Vec::new()),
            rank,
            fabric,
            config,
            client_count: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Export `path` as the next projection.
    pub fn add_export(self: &Arc<Self>, path: &Path) -> std::io::Result<Arc<ServerProjection>> {
        use nix::fcntl::OFlag;
        use nix::sys::stat::Mode;

        let mut oflags = OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_NOATIME;
        let fd = match nix::fcntl::open(path, oflags, Mode::empty()) {
            Ok(fd) => fd,
            Err(nix::errno::Errno::EPERM) => {
                // O_NOATIME needs ownership of the tree; retry without.
                oflags.remove(OFlag::O_NOATIME);
                nix::fcntl::open(path, oflags, Mode::empty())?
            }
            Err(err) => return Err(err.into()),
        };
        let st = nix::sys::stat::fstat(&fd)?;

        let id = self.projections.read().len() as u32;
        let projection = Arc::new(ServerProjection {
            id,
            export_path: path.to_path_buf(),
            fs_type: detect_fs_type(path),
            dev_no: st.st_dev,
            flags: self.config.fs_flags(),
            intern: InternTable::default(),
            root: std::sync::OnceLock::new(),
            read_engine: Mutex::new(ReadEngine::default()),
            max_read_count: self.config.max_read_count,
            ar_pool: Pool::new("active_read", self.config.max_read as usize),
        });
        let root = FileHandle::publish_root(self, &projection, fd, st.st_ino);
        projection
            .root
            .set(root)
            .unwrap_or_else(|_| unreachable!("root published once"));
        info!(
            "projection {id}: {} ({}) dev {} gah {}",
            path.display(),
            projection.fs_type,
            st.st_dev,
            projection.root().gah()
        );
        self.projections.write().push(Arc::clone(&projection));
        Ok(projection)
    }

    pub fn projections(&self) -> Vec<Arc<ServerProjection>> {
        self.projections.read().clone()
    }

    pub fn projection(&self, id: u32) -> Option<Arc<ServerProjection>> {
        self.projections.read().get(id as usize).cloned()
    }

    /// The list advertised to clients in the query reply.
    pub fn fs_info_list(&self) -> Vec<FsInfo> {
        self.projections
            .read()
            .iter()
            .map(|p| {
                let name = p
                    .export_path
                    .file_name()
                    .and_then(WireName::new)
                    .unwrap_or(WireName::EMPTY);
                FsInfo {
                    dir_name: name,
                    gah: p.root().gah(),
                    flags: p.flags.bits(),
                    max_read: self.config.max_read,
                    max_write: self.config.max_write,
                    readdir_size: self.config.readdir_size,
                    max_iov_read: self.config.max_iov_read,
                    max_iov_write: self.config.max_iov_write,
                    id: p.id,
                }
            })
            .collect()
    }

    pub fn attach_client(&self) -> u32 {
        let now = self.client_count.fetch_add(1, Ordering::AcqRel) + 1;
        info!("client attached ({now} total)");
        now
    }

    pub fn clients(&self) -> u32 {
        self.client_count.load(Ordering::Acquire)
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn set_shutdown(&self) {
        debug!("shutting down rank {}", self.rank);
        self.shutdown.store(true, Ordering::Release);
    }

    /// Handle one detach: at zero attached clients the whole group stops,
    /// which needs a broadcast when peers exist.
    pub fn detach_client(self: &Arc<Self>, ctx: &Arc<dyn RpcContext>) {
        let prev = self.client_count.load(Ordering::Acquire);
        let remaining = if prev == 0 {
            warn!("detach with no attached clients");
            0
        } else {
            self.client_count.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
        };
        debug!("client detached ({remaining} remain)");
        if remaining > 0 {
            return;
        }
        info!("last client detached from rank {}", self.rank);
        if self.fabric.live_ranks().len() <= 1 {
            self.set_shutdown();
            return;
        }
        shutdown_broadcast(self, ctx);
    }
}

/// Broadcast shutdown to the other ranks, retrying on failure; the local
/// flag flips only once the broadcast has been delivered.
fn shutdown_broadcast(base: &Arc<ServerBase>, ctx: &Arc<dyn RpcContext>) {
    let base2 = Arc::clone(base);
    let ctx2 = Arc::clone(ctx);
    let result = base.fabric.broadcast(
        ctx,
        base.rank,
        OpCode::Shutdown,
        Vec::new(),
        Box::new(move |completion| {
            if completion.status == RpcStatus::Ok {
                base2.set_shutdown();
            } else {
                warn!("shutdown broadcast failed: {:?}", completion.status);
                shutdown_broadcast(&base2, &ctx2);
            }
        }),
    );
    if let Err(err) = result {
        error!("could not issue shutdown broadcast: {err}");
        base.set_shutdown();
    }
}

/// Wire a server rank onto the fabric: context, handler table, binding.
pub fn start_server(
    base: &Arc<ServerBase>,
) -> Arc<dyn RpcContext> {
    let ctx = base.fabric.create_context();
    ctx.set_handlers(handlers::build_table(base));
    base.fabric.bind_rank(base.rank, &ctx);
    ctx
}

/// Longest mount-point prefix match over the mount table.
fn detect_fs_type(path: &Path) -> String {
    let Ok(mounts) = std::fs::read_to_string("/proc/self/mounts") else {
        return "unknown".to_string();
    };
    let mut best: Option<(usize, &str)> = None;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_dev), Some(mnt), Some(fstype)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if path.starts_with(mnt) {
            let score = mnt.len();
            if best.map(|(s, _)| score > s).unwrap_or(true) {
                best = Some((score, fstype));
            }
        }
    }
    best.map(|(_, t)| t.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::loopback::LoopbackFabric;

    #[test]
    fn export_and_query_list() {
        let dir = tempfile::tempdir().unwrap();
        let fabric = LoopbackFabric::new("ion");
        let base = ServerBase::new(fabric, 0, ServerConfig::default());
        let projection = base.add_export(dir.path()).unwrap();
        assert_eq!(projection.id, 0);
        assert!(!projection.root().gah().is_null());

        let list = base.fs_info_list();
        assert_eq!(list.len(), 1);
        assert_eq!(
            list[0].dir_name.as_os_str(),
            dir.path().file_name().unwrap()
        );
        assert!(FsFlags::from_bits_truncate(list[0].flags).contains(FsFlags::WRITEABLE));
    }

    #[test]
    fn intern_table_shares_handles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"data").unwrap();
        let fabric = LoopbackFabric::new("ion");
        let base = ServerBase::new(fabric, 0, ServerConfig::default());
        let projection = base.add_export(dir.path()).unwrap();

        let open = |base: &Arc<ServerBase>| {
            let fd = nix::fcntl::openat(
                &projection.root().fd,
                "f",
                nix::fcntl::OFlag::O_RDONLY,
                nix::sys::stat::Mode::empty(),
            )
            .unwrap();
            let st = nix::sys::stat::fstat(&fd).unwrap();
            FileHandle::publish(
                base,
                &projection,
                fd,
                st.st_ino,
                libc::O_RDONLY,
                handle::HandleKind::Open,
            )
        };

        let first = open(&base);
        let second = open(&base);
        // One entry for (ino, flags), refcount equal to the two opens.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.gah(), second.gah());
        assert_eq!(first.refs(), 2);
        assert_eq!(projection.intern.lock().len(), 1);

        // Two matching closes drop the handle entirely.
        first.decref(&base, 1);
        assert_eq!(projection.intern.lock().len(), 1);
        second.decref(&base, 1);
        assert_eq!(projection.intern.lock().len(), 0);
        assert!(base.store.read().get_info(&first.gah()).is_err());
    }
}
