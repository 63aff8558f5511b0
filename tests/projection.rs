//! End-to-end tests over the loopback fabric.
//!
//! Each test stands up real server ranks exporting a scratch directory
//! and drives the client operation core against them, exactly as the
//! FUSE dispatcher would, minus the kernel.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use projfs::client::{ClientService, Projection, ops};
use projfs::ctrl::{CtrlTree, NodeKind};
use projfs::proto::wire::{ReadxIn, ReadxOut, Xtvec};
use projfs::proto::{OpCode, decode};
use projfs::rpc::loopback::LoopbackFabric;
use projfs::rpc::progress::ProgressThread;
use projfs::rpc::{BulkBuf, Fabric, Replier, RpcContext};
use projfs::server::handle::{FileHandle, HandleKind};
use projfs::server::read::{PendingRead, submit};
use projfs::server::{ServerBase, ServerConfig, start_server};

struct Harness {
    fabric: Arc<LoopbackFabric>,
    bases: Vec<Arc<ServerBase>>,
    threads: Vec<ProgressThread>,
    service: ClientService,
    export: tempfile::TempDir,
}

impl Harness {
    fn start(config: ServerConfig, ranks: u32, populate: impl Fn(&Path)) -> Harness {
        let export = tempfile::tempdir().unwrap();
        populate(export.path());
        let fabric = LoopbackFabric::new("test-group");
        let mut bases = Vec::new();
        let mut threads = Vec::new();
        for rank in 0..ranks {
            let base = ServerBase::new(fabric.clone(), rank, config.clone());
            base.add_export(export.path()).unwrap();
            let ctx = start_server(&base);
            threads.push(ProgressThread::start(
                &format!("srv-{rank}"),
                ctx,
                Duration::from_millis(5),
                Vec::new(),
            ));
            bases.push(base);
        }
        let service = ClientService::attach(fabric.clone()).expect("attach");
        Harness {
            fabric,
            bases,
            threads,
            service,
            export,
        }
    }

    fn projection(&self) -> Arc<Projection> {
        self.service.projection(0).expect("projection 0")
    }

    fn stop(self) {
        self.service.detach();
        for thread in self.threads {
            thread.stop_and_join();
        }
    }
}

/// Run one client operation to completion.
fn op<T: Send + 'static>(f: impl FnOnce(ops::OpReply<T>)) -> Result<T, i32> {
    let (tx, rx) = mpsc::channel();
    f(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.recv_timeout(Duration::from_secs(5)).expect("operation completed")
}

#[test]
fn lookup_open_read_with_stats() {
    let harness = Harness::start(ServerConfig::default(), 1, |path| {
        std::fs::write(path.join("hello"), b"hi\n").unwrap();
    });
    let proj = harness.projection();

    let entry = op(|reply| ops::lookup(&proj, 1, OsStr::new("hello"), reply)).unwrap();
    assert_eq!(entry.attr.size, 3);
    assert_eq!(entry.attr.kind, fuser::FileType::RegularFile);

    let fh = op(|reply| ops::open(&proj, entry.attr.ino, libc::O_RDONLY, reply)).unwrap();
    let data = op(|reply| ops::read(&proj, fh, 0, 4096, reply)).unwrap();
    assert_eq!(data, b"hi\n");
    assert_eq!(proj.stats.read.get(), 1);
    assert_eq!(proj.stats.read_bytes.get(), 3);

    ops::release(&proj, fh);
    harness.stop();
}

#[test]
fn large_read_goes_over_bulk() {
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let harness = Harness::start(ServerConfig::default(), 1, move |path| {
        std::fs::write(path.join("big"), &payload).unwrap();
    });
    let proj = harness.projection();

    let entry = op(|reply| ops::lookup(&proj, 1, OsStr::new("big"), reply)).unwrap();
    let fh = op(|reply| ops::open(&proj, entry.attr.ino, libc::O_RDONLY, reply)).unwrap();

    // Well above the inline threshold and the page pool.
    let data = op(|reply| ops::read(&proj, fh, 0, 100_000, reply)).unwrap();
    assert_eq!(data, expected);
    assert_eq!(proj.stats.read_bytes.get(), 100_000);

    // Offset reads come back exact.
    let tail = op(|reply| ops::read(&proj, fh, 99_000, 4096, reply)).unwrap();
    assert_eq!(tail, &expected[99_000..]);

    ops::release(&proj, fh);
    harness.stop();
}

#[test]
fn create_write_fsync_readback() {
    let harness = Harness::start(ServerConfig::default(), 1, |_| {});
    let proj = harness.projection();

    let (entry, fh) = op(|reply| {
        ops::create(&proj, 1, OsStr::new("out.dat"), 0o644, libc::O_WRONLY, reply)
    })
    .unwrap();
    assert_eq!(entry.attr.size, 0);

    // Inline write below the iov threshold.
    let written = op(|reply| ops::write(&proj, fh, 0, b"hello world", reply)).unwrap();
    assert_eq!(written, 11);

    // Bulk write above it.
    let big: Vec<u8> = vec![0xa5; 8192];
    let written = op(|reply| ops::write(&proj, fh, 11, &big, reply)).unwrap();
    assert_eq!(written, 8192);
    assert_eq!(proj.stats.write_bytes.get(), 11 + 8192);

    op(|reply| ops::fsync(&proj, fh, false, reply)).unwrap();
    ops::release(&proj, fh);

    let on_disk = std::fs::read(harness.export.path().join("out.dat")).unwrap();
    assert_eq!(on_disk.len(), 11 + 8192);
    assert_eq!(&on_disk[..11], b"hello world");
    assert!(on_disk[11..].iter().all(|b| *b == 0xa5));
    harness.stop();
}

#[test]
fn namespace_operations() {
    let harness = Harness::start(ServerConfig::default(), 1, |path| {
        std::fs::write(path.join("victim"), b"x").unwrap();
    });
    let proj = harness.projection();

    let dir = op(|reply| ops::mkdir(&proj, 1, OsStr::new("sub"), 0o755, reply)).unwrap();
    assert_eq!(dir.attr.kind, fuser::FileType::Directory);

    let link = op(|reply| {
        ops::symlink(&proj, 1, OsStr::new("link"), OsStr::new("victim"), reply)
    })
    .unwrap();
    assert_eq!(link.attr.kind, fuser::FileType::Symlink);
    let target = op(|reply| ops::readlink(&proj, link.attr.ino, reply)).unwrap();
    assert_eq!(target, b"victim");

    op(|reply| {
        ops::rename(
            &proj,
            1,
            OsStr::new("victim"),
            dir.attr.ino,
            OsStr::new("moved"),
            0,
            reply,
        )
    })
    .unwrap();
    assert!(harness.export.path().join("sub/moved").exists());

    op(|reply| ops::unlink(&proj, dir.attr.ino, OsStr::new("moved"), reply)).unwrap();
    op(|reply| ops::unlink(&proj, 1, OsStr::new("link"), reply)).unwrap();
    op(|reply| ops::rmdir(&proj, 1, OsStr::new("sub"), reply)).unwrap();
    assert!(!harness.export.path().join("sub").exists());

    let vfs = op(|reply| ops::statfs(&proj, 1, reply)).unwrap();
    assert!(vfs.bsize > 0);
    harness.stop();
}

#[test]
fn stale_gah_after_server_restart() {
    let harness = Harness::start(ServerConfig::default(), 1, |path| {
        std::fs::write(path.join("hello"), b"hi\n").unwrap();
    });
    let proj = harness.projection();

    let entry = op(|reply| ops::lookup(&proj, 1, OsStr::new("hello"), reply)).unwrap();
    let fh = op(|reply| ops::open(&proj, entry.attr.ino, libc::O_RDONLY, reply)).unwrap();
    assert_eq!(
        op(|reply| ops::read(&proj, fh, 0, 4096, reply)).unwrap(),
        b"hi\n"
    );

    // Server restart: a fresh base takes over rank 0 with an empty store.
    let base = ServerBase::new(harness.fabric.clone(), 0, ServerConfig::default());
    base.add_export(harness.export.path()).unwrap();
    let ctx = start_server(&base);
    let _thread = ProgressThread::start("srv-restart", ctx, Duration::from_millis(5), Vec::new());

    // First read is rejected by GAH validation and invalidates the
    // handle; the second fails locally without an RPC.
    assert_eq!(op(|reply| ops::read(&proj, fh, 0, 4096, reply)), Err(libc::EIO));
    assert_eq!(op(|reply| ops::read(&proj, fh, 0, 4096, reply)), Err(libc::EIO));

    // Administrative offline/online through the control variable.
    let tree = CtrlTree::new();
    harness
        .service
        .register_ctrl(&tree, Arc::new(|| {}))
        .unwrap();
    let online = tree.find_path_node("/iof/projections/0/online").unwrap();
    let NodeKind::Variable {
        read: Some(read),
        write: Some(write),
    } = &online.kind
    else {
        panic!("online should be a read-write variable");
    };
    assert_eq!(read(), "1");
    write("0").unwrap();
    assert_eq!(read(), "0");
    assert_eq!(proj.offline_reason(), libc::EHOSTDOWN);
    assert_eq!(
        op(|reply| ops::getattr(&proj, 1, None, reply)),
        Err(libc::EHOSTDOWN)
    );
    write("1").unwrap();
    assert_eq!(read(), "1");
    // Back online, but the stale file handle stays dead.
    assert_eq!(op(|reply| ops::read(&proj, fh, 0, 4096, reply)), Err(libc::EIO));
    harness.stop();
}

#[test]
fn eviction_invalidates_handles_and_retargets() {
    let harness = Harness::start(ServerConfig::default(), 2, |path| {
        std::fs::write(path.join("hello"), b"hi\n").unwrap();
    });
    let proj = harness.projection();
    assert_eq!(proj.group.primary(), 0);

    let entry = op(|reply| ops::lookup(&proj, 1, OsStr::new("hello"), reply)).unwrap();
    let fh = op(|reply| ops::open(&proj, entry.attr.ino, libc::O_RDONLY, reply)).unwrap();

    harness.fabric.evict(0);
    let deadline = Instant::now() + Duration::from_secs(2);
    while proj.group.primary() != 1 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(proj.group.primary(), 1);
    assert_eq!(proj.offline_reason(), 0);

    // The open handle was invalidated rather than silently re-targeted.
    assert_eq!(op(|reply| ops::read(&proj, fh, 0, 4096, reply)), Err(libc::EIO));

    // Fresh lookups go to the new primary (rank 1 owns its own GAHs).
    let entry = op(|reply| ops::lookup(&proj, 1, OsStr::new("hello"), reply)).unwrap();
    let fh = op(|reply| ops::open(&proj, entry.attr.ino, libc::O_RDONLY, reply)).unwrap();
    assert_eq!(
        op(|reply| ops::read(&proj, fh, 0, 4096, reply)).unwrap(),
        b"hi\n"
    );
    harness.stop();
}

#[test]
fn read_concurrency_is_capped() {
    let config = ServerConfig {
        max_read_count: 2,
        max_iov_read: 0, // force the bulk path so completions defer
        ..ServerConfig::default()
    };
    let export = tempfile::tempdir().unwrap();
    std::fs::write(export.path().join("data"), vec![7u8; 4096]).unwrap();

    let fabric = LoopbackFabric::new("cap");
    let base = ServerBase::new(fabric.clone(), 0, config);
    let projection = base.add_export(export.path()).unwrap();
    let server_ctx = fabric.create_context();
    let client_ctx = fabric.create_context();

    let fd = nix::fcntl::open(
        &export.path().join("data"),
        nix::fcntl::OFlag::O_RDONLY,
        nix::sys::stat::Mode::empty(),
    )
    .unwrap();
    let st = nix::sys::stat::fstat(&fd).unwrap();
    let handle = FileHandle::publish(
        &base,
        &projection,
        fd,
        st.st_ino,
        libc::O_RDONLY,
        HandleKind::Open,
    );

    let replies: Arc<Mutex<Vec<ReadxOut>>> = Arc::new(Mutex::new(Vec::new()));
    let mut bufs = Vec::new();
    for _ in 0..3 {
        let buf: BulkBuf = Arc::new(Mutex::new(vec![0u8; 4096]));
        let bulk_id = client_ctx.bulk_register(Arc::clone(&buf));
        bufs.push(buf);

        handle.addref();
        let replies2 = Arc::clone(&replies);
        let replier = Replier::new(
            OpCode::Readx,
            Box::new(move |payload| {
                let (out, _) = decode::<ReadxOut>(&payload).unwrap();
                replies2.lock().push(out);
            }),
        );
        submit(
            &base,
            PendingRead {
                handle: Arc::clone(&handle),
                req: ReadxIn {
                    gah: handle.gah(),
                    xtvec: Xtvec { off: 0, len: 4096 },
                    xtvec_len: 0,
                    bulk_len: 0,
                    xtvec_bulk: 0,
                    data_bulk: bulk_id,
                },
                replier,
                ctx: Arc::clone(&server_ctx),
            },
        );
    }

    // Two reads hold the only slots; the third waits in arrival order.
    {
        let engine = projection.read_engine.lock();
        assert_eq!(engine.active, 2);
        assert_eq!(engine.pending.len(), 1);
    }

    // Drive bulk completions; every read finishes and the slots drain.
    let deadline = Instant::now() + Duration::from_secs(2);
    while replies.lock().len() < 3 && Instant::now() < deadline {
        server_ctx.progress(Duration::from_millis(10), None);
    }
    let replies = replies.lock();
    assert_eq!(replies.len(), 3);
    for out in replies.iter() {
        assert_eq!(out.err, 0);
        assert_eq!(out.rc, 0);
        assert_eq!(out.bulk_len, 4096);
    }
    for buf in &bufs {
        assert!(buf.lock().iter().all(|b| *b == 7));
    }
    let engine = projection.read_engine.lock();
    assert_eq!(engine.active, 0);
    assert!(engine.pending.is_empty());
}

#[test]
fn readdir_paginates_over_bulk() {
    let config = ServerConfig {
        readdir_size: 1024,
        ..ServerConfig::default()
    };
    let harness = Harness::start(config, 1, |path| {
        for i in 0..300 {
            std::fs::write(path.join(format!("f{i:03}")), b"").unwrap();
        }
    });
    let proj = harness.projection();

    let fh = op(|reply| ops::opendir(&proj, 1, reply)).unwrap();
    let mut names = Vec::new();
    let mut offset = 0i64;
    loop {
        let (batch, last) = op(|reply| ops::readdir(&proj, fh, offset, reply)).unwrap();
        if batch.is_empty() {
            assert!(last);
            break;
        }
        offset = batch.last().unwrap().nextoff;
        names.extend(batch.iter().map(|e| e.name.to_string_lossy().into_owned()));
        ops::readdir_consume(&proj, fh, batch.len());
        if last && proj.dir(fh).unwrap().state.lock().entries.is_empty() {
            break;
        }
    }

    names.sort();
    names.dedup();
    assert_eq!(names.len(), 300, "every entry exactly once");

    // 1024-byte batches hold two wire entries each: 150 full batches
    // plus the final empty one that reports end-of-stream.
    let rpcs = proj.dir(fh).unwrap().state.lock().rpcs;
    assert_eq!(rpcs, 151);

    ops::releasedir(&proj, fh);
    harness.stop();
}

#[test]
fn read_only_export_rejects_writes() {
    let config = ServerConfig {
        writeable: false,
        ..ServerConfig::default()
    };
    let harness = Harness::start(config, 1, |path| {
        std::fs::write(path.join("hello"), b"hi\n").unwrap();
    });
    let proj = harness.projection();
    assert!(!proj.is_writeable());

    let result = op(|reply| {
        ops::create(&proj, 1, OsStr::new("x"), 0o644, libc::O_WRONLY, reply)
    });
    assert_eq!(result.err(), Some(libc::EROFS));
    assert_eq!(proj.stats.create.get(), 0);

    assert_eq!(
        op(|reply| ops::mkdir(&proj, 1, OsStr::new("d"), 0o755, reply)).err(),
        Some(libc::EROFS)
    );

    // Reading still works.
    let entry = op(|reply| ops::lookup(&proj, 1, OsStr::new("hello"), reply)).unwrap();
    let fh = op(|reply| ops::open(&proj, entry.attr.ino, libc::O_RDONLY, reply)).unwrap();
    assert_eq!(
        op(|reply| ops::read(&proj, fh, 0, 64, reply)).unwrap(),
        b"hi\n"
    );
    harness.stop();
}

#[test]
fn last_detach_broadcasts_shutdown() {
    let harness = Harness::start(ServerConfig::default(), 2, |_| {});
    assert_eq!(harness.bases[0].clients(), 1);
    assert_eq!(harness.bases[1].clients(), 0);
    assert!(!harness.bases[0].shutting_down());

    let bases = harness.bases.clone();
    harness.service.detach();

    let deadline = Instant::now() + Duration::from_secs(2);
    while !(bases[0].shutting_down() && bases[1].shutting_down())
        && Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(bases[0].shutting_down(), "detach target stops");
    assert!(bases[1].shutting_down(), "peer rank told to stop");

    for thread in harness.threads {
        thread.stop_and_join();
    }
}
