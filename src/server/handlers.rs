//! RPC handlers.
//!
//! One handler per operation in the catalog. Every handler follows the
//! same shape: decode the fixed input, resolve the GAH (taking a handler
//! reference), recheck writeability for state-changing calls, run the
//! syscall against the projection root or the handle's fd, and reply with
//! `{err, rc}` per the reply discipline. Handlers run on the rank's
//! progress thread.

use std::ffi::OsStr;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use log::{debug, info, warn};
use nix::fcntl::{AtFlags, OFlag};
use nix::sys::stat::Mode;
use smallvec::SmallVec;

use crate::gah::Gah;
use crate::proto::wire::{
    AttrOut, CreateIn, CreateOut, EntryOut, GahIn, GahNameIn, GahOut, OpenIn, QueryOut,
    ReaddirIn, ReaddirOut, ReadxIn, RenameIn, SetattrIn, StatfsOut, StatusOut, StringOut,
    SymlinkIn, UnlinkIn, WireDirent, WireName, WireStat, WireStatvfs, WritexIn, WritexOut,
    DIRENT_SIZE,
};
use crate::proto::{decode, encode, encode_with_tail, ErrCode, OpCode, SetattrFlags};
use crate::rpc::{HandlerTable, Incoming};

use super::handle::{self, DirStream, FileHandle, HandleKind, find_dirh, find_fh};
use super::read::{self, PendingRead};
use super::{Resource, ServerBase};

/// Inline cap for readdir batches; bigger batches go over bulk.
const READDIR_INLINE_ENTRIES: usize = 2;

/// Errno from a nix failure.
fn rc_of(err: nix::errno::Errno) -> i32 {
    err as i32
}

fn proc_path(fd: &impl AsRawFd) -> String {
    format!("/proc/self/fd/{}", fd.as_raw_fd())
}

/// Mint an inode handle (`O_PATH` fd) for `name` under `parent` and
/// return it with the entry's attributes.
fn make_inode_handle(
    base: &Arc<ServerBase>,
    parent: &Arc<FileHandle>,
    name: &OsStr,
) -> Result<(Arc<FileHandle>, WireStat), i32> {
    let st = nix::sys::stat::fstatat(&parent.fd, name, AtFlags::AT_SYMLINK_NOFOLLOW)
        .map_err(rc_of)?;
    if st.st_dev != parent.projection.dev_no {
        // The entry lives on another filesystem; projections do not
        // cross mounts.
        return Err(libc::EACCES);
    }
    let fd = nix::fcntl::openat(
        &parent.fd,
        name,
        OFlag::O_PATH | OFlag::O_NOFOLLOW,
        Mode::empty(),
    )
    .map_err(rc_of)?;
    let handle = FileHandle::publish(
        base,
        &parent.projection,
        fd,
        st.st_ino,
        libc::O_PATH,
        HandleKind::Inode,
    );
    Ok((handle, WireStat::from_host(&st)))
}

/// Build the full handler table for one server rank.
pub fn build_table(base: &Arc<ServerBase>) -> HandlerTable {
    let mut table = HandlerTable::new();

    macro_rules! register {
        ($op:expr, $handler:expr) => {{
            let base = Arc::clone(base);
            table.register(
                $op,
                Box::new(move |incoming: Incoming| $handler(&base, incoming)),
            );
        }};
    }

    register!(OpCode::QueryPsr, handle_query);
    register!(OpCode::Detach, handle_detach);
    register!(OpCode::Shutdown, handle_shutdown);
    register!(OpCode::Lookup, handle_lookup);
    register!(OpCode::Getattr, handle_getattr);
    register!(OpCode::Setattr, handle_setattr);
    register!(OpCode::Opendir, handle_opendir);
    register!(OpCode::Readdir, handle_readdir);
    register!(OpCode::Closedir, handle_closedir);
    register!(OpCode::Open, handle_open);
    register!(OpCode::Create, handle_create);
    register!(OpCode::Close, handle_close);
    register!(OpCode::Readx, handle_readx);
    register!(OpCode::Writex, handle_writex);
    register!(OpCode::Mkdir, handle_mkdir);
    register!(OpCode::Unlink, handle_unlink);
    register!(OpCode::Rmdir, handle_rmdir);
    register!(OpCode::Rename, handle_rename);
    register!(OpCode::Symlink, handle_symlink);
    register!(OpCode::Readlink, handle_readlink);
    register!(OpCode::Fsync, handle_fsync);
    register!(OpCode::Fdatasync, handle_fdatasync);
    register!(OpCode::Statfs, handle_statfs);

    table
}

fn handle_query(base: &Arc<ServerBase>, incoming: Incoming) {
    base.attach_client();
    let list = base.fs_info_list();
    let out = QueryOut {
        count: list.len() as u32,
        poll_interval: base.config.poll_interval.as_millis() as u32,
        progress_cb: base.config.progress_cb as u32,
        _pad: 0,
    };
    let mut tail = Vec::with_capacity(list.len() * std::mem::size_of::<crate::proto::wire::FsInfo>());
    for info in &list {
        tail.extend_from_slice(zerocopy::IntoBytes::as_bytes(info));
    }
    incoming.replier.send(encode_with_tail(&out, &tail));
}

fn handle_detach(base: &Arc<ServerBase>, incoming: Incoming) {
    let ctx = Arc::clone(&incoming.ctx);
    incoming.replier.send(Vec::new());
    base.detach_client(&ctx);
}

fn handle_shutdown(base: &Arc<ServerBase>, incoming: Incoming) {
    incoming.replier.send(Vec::new());
    base.set_shutdown();
}

fn handle_lookup(base: &Arc<ServerBase>, incoming: Incoming) {
    let mut out = EntryOut {
        gah: Gah::NULL,
        stat: WireStat::default(),
        rc: 0,
        err: 0,
    };
    let Ok((input, _)) = decode::<GahNameIn>(&incoming.payload) else {
        out.err = ErrCode::BadData.raw();
        incoming.replier.send(encode(&out));
        return;
    };
    match find_fh(base, &input.gah) {
        Err(_) => out.err = ErrCode::GahInvalid.raw(),
        Ok(parent) => {
            match make_inode_handle(base, &parent, input.name.as_os_str()) {
                Ok((handle, stat)) => {
                    out.gah = handle.gah();
                    out.stat = stat;
                }
                Err(rc) => out.rc = rc,
            }
            parent.decref(base, 1);
        }
    }
    debug!(
        "lookup {:?} result err {} rc {}",
        input.name, out.err, out.rc
    );
    incoming.replier.send(encode(&out));
}

fn handle_getattr(base: &Arc<ServerBase>, incoming: Incoming) {
    let mut out = AttrOut::default();
    let Ok((input, _)) = decode::<GahNameIn>(&incoming.payload) else {
        out.err = ErrCode::BadData.raw();
        incoming.replier.send(encode(&out));
        return;
    };
    match find_fh(base, &input.gah) {
        Err(_) => out.err = ErrCode::GahInvalid.raw(),
        Ok(handle) => {
            if input.name.is_empty() {
                match nix::sys::stat::fstat(&handle.fd) {
                    Ok(st) => out.stat = WireStat::from_host(&st),
                    Err(err) => out.rc = rc_of(err),
                }
            } else {
                match nix::sys::stat::fstatat(
                    &handle.fd,
                    input.name.as_os_str(),
                    AtFlags::AT_SYMLINK_NOFOLLOW,
                ) {
                    Ok(st) if st.st_dev != handle.projection.dev_no => {
                        out.rc = libc::EACCES;
                    }
                    Ok(st) => out.stat = WireStat::from_host(&st),
                    Err(err) => out.rc = rc_of(err),
                }
            }
            handle.decref(base, 1);
        }
    }
    incoming.replier.send(encode(&out));
}

fn handle_setattr(base: &Arc<ServerBase>, incoming: Incoming) {
    let mut out = AttrOut::default();
    let Ok((input, _)) = decode::<SetattrIn>(&incoming.payload) else {
        out.err = ErrCode::BadData.raw();
        incoming.replier.send(encode(&out));
        return;
    };
    let handle = match find_fh(base, &input.gah) {
        Err(_) => {
            out.err = ErrCode::GahInvalid.raw();
            incoming.replier.send(encode(&out));
            return;
        }
        Ok(handle) => handle,
    };
    if !handle.projection.is_writeable() {
        out.rc = libc::EROFS;
    } else {
        out.rc = apply_setattr(&handle, &input).err().unwrap_or(0);
    }
    if out.rc == 0 {
        match nix::sys::stat::fstat(&handle.fd) {
            Ok(st) => out.stat = WireStat::from_host(&st),
            Err(err) => out.rc = rc_of(err),
        }
    }
    handle.decref(base, 1);
    incoming.replier.send(encode(&out));
}

fn apply_setattr(handle: &Arc<FileHandle>, input: &SetattrIn) -> Result<(), i32> {
    use std::os::unix::fs::PermissionsExt;

    let to_set = SetattrFlags::from_bits_truncate(input.to_set);
    let stat = &input.stat;

    if to_set.contains(SetattrFlags::MODE) {
        std::fs::set_permissions(
            proc_path(&handle.fd),
            std::fs::Permissions::from_mode(stat.mode & 0o7777),
        )
        .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
    }
    if to_set.intersects(SetattrFlags::UID | SetattrFlags::GID) {
        let uid = to_set
            .contains(SetattrFlags::UID)
            .then(|| nix::unistd::Uid::from_raw(stat.uid));
        let gid = to_set
            .contains(SetattrFlags::GID)
            .then(|| nix::unistd::Gid::from_raw(stat.gid));
        nix::unistd::chown(proc_path(&handle.fd).as_str(), uid, gid).map_err(rc_of)?;
    }
    if to_set.contains(SetattrFlags::SIZE) {
        if handle.kind == HandleKind::Open && handle.flags & libc::O_ACCMODE != libc::O_RDONLY {
            nix::unistd::ftruncate(&handle.fd, stat.size).map_err(rc_of)?;
        } else {
            let fd = handle::reopen(&handle.fd, libc::O_WRONLY).map_err(rc_of)?;
            nix::unistd::ftruncate(&fd, stat.size).map_err(rc_of)?;
        }
    }
    if to_set.intersects(
        SetattrFlags::ATIME
            | SetattrFlags::MTIME
            | SetattrFlags::ATIME_NOW
            | SetattrFlags::MTIME_NOW,
    ) {
        use nix::sys::time::TimeSpec;
        let omit = TimeSpec::new(0, libc::UTIME_OMIT);
        let now = TimeSpec::new(0, libc::UTIME_NOW);
        let mut atime = omit;
        let mut mtime = omit;
        if to_set.contains(SetattrFlags::ATIME) {
            atime = TimeSpec::new(stat.atime, stat.atime_nsec as i64);
        }
        if to_set.contains(SetattrFlags::ATIME_NOW) {
            atime = now;
        }
        if to_set.contains(SetattrFlags::MTIME) {
            mtime = TimeSpec::new(stat.mtime, stat.mtime_nsec as i64);
        }
        if to_set.contains(SetattrFlags::MTIME_NOW) {
            mtime = now;
        }
        nix::sys::stat::futimens(&handle.fd, &atime, &mtime).map_err(rc_of)?;
    }
    Ok(())
}

fn handle_opendir(base: &Arc<ServerBase>, incoming: Incoming) {
    let mut out = GahOut {
        gah: Gah::NULL,
        rc: 0,
        err: 0,
    };
    let Ok((input, _)) = decode::<GahIn>(&incoming.payload) else {
        out.err = ErrCode::BadData.raw();
        incoming.replier.send(encode(&out));
        return;
    };
    match find_fh(base, &input.gah) {
        Err(_) => out.err = ErrCode::GahInvalid.raw(),
        Ok(handle) => {
            match handle::reopen(&handle.fd, libc::O_RDONLY | libc::O_DIRECTORY) {
                Ok(fd) => match DirStream::from_fd(fd) {
                    Ok(stream) => {
                        let dirh = handle::DirHandle::new(stream);
                        out.gah = base.store.write().allocate(
                            base.rank as u8,
                            0,
                            Resource::Dir(dirh),
                        );
                        info!("opendir {} -> {}", input.gah, out.gah);
                    }
                    Err(err) => out.rc = err.raw_os_error().unwrap_or(libc::EIO),
                },
                Err(err) => out.rc = rc_of(err),
            }
            handle.decref(base, 1);
        }
    }
    incoming.replier.send(encode(&out));
}

fn handle_readdir(base: &Arc<ServerBase>, incoming: Incoming) {
    let mut out = ReaddirOut::default();
    let Ok((input, _)) = decode::<ReaddirIn>(&incoming.payload) else {
        out.err = ErrCode::BadData.raw();
        incoming.replier.send(encode(&out));
        return;
    };
    let dirh = match find_dirh(base, &input.gah) {
        Err(_) => {
            out.err = ErrCode::GahInvalid.raw();
            incoming.replier.send(encode(&out));
            return;
        }
        Ok(dirh) => dirh,
    };

    // The client's readdir buffer was sized by the query exchange, so its
    // length is known without a round trip.
    let max_replies = if input.bulk != 0 {
        ((base.config.readdir_size as usize) / DIRENT_SIZE).max(1)
    } else {
        READDIR_INLINE_ENTRIES
    };

    // Most batches are the two inline entries; bulk batches spill.
    let mut replies: SmallVec<[WireDirent; READDIR_INLINE_ENTRIES]> = SmallVec::new();
    {
        let mut stream = dirh.stream.lock();
        if stream.offset != input.offset as i64 {
            debug!("readdir cursor moved {} -> {}", stream.offset, input.offset);
            stream.seek(input.offset as i64);
        }
        while replies.len() < max_replies {
            match stream.next_entry() {
                Ok(None) => {
                    out.last = 1;
                    break;
                }
                Ok(Some(name)) => {
                    let mut entry = WireDirent {
                        name: WireName::new(&name).unwrap_or(WireName::EMPTY),
                        stat: WireStat::default(),
                        nextoff: stream.offset,
                        read_rc: 0,
                        stat_rc: 0,
                    };
                    match nix::sys::stat::fstatat(
                        &stream.borrowed_fd(),
                        name.as_os_str(),
                        AtFlags::AT_SYMLINK_NOFOLLOW,
                    ) {
                        Ok(st) => entry.stat = WireStat::from_host(&st),
                        Err(err) => entry.stat_rc = rc_of(err),
                    }
                    replies.push(entry);
                }
                Err(errno) => {
                    replies.push(WireDirent {
                        name: WireName::EMPTY,
                        stat: WireStat::default(),
                        nextoff: stream.offset,
                        read_rc: errno,
                        stat_rc: 0,
                    });
                    break;
                }
            }
        }
    }

    debug!("readdir {} entries, last {}", replies.len(), out.last);
    let mut bytes = Vec::with_capacity(replies.len() * DIRENT_SIZE);
    for entry in &replies {
        bytes.extend_from_slice(zerocopy::IntoBytes::as_bytes(entry));
    }

    if replies.len() > READDIR_INLINE_ENTRIES && input.bulk != 0 {
        let count = replies.len() as i32;
        let replier = incoming.replier;
        incoming.ctx.bulk_put(
            input.bulk,
            bytes,
            Box::new(move |ok| {
                let mut out = out;
                if ok {
                    out.bulk_count = count;
                } else {
                    out.err = ErrCode::Transport.raw();
                }
                replier.send(encode(&out));
            }),
        );
    } else {
        out.iov_count = replies.len() as i32;
        incoming.replier.send(encode_with_tail(&out, &bytes));
    }
}

fn handle_closedir(base: &Arc<ServerBase>, incoming: Incoming) {
    let Ok((input, _)) = decode::<GahIn>(&incoming.payload) else {
        incoming.replier.send(Vec::new());
        return;
    };
    // No status to convey; ack first, clean up off the reply path.
    incoming.replier.send(Vec::new());
    match base.store.write().deallocate(&input.gah) {
        Ok(Resource::Dir(_)) => debug!("closedir {}", input.gah),
        Ok(Resource::File(_)) => warn!("closedir of a file handle {}", input.gah),
        Err(err) => debug!("closedir {}: {err}", input.gah),
    }
}

fn handle_open(base: &Arc<ServerBase>, incoming: Incoming) {
    let mut out = GahOut {
        gah: Gah::NULL,
        rc: 0,
        err: 0,
    };
    let Ok((input, _)) = decode::<OpenIn>(&incoming.payload) else {
        out.err = ErrCode::BadData.raw();
        incoming.replier.send(encode(&out));
        return;
    };
    let flags = input.flags as i32;
    let inode = match find_fh(base, &input.gah) {
        Err(_) => {
            out.err = ErrCode::GahInvalid.raw();
            incoming.replier.send(encode(&out));
            return;
        }
        Ok(handle) => handle,
    };
    let accmode = flags & libc::O_ACCMODE;
    if (accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
        && !inode.projection.is_writeable()
    {
        out.rc = libc::EROFS;
    } else {
        match handle::reopen(&inode.fd, flags) {
            Ok(fd) => match nix::sys::stat::fstat(&fd) {
                Ok(st) => {
                    let handle = FileHandle::publish(
                        base,
                        &inode.projection,
                        fd,
                        st.st_ino,
                        flags,
                        HandleKind::Open,
                    );
                    out.gah = handle.gah();
                }
                Err(err) => out.rc = rc_of(err),
            },
            Err(err) => out.rc = rc_of(err),
        }
    }
    inode.decref(base, 1);
    info!("open flags 0{flags:o} result err {} rc {}", out.err, out.rc);
    incoming.replier.send(encode(&out));
}

fn handle_create(base: &Arc<ServerBase>, incoming: Incoming) {
    let mut out = CreateOut {
        gah: Gah::NULL,
        igah: Gah::NULL,
        stat: WireStat::default(),
        rc: 0,
        err: 0,
    };
    let Ok((input, _)) = decode::<CreateIn>(&incoming.payload) else {
        out.err = ErrCode::BadData.raw();
        incoming.replier.send(encode(&out));
        return;
    };
    let parent = match find_fh(base, &input.gah) {
        Err(_) => {
            out.err = ErrCode::GahInvalid.raw();
            incoming.replier.send(encode(&out));
            return;
        }
        Ok(handle) => handle,
    };
    let name = input.name.as_os_str();
    if !parent.projection.is_writeable() {
        out.rc = libc::EROFS;
    } else {
        let oflag = OFlag::from_bits_truncate(input.flags as i32) | OFlag::O_CREAT;
        let mode = Mode::from_bits_truncate(input.mode);
        match nix::fcntl::openat(&parent.fd, name, oflag, mode) {
            Ok(fd) => match nix::sys::stat::fstat(&fd) {
                Ok(st) => {
                    let handle = FileHandle::publish(
                        base,
                        &parent.projection,
                        fd,
                        st.st_ino,
                        input.flags as i32,
                        HandleKind::Open,
                    );
                    out.gah = handle.gah();
                    out.stat = WireStat::from_host(&st);
                    // The kernel learns the new inode from the same
                    // reply, so mint its inode handle here too.
                    match make_inode_handle(base, &parent, name) {
                        Ok((inode, _)) => out.igah = inode.gah(),
                        Err(rc) => {
                            handle.decref(base, 1);
                            out.gah = Gah::NULL;
                            out.rc = rc;
                        }
                    }
                }
                Err(err) => out.rc = rc_of(err),
            },
            Err(err) => out.rc = rc_of(err),
        }
    }
    parent.decref(base, 1);
    info!(
        "create {:?} mode 0{:o} result err {} rc {}",
        input.name, input.mode, out.err, out.rc
    );
    incoming.replier.send(encode(&out));
}

fn handle_close(base: &Arc<ServerBase>, incoming: Incoming) {
    let Ok((input, _)) = decode::<GahIn>(&incoming.payload) else {
        incoming.replier.send(Vec::new());
        return;
    };
    // The client needs no status from close; ack first.
    incoming.replier.send(Vec::new());
    match find_fh(base, &input.gah) {
        Ok(handle) => handle.decref(base, 2),
        Err(err) => debug!("close {}: {err}", input.gah),
    }
}

fn handle_readx(base: &Arc<ServerBase>, incoming: Incoming) {
    let mut out = crate::proto::wire::ReadxOut::default();
    let Ok((input, _)) = decode::<ReadxIn>(&incoming.payload) else {
        out.err = ErrCode::BadData.raw();
        incoming.replier.send(encode(&out));
        return;
    };
    if input.xtvec.len > base.config.max_read as u64 {
        warn!("read of {} exceeds max_read", input.xtvec.len);
        out.err = ErrCode::Internal.raw();
        incoming.replier.send(encode(&out));
        return;
    }
    let handle = match find_fh(base, &input.gah) {
        Err(_) => {
            out.err = ErrCode::GahInvalid.raw();
            incoming.replier.send(encode(&out));
            return;
        }
        Ok(handle) => handle,
    };
    read::submit(
        base,
        PendingRead {
            handle,
            req: input,
            replier: incoming.replier,
            ctx: incoming.ctx,
        },
    );
}

fn handle_writex(base: &Arc<ServerBase>, incoming: Incoming) {
    let mut out = WritexOut::default();
    let Ok((input, tail)) = decode::<WritexIn>(&incoming.payload) else {
        out.err = ErrCode::BadData.raw();
        incoming.replier.send(encode(&out));
        return;
    };
    if input.xtvec.len > base.config.max_write as u64 {
        out.err = ErrCode::Internal.raw();
        incoming.replier.send(encode(&out));
        return;
    }
    let handle = match find_fh(base, &input.gah) {
        Err(_) => {
            out.err = ErrCode::GahInvalid.raw();
            incoming.replier.send(encode(&out));
            return;
        }
        Ok(handle) => handle,
    };
    if !handle.projection.is_writeable() {
        out.rc = libc::EROFS;
        handle.decref(base, 1);
        incoming.replier.send(encode(&out));
        return;
    }
    let offset = input.xtvec.off;
    if input.bulk_len > 0 {
        let base2 = Arc::clone(base);
        let replier = incoming.replier;
        let handle2 = Arc::clone(&handle);
        incoming.ctx.bulk_get(
            input.data_bulk,
            input.bulk_len,
            Box::new(move |result| {
                let mut out = WritexOut::default();
                match result {
                    Ok(data) => match nix::sys::uio::pwrite(&handle2.fd, &data, offset) {
                        Ok(n) => out.len = n as u64,
                        Err(err) => out.rc = rc_of(err),
                    },
                    Err(_) => out.err = ErrCode::Transport.raw(),
                }
                handle2.decref(&base2, 1);
                replier.send(encode(&out));
            }),
        );
    } else {
        match nix::sys::uio::pwrite(&handle.fd, tail, offset) {
            Ok(n) => out.len = n as u64,
            Err(err) => out.rc = rc_of(err),
        }
        handle.decref(base, 1);
        incoming.replier.send(encode(&out));
    }
}

fn handle_mkdir(base: &Arc<ServerBase>, incoming: Incoming) {
    let mut out = EntryOut {
        gah: Gah::NULL,
        stat: WireStat::default(),
        rc: 0,
        err: 0,
    };
    let Ok((input, _)) = decode::<CreateIn>(&incoming.payload) else {
        out.err = ErrCode::BadData.raw();
        incoming.replier.send(encode(&out));
        return;
    };
    let parent = match find_fh(base, &input.gah) {
        Err(_) => {
            out.err = ErrCode::GahInvalid.raw();
            incoming.replier.send(encode(&out));
            return;
        }
        Ok(handle) => handle,
    };
    let name = input.name.as_os_str();
    if !parent.projection.is_writeable() {
        out.rc = libc::EROFS;
    } else {
        match nix::sys::stat::mkdirat(&parent.fd, name, Mode::from_bits_truncate(input.mode)) {
            Ok(()) => match make_inode_handle(base, &parent, name) {
                Ok((handle, stat)) => {
                    out.gah = handle.gah();
                    out.stat = stat;
                }
                Err(rc) => out.rc = rc,
            },
            Err(err) => out.rc = rc_of(err),
        }
    }
    parent.decref(base, 1);
    incoming.replier.send(encode(&out));
}

fn unlink_common(base: &Arc<ServerBase>, gah: &Gah, name: &OsStr, rmdir: bool) -> (i32, i32) {
    use nix::unistd::UnlinkatFlags;
    let parent = match find_fh(base, gah) {
        Err(_) => return (ErrCode::GahInvalid.raw(), 0),
        Ok(handle) => handle,
    };
    let rc = if !parent.projection.is_writeable() {
        libc::EROFS
    } else {
        let flag = if rmdir {
            UnlinkatFlags::RemoveDir
        } else {
            UnlinkatFlags::NoRemoveDir
        };
        match nix::unistd::unlinkat(&parent.fd, name, flag) {
            Ok(()) => 0,
            Err(err) => rc_of(err),
        }
    };
    parent.decref(base, 1);
    (0, rc)
}

fn handle_unlink(base: &Arc<ServerBase>, incoming: Incoming) {
    let mut out = StatusOut::default();
    let Ok((input, _)) = decode::<UnlinkIn>(&incoming.payload) else {
        out.err = ErrCode::BadData.raw();
        incoming.replier.send(encode(&out));
        return;
    };
    let rmdir = input.flags & 1 != 0;
    let (err, rc) = unlink_common(base, &input.gah, input.name.as_os_str(), rmdir);
    out.err = err;
    out.rc = rc;
    incoming.replier.send(encode(&out));
}

fn handle_rmdir(base: &Arc<ServerBase>, incoming: Incoming) {
    let mut out = StatusOut::default();
    let Ok((input, _)) = decode::<GahNameIn>(&incoming.payload) else {
        out.err = ErrCode::BadData.raw();
        incoming.replier.send(encode(&out));
        return;
    };
    let (err, rc) = unlink_common(base, &input.gah, input.name.as_os_str(), true);
    out.err = err;
    out.rc = rc;
    incoming.replier.send(encode(&out));
}

fn handle_rename(base: &Arc<ServerBase>, incoming: Incoming) {
    let mut out = StatusOut::default();
    let Ok((input, _)) = decode::<RenameIn>(&incoming.payload) else {
        out.err = ErrCode::BadData.raw();
        incoming.replier.send(encode(&out));
        return;
    };
    let old_parent = match find_fh(base, &input.old_gah) {
        Err(_) => {
            out.err = ErrCode::GahInvalid.raw();
            incoming.replier.send(encode(&out));
            return;
        }
        Ok(handle) => handle,
    };
    let new_parent = match find_fh(base, &input.new_gah) {
        Err(_) => {
            old_parent.decref(base, 1);
            out.err = ErrCode::GahInvalid.raw();
            incoming.replier.send(encode(&out));
            return;
        }
        Ok(handle) => handle,
    };
    if !old_parent.projection.is_writeable() {
        out.rc = libc::EROFS;
    } else {
        let old_name = input.old_name.as_os_str();
        let new_name = input.new_name.as_os_str();
        let result = if input.flags == 0 {
            nix::fcntl::renameat(&old_parent.fd, old_name, &new_parent.fd, new_name)
        } else {
            nix::fcntl::renameat2(
                &old_parent.fd,
                old_name,
                &new_parent.fd,
                new_name,
                nix::fcntl::RenameFlags::from_bits_truncate(input.flags),
            )
        };
        if let Err(err) = result {
            out.rc = rc_of(err);
        }
    }
    new_parent.decref(base, 1);
    old_parent.decref(base, 1);
    incoming.replier.send(encode(&out));
}

fn handle_symlink(base: &Arc<ServerBase>, incoming: Incoming) {
    let mut out = EntryOut {
        gah: Gah::NULL,
        stat: WireStat::default(),
        rc: 0,
        err: 0,
    };
    let Ok((input, tail)) = decode::<SymlinkIn>(&incoming.payload) else {
        out.err = ErrCode::BadData.raw();
        incoming.replier.send(encode(&out));
        return;
    };
    let target = OsStr::from_bytes(tail).to_os_string();
    let parent = match find_fh(base, &input.gah) {
        Err(_) => {
            out.err = ErrCode::GahInvalid.raw();
            incoming.replier.send(encode(&out));
            return;
        }
        Ok(handle) => handle,
    };
    let name = input.name.as_os_str();
    if !parent.projection.is_writeable() {
        out.rc = libc::EROFS;
    } else if target.is_empty() {
        out.rc = libc::EINVAL;
    } else {
        match nix::unistd::symlinkat(target.as_os_str(), &parent.fd, name) {
            Ok(()) => match make_inode_handle(base, &parent, name) {
                Ok((handle, stat)) => {
                    out.gah = handle.gah();
                    out.stat = stat;
                }
                Err(rc) => out.rc = rc,
            },
            Err(err) => out.rc = rc_of(err),
        }
    }
    parent.decref(base, 1);
    incoming.replier.send(encode(&out));
}

fn handle_readlink(base: &Arc<ServerBase>, incoming: Incoming) {
    let mut out = StringOut::default();
    let Ok((input, _)) = decode::<GahIn>(&incoming.payload) else {
        out.err = ErrCode::BadData.raw();
        incoming.replier.send(encode(&out));
        return;
    };
    let mut tail = Vec::new();
    match find_fh(base, &input.gah) {
        Err(_) => out.err = ErrCode::GahInvalid.raw(),
        Ok(handle) => {
            // Empty path resolves the O_PATH|O_NOFOLLOW fd itself.
            match nix::fcntl::readlinkat(&handle.fd, "") {
                Ok(path) => tail = path.as_os_str().as_bytes().to_vec(),
                Err(err) => out.rc = rc_of(err),
            }
            handle.decref(base, 1);
        }
    }
    incoming.replier.send(encode_with_tail(&out, &tail));
}

fn sync_common(base: &Arc<ServerBase>, incoming: Incoming, datasync: bool) {
    let mut out = StatusOut::default();
    let Ok((input, _)) = decode::<GahIn>(&incoming.payload) else {
        out.err = ErrCode::BadData.raw();
        incoming.replier.send(encode(&out));
        return;
    };
    match find_fh(base, &input.gah) {
        Err(_) => out.err = ErrCode::GahInvalid.raw(),
        Ok(handle) => {
            if !handle.projection.is_writeable() {
                out.rc = libc::EROFS;
            } else {
                let result = if datasync {
                    nix::unistd::fdatasync(&handle.fd)
                } else {
                    nix::unistd::fsync(&handle.fd)
                };
                if let Err(err) = result {
                    out.rc = rc_of(err);
                }
            }
            handle.decref(base, 1);
        }
    }
    incoming.replier.send(encode(&out));
}

fn handle_fsync(base: &Arc<ServerBase>, incoming: Incoming) {
    sync_common(base, incoming, false);
}

fn handle_fdatasync(base: &Arc<ServerBase>, incoming: Incoming) {
    sync_common(base, incoming, true);
}

fn handle_statfs(base: &Arc<ServerBase>, incoming: Incoming) {
    let mut out = StatfsOut::default();
    let Ok((input, _)) = decode::<GahIn>(&incoming.payload) else {
        out.err = ErrCode::BadData.raw();
        incoming.replier.send(encode(&out));
        return;
    };
    match find_fh(base, &input.gah) {
        Err(_) => out.err = ErrCode::GahInvalid.raw(),
        Ok(handle) => {
            match nix::sys::statvfs::fstatvfs(&handle.fd) {
                Ok(vfs) => {
                    out.stat = WireStatvfs {
                        bsize: vfs.block_size() as u64,
                        frsize: vfs.fragment_size() as u64,
                        blocks: vfs.blocks() as u64,
                        bfree: vfs.blocks_free() as u64,
                        bavail: vfs.blocks_available() as u64,
                        files: vfs.files() as u64,
                        ffree: vfs.files_free() as u64,
                        favail: vfs.files_available() as u64,
                        flag: vfs.flags().bits() as u64,
                        namemax: vfs.name_max() as u64,
                    };
                }
                Err(err) => out.rc = rc_of(err),
            }
            handle.decref(base, 1);
        }
    }
    incoming.replier.send(encode(&out));
}
