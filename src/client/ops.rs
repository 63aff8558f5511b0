//! Operation core.
//!
//! One function per filesystem operation, shared by the FUSE dispatcher
//! and the integration tests: the dispatcher adapts kernel upcalls and
//! reply objects onto these, tests call them directly and drive the
//! loopback fabric. Each function accounts its stats counter, resolves
//! GAHs through the inode table or the open-handle maps, and completes
//! through a boxed reply callback on the projection's progress thread.

use std::ffi::OsStr;
use std::sync::Arc;

use log::{debug, warn};
use zerocopy::FromBytes;

use crate::gah::Gah;
use crate::proto::wire::{
    AttrOut, CreateIn, CreateOut, EntryOut, GahIn, GahNameIn, GahOut, OpenIn, ReaddirIn,
    ReaddirOut, ReadxIn, ReadxOut, RenameIn, SetattrIn, StatfsOut, StatusOut, StringOut, SymlinkIn,
    UnlinkIn, WireDirent, WireName, WireStat, WireStatvfs, WritexIn, WritexOut, Xtvec,
};
use crate::proto::{ReplyStatus, SetattrFlags, OpCode, decode, encode, encode_with_tail, resolve};
use crate::stats::Counter;

use super::handles::{ClientDirent, OpenDir, OpenFile};
use super::inode::{InodeEntry, Inserted};
use super::request::send_request;
use super::Projection;

pub type OpReply<T> = Box<dyn FnOnce(Result<T, i32>) + Send>;

/// What a lookup-like reply publishes to the kernel.
pub struct EntryData {
    pub attr: fuser::FileAttr,
    pub generation: u64,
}

/// Open flags the projection cannot express remotely.
pub const UNSUPPORTED_CREATE_FLAGS: i32 =
    libc::O_ASYNC | libc::O_CLOEXEC | libc::O_DIRECTORY | libc::O_NOCTTY | libc::O_PATH;
pub const UNSUPPORTED_OPEN_FLAGS: i32 =
    UNSUPPORTED_CREATE_FLAGS | libc::O_CREAT | libc::O_EXCL;

fn name_errno(name: &OsStr) -> i32 {
    if name.len() > crate::proto::wire::NAME_MAX {
        libc::ENAMETOOLONG
    } else {
        libc::EINVAL
    }
}

/// Fold a decoded `{err, rc}` into the continuation, invalidating
/// `on_gah_invalid` first when the server rejected the handle.
fn check_status(err: i32, rc: i32, on_gah_invalid: impl FnOnce()) -> Result<(), i32> {
    match resolve(err, rc) {
        ReplyStatus::Ok => Ok(()),
        ReplyStatus::Errno(rc) => Err(rc),
        ReplyStatus::Internal { gah_invalid } => {
            if gah_invalid {
                on_gah_invalid();
            }
            Err(libc::EIO)
        }
    }
}

/// Publish a fresh entry to the inode table, handling the race where a
/// sibling lookup for the same inode got there first.
fn publish_entry(
    proj: &Arc<Projection>,
    parent: u64,
    name: &OsStr,
    gah: Gah,
    stat: WireStat,
) -> EntryData {
    proj.inodes.ref_parent(parent);
    let entry = InodeEntry::new(gah, stat, name, parent);
    match proj.inodes.find_insert(entry) {
        Inserted::New(_) => {}
        Inserted::Existing { winner, lost_gah } => {
            // The winner carries our kernel reference; give back the
            // parent reference we took and close the GAH we minted.
            debug!(
                "inode {} raced, closing {} keeping {}",
                stat.ino,
                lost_gah,
                winner.gah()
            );
            for released in proj.inodes.forget(parent, 1) {
                proj.send_close(OpCode::Close, released.gah(), None);
            }
            proj.send_close(OpCode::Close, lost_gah, None);
        }
    }
    EntryData {
        attr: stat.to_attr(),
        generation: 0,
    }
}

pub fn lookup(proj: &Arc<Projection>, parent: u64, name: &OsStr, reply: OpReply<EntryData>) {
    proj.stats.lookup.inc();
    let Some(gah) = proj.find_gah(parent) else {
        reply(Err(libc::ENOENT));
        return;
    };
    let Some(wire_name) = WireName::new(name) else {
        reply(Err(name_errno(name)));
        return;
    };
    let payload = encode(&GahNameIn {
        gah,
        name: wire_name,
    });
    let proj2 = Arc::clone(proj);
    let name = name.to_os_string();
    send_request(
        proj,
        OpCode::Lookup,
        payload,
        true,
        Box::new(move |result| {
            let reply_result = result.and_then(|bytes| {
                let (out, _) = decode::<EntryOut>(&bytes).map_err(|_| libc::EIO)?;
                check_status(out.err, out.rc, || {})?;
                Ok(publish_entry(&proj2, parent, &name, out.gah, out.stat))
            });
            reply(reply_result);
        }),
    );
}

pub fn forget(proj: &Arc<Projection>, ino: u64, nlookup: u64) {
    proj.stats.forget.inc();
    for released in proj.inodes.forget(ino, nlookup) {
        // A handle rooted on an evicted rank has nothing to close.
        if released.gah().root() as u32 == proj.group.primary() {
            proj.send_close(OpCode::Close, released.gah(), None);
        } else {
            debug!("skipping close of {} on old root", released.gah());
        }
    }
}

pub fn getattr(
    proj: &Arc<Projection>,
    ino: u64,
    fh: Option<u64>,
    reply: OpReply<fuser::FileAttr>,
) {
    proj.stats.getattr.inc();
    // An open file resolves through its own handle, everything else
    // through the inode table.
    let file = fh.and_then(|fh| proj.file(fh));
    let gah = match &file {
        Some(file) if !file.is_valid() => {
            reply(Err(libc::EIO));
            return;
        }
        Some(file) => file.gah(),
        None => match proj.find_gah(ino) {
            Some(gah) => gah,
            None => {
                reply(Err(libc::ENOENT));
                return;
            }
        },
    };
    let payload = encode(&GahNameIn {
        gah,
        name: WireName::EMPTY,
    });
    send_request(
        proj,
        OpCode::Getattr,
        payload,
        true,
        Box::new(move |result| {
            reply(result.and_then(|bytes| {
                let (out, _) = decode::<AttrOut>(&bytes).map_err(|_| libc::EIO)?;
                check_status(out.err, out.rc, || {
                    if let Some(file) = &file {
                        file.set_invalid();
                    }
                })?;
                Ok(out.stat.to_attr())
            }));
        }),
    );
}

pub fn setattr(
    proj: &Arc<Projection>,
    ino: u64,
    fh: Option<u64>,
    stat: WireStat,
    to_set: SetattrFlags,
    reply: OpReply<fuser::FileAttr>,
) {
    proj.stats.setattr.inc();
    if !proj.is_writeable() {
        reply(Err(libc::EROFS));
        return;
    }
    let file = fh.and_then(|fh| proj.file(fh));
    let gah = match &file {
        Some(file) if !file.is_valid() => {
            reply(Err(libc::EIO));
            return;
        }
        Some(file) => file.gah(),
        None => match proj.find_gah(ino) {
            Some(gah) => gah,
            None => {
                reply(Err(libc::ENOENT));
                return;
            }
        },
    };
    let payload = encode(&SetattrIn {
        gah,
        stat,
        to_set: to_set.bits(),
        _pad: 0,
    });
    send_request(
        proj,
        OpCode::Setattr,
        payload,
        false,
        Box::new(move |result| {
            reply(result.and_then(|bytes| {
                let (out, _) = decode::<AttrOut>(&bytes).map_err(|_| libc::EIO)?;
                check_status(out.err, out.rc, || {
                    if let Some(file) = &file {
                        file.set_invalid();
                    }
                })?;
                Ok(out.stat.to_attr())
            }));
        }),
    );
}

pub fn readlink(proj: &Arc<Projection>, ino: u64, reply: OpReply<Vec<u8>>) {
    proj.stats.readlink.inc();
    let Some(gah) = proj.find_gah(ino) else {
        reply(Err(libc::ENOENT));
        return;
    };
    send_request(
        proj,
        OpCode::Readlink,
        encode(&GahIn { gah }),
        true,
        Box::new(move |result| {
            reply(result.and_then(|bytes| {
                let (out, tail) = decode::<StringOut>(&bytes).map_err(|_| libc::EIO)?;
                check_status(out.err, out.rc, || {})?;
                Ok(tail.to_vec())
            }));
        }),
    );
}

pub fn mkdir(
    proj: &Arc<Projection>,
    parent: u64,
    name: &OsStr,
    mode: u32,
    reply: OpReply<EntryData>,
) {
    proj.stats.mkdir.inc();
    if !proj.is_writeable() {
        reply(Err(libc::EROFS));
        return;
    }
    let Some(gah) = proj.find_gah(parent) else {
        reply(Err(libc::ENOENT));
        return;
    };
    let Some(wire_name) = WireName::new(name) else {
        reply(Err(name_errno(name)));
        return;
    };
    let payload = encode(&CreateIn {
        gah,
        name: wire_name,
        mode,
        flags: 0,
    });
    let proj2 = Arc::clone(proj);
    let name = name.to_os_string();
    send_request(
        proj,
        OpCode::Mkdir,
        payload,
        false,
        Box::new(move |result| {
            reply(result.and_then(|bytes| {
                let (out, _) = decode::<EntryOut>(&bytes).map_err(|_| libc::EIO)?;
                check_status(out.err, out.rc, || {})?;
                Ok(publish_entry(&proj2, parent, &name, out.gah, out.stat))
            }));
        }),
    );
}

fn remove_common(
    proj: &Arc<Projection>,
    op: OpCode,
    stat: &Counter,
    parent: u64,
    name: &OsStr,
    rmdir: bool,
    reply: OpReply<()>,
) {
    stat.inc();
    if !proj.is_writeable() {
        reply(Err(libc::EROFS));
        return;
    }
    let Some(gah) = proj.find_gah(parent) else {
        reply(Err(libc::ENOENT));
        return;
    };
    let Some(wire_name) = WireName::new(name) else {
        reply(Err(name_errno(name)));
        return;
    };
    let payload = match op {
        OpCode::Rmdir => encode(&GahNameIn {
            gah,
            name: wire_name,
        }),
        _ => encode(&UnlinkIn {
            name: wire_name,
            gah,
            flags: rmdir as u32,
            _pad: 0,
        }),
    };
    send_request(
        proj,
        op,
        payload,
        false,
        Box::new(move |result| {
            reply(result.and_then(|bytes| {
                let (out, _) = decode::<StatusOut>(&bytes).map_err(|_| libc::EIO)?;
                check_status(out.err, out.rc, || {})
            }));
        }),
    );
}

pub fn unlink(proj: &Arc<Projection>, parent: u64, name: &OsStr, reply: OpReply<()>) {
    remove_common(
        proj,
        OpCode::Unlink,
        &proj.stats.unlink,
        parent,
        name,
        false,
        reply,
    );
}

pub fn rmdir(proj: &Arc<Projection>, parent: u64, name: &OsStr, reply: OpReply<()>) {
    remove_common(
        proj,
        OpCode::Rmdir,
        &proj.stats.rmdir,
        parent,
        name,
        true,
        reply,
    );
}

#[allow(clippy::too_many_arguments)]
pub fn rename(
    proj: &Arc<Projection>,
    parent: u64,
    name: &OsStr,
    newparent: u64,
    newname: &OsStr,
    flags: u32,
    reply: OpReply<()>,
) {
    proj.stats.rename.inc();
    if !proj.is_writeable() {
        reply(Err(libc::EROFS));
        return;
    }
    let (Some(old_gah), Some(new_gah)) = (proj.find_gah(parent), proj.find_gah(newparent))
    else {
        reply(Err(libc::ENOENT));
        return;
    };
    let (Some(old_name), Some(new_name)) = (WireName::new(name), WireName::new(newname)) else {
        reply(Err(name_errno(name).max(name_errno(newname))));
        return;
    };
    let payload = encode(&RenameIn {
        old_gah,
        new_gah,
        old_name,
        new_name,
        flags,
        _pad: 0,
    });
    send_request(
        proj,
        OpCode::Rename,
        payload,
        false,
        Box::new(move |result| {
            reply(result.and_then(|bytes| {
                let (out, _) = decode::<StatusOut>(&bytes).map_err(|_| libc::EIO)?;
                check_status(out.err, out.rc, || {})
            }));
        }),
    );
}

pub fn symlink(
    proj: &Arc<Projection>,
    parent: u64,
    link_name: &OsStr,
    target: &OsStr,
    reply: OpReply<EntryData>,
) {
    use std::os::unix::ffi::OsStrExt;

    proj.stats.symlink.inc();
    if !proj.is_writeable() {
        reply(Err(libc::EROFS));
        return;
    }
    let Some(gah) = proj.find_gah(parent) else {
        reply(Err(libc::ENOENT));
        return;
    };
    let Some(wire_name) = WireName::new(link_name) else {
        reply(Err(name_errno(link_name)));
        return;
    };
    let payload = encode_with_tail(
        &SymlinkIn {
            gah,
            name: wire_name,
        },
        target.as_bytes(),
    );
    let proj2 = Arc::clone(proj);
    let name = link_name.to_os_string();
    send_request(
        proj,
        OpCode::Symlink,
        payload,
        false,
        Box::new(move |result| {
            reply(result.and_then(|bytes| {
                let (out, _) = decode::<EntryOut>(&bytes).map_err(|_| libc::EIO)?;
                check_status(out.err, out.rc, || {})?;
                Ok(publish_entry(&proj2, parent, &name, out.gah, out.stat))
            }));
        }),
    );
}

pub fn open(proj: &Arc<Projection>, ino: u64, flags: i32, reply: OpReply<u64>) {
    proj.stats.open.inc();
    if flags & UNSUPPORTED_OPEN_FLAGS != 0 {
        debug!("unsupported open flags 0{flags:o}");
        reply(Err(libc::ENOTSUP));
        return;
    }
    let accmode = flags & libc::O_ACCMODE;
    if (accmode == libc::O_WRONLY || accmode == libc::O_RDWR) && !proj.is_writeable() {
        reply(Err(libc::EROFS));
        return;
    }
    let Some(gah) = proj.find_gah(ino) else {
        reply(Err(libc::ENOENT));
        return;
    };
    let payload = encode(&OpenIn {
        gah,
        flags: flags as u32,
        _pad: 0,
    });
    let proj2 = Arc::clone(proj);
    send_request(
        proj,
        OpCode::Open,
        payload,
        false,
        Box::new(move |result| {
            reply(result.and_then(|bytes| {
                let (out, _) = decode::<GahOut>(&bytes).map_err(|_| libc::EIO)?;
                check_status(out.err, out.rc, || {})?;
                Ok(proj2.register_file(OpenFile::new(out.gah, ino)))
            }));
        }),
    );
}

pub fn create(
    proj: &Arc<Projection>,
    parent: u64,
    name: &OsStr,
    mode: u32,
    flags: i32,
    reply: OpReply<(EntryData, u64)>,
) {
    if flags & UNSUPPORTED_CREATE_FLAGS != 0 {
        reply(Err(libc::ENOTSUP));
        return;
    }
    let file_type = mode & libc::S_IFMT;
    if file_type != 0 && file_type != libc::S_IFREG {
        reply(Err(libc::ENOTSUP));
        return;
    }
    if !proj.is_writeable() {
        reply(Err(libc::EROFS));
        return;
    }
    proj.stats.create.inc();
    let Some(gah) = proj.find_gah(parent) else {
        reply(Err(libc::ENOENT));
        return;
    };
    let Some(wire_name) = WireName::new(name) else {
        reply(Err(name_errno(name)));
        return;
    };
    let payload = encode(&CreateIn {
        gah,
        name: wire_name,
        mode,
        flags: flags as u32,
    });
    let proj2 = Arc::clone(proj);
    let name = name.to_os_string();
    send_request(
        proj,
        OpCode::Create,
        payload,
        false,
        Box::new(move |result| {
            reply(result.and_then(|bytes| {
                let (out, _) = decode::<CreateOut>(&bytes).map_err(|_| libc::EIO)?;
                check_status(out.err, out.rc, || {})?;
                let entry = publish_entry(&proj2, parent, &name, out.igah, out.stat);
                let fh = proj2.register_file(OpenFile::new(out.gah, out.stat.ino));
                Ok((entry, fh))
            }));
        }),
    );
}

pub fn read(
    proj: &Arc<Projection>,
    fh: u64,
    offset: i64,
    size: u32,
    reply: OpReply<Vec<u8>>,
) {
    proj.stats.read.inc();
    let Some(file) = proj.file(fh) else {
        reply(Err(libc::EBADF));
        return;
    };
    if !file.is_valid() {
        reply(Err(libc::EIO));
        return;
    }
    let pool = if size as usize <= super::page_threshold() {
        &proj.rb_pool_page
    } else {
        &proj.rb_pool_large
    };
    let Some(rb) = pool.acquire() else {
        reply(Err(libc::ENOMEM));
        return;
    };
    let payload = encode(&ReadxIn {
        gah: file.gah(),
        xtvec: Xtvec {
            off: offset,
            len: size as u64,
        },
        xtvec_len: 0,
        bulk_len: 0,
        xtvec_bulk: 0,
        data_bulk: rb.bulk_id,
    });
    let proj2 = Arc::clone(proj);
    let pool2 = Arc::clone(pool);
    send_request(
        proj,
        OpCode::Readx,
        payload,
        false,
        Box::new(move |result| {
            let outcome = result.and_then(|bytes| {
                let (out, tail) = decode::<ReadxOut>(&bytes).map_err(|_| libc::EIO)?;
                check_status(out.err, out.rc, || file.set_invalid())?;
                let data = if out.iov_len > 0 {
                    if tail.len() < out.iov_len as usize {
                        return Err(libc::EIO);
                    }
                    tail[..out.iov_len as usize].to_vec()
                } else if out.bulk_len > 0 {
                    let buf = rb.buf.lock();
                    if buf.len() < out.bulk_len as usize {
                        return Err(libc::EIO);
                    }
                    buf[..out.bulk_len as usize].to_vec()
                } else {
                    Vec::new()
                };
                proj2.stats.read_bytes.add(data.len() as u64);
                Ok(data)
            });
            pool2.release(rb);
            reply(outcome);
        }),
    );
    pool.restock();
}

pub fn write(
    proj: &Arc<Projection>,
    fh: u64,
    offset: i64,
    data: &[u8],
    reply: OpReply<u64>,
) {
    proj.stats.write.inc();
    let Some(file) = proj.file(fh) else {
        reply(Err(libc::EBADF));
        return;
    };
    if !file.is_valid() {
        reply(Err(libc::EIO));
        return;
    }
    if !proj.is_writeable() {
        reply(Err(libc::EROFS));
        return;
    }
    if data.len() > proj.max_write as usize {
        reply(Err(libc::EFBIG));
        return;
    }
    let mut input = WritexIn {
        gah: file.gah(),
        xtvec: Xtvec {
            off: offset,
            len: data.len() as u64,
        },
        xtvec_len: 0,
        bulk_len: 0,
        xtvec_bulk: 0,
        data_bulk: 0,
    };
    let (payload, wb) = if data.len() < proj.max_iov_write as usize {
        (encode_with_tail(&input, data), None)
    } else {
        let Some(wb) = proj.wb_pool.acquire() else {
            reply(Err(libc::ENOMEM));
            return;
        };
        {
            let mut buf = wb.buf.lock();
            buf[..data.len()].copy_from_slice(data);
        }
        input.bulk_len = data.len() as u64;
        input.data_bulk = wb.bulk_id;
        (encode(&input), Some(wb))
    };
    let proj2 = Arc::clone(proj);
    send_request(
        proj,
        OpCode::Writex,
        payload,
        false,
        Box::new(move |result| {
            let outcome = result.and_then(|bytes| {
                let (out, _) = decode::<WritexOut>(&bytes).map_err(|_| libc::EIO)?;
                check_status(out.err, out.rc, || file.set_invalid())?;
                proj2.stats.write_bytes.add(out.len);
                Ok(out.len)
            });
            if let Some(wb) = wb {
                proj2.wb_pool.release(wb);
            }
            reply(outcome);
        }),
    );
    proj.wb_pool.restock();
}

/// Free the handle unconditionally; only a valid GAH is worth a close
/// RPC, and the kernel gets success regardless.
pub fn release(proj: &Arc<Projection>, fh: u64) {
    proj.stats.release.inc();
    match proj.remove_file(fh) {
        Some(file) if file.is_valid() => proj.send_close(OpCode::Close, file.gah(), None),
        Some(_) => debug!("releasing invalidated handle {fh}"),
        None => warn!("release of unknown fh {fh}"),
    }
}

pub fn fsync(proj: &Arc<Projection>, fh: u64, datasync: bool, reply: OpReply<()>) {
    proj.stats.fsync.inc();
    let Some(file) = proj.file(fh) else {
        reply(Err(libc::EBADF));
        return;
    };
    if !file.is_valid() {
        reply(Err(libc::EIO));
        return;
    }
    let op = if datasync {
        OpCode::Fdatasync
    } else {
        OpCode::Fsync
    };
    send_request(
        proj,
        op,
        encode(&GahIn { gah: file.gah() }),
        false,
        Box::new(move |result| {
            reply(result.and_then(|bytes| {
                let (out, _) = decode::<StatusOut>(&bytes).map_err(|_| libc::EIO)?;
                check_status(out.err, out.rc, || file.set_invalid())
            }));
        }),
    );
}

pub fn opendir(proj: &Arc<Projection>, ino: u64, reply: OpReply<u64>) {
    proj.stats.opendir.inc();
    let Some(gah) = proj.find_gah(ino) else {
        reply(Err(libc::ENOENT));
        return;
    };
    let proj2 = Arc::clone(proj);
    send_request(
        proj,
        OpCode::Opendir,
        encode(&GahIn { gah }),
        false,
        Box::new(move |result| {
            reply(result.and_then(|bytes| {
                let (out, _) = decode::<GahOut>(&bytes).map_err(|_| libc::EIO)?;
                check_status(out.err, out.rc, || {})?;
                let dir = OpenDir::new(
                    &proj2.ctx,
                    out.gah,
                    ino,
                    proj2.readdir_size as usize,
                );
                Ok(proj2.register_dir(dir))
            }));
        }),
    );
}

/// Hand back the currently cached batch for `fh`, fetching a new batch
/// from the server when the cache is empty. The caller consumes entries
/// it actually delivered via [`readdir_consume`].
pub fn readdir(
    proj: &Arc<Projection>,
    fh: u64,
    offset: i64,
    reply: OpReply<(Vec<ClientDirent>, bool)>,
) {
    proj.stats.readdir.inc();
    let Some(dir) = proj.dir(fh) else {
        reply(Err(libc::EBADF));
        return;
    };
    if !dir.is_valid() {
        reply(Err(libc::EIO));
        return;
    }
    let fetch_offset = {
        let mut state = dir.state.lock();
        if !state.valid {
            reply(Err(libc::EIO));
            return;
        }
        if offset == 0 && state.cursor != 0 {
            // rewinddir: restart the server-side stream.
            state.entries.clear();
            state.cursor = 0;
            state.last = false;
        }
        if !state.entries.is_empty() {
            let batch: Vec<ClientDirent> = state.entries.iter().cloned().collect();
            let last = state.last;
            drop(state);
            reply(Ok((batch, last)));
            return;
        }
        if state.last {
            reply(Ok((Vec::new(), true)));
            return;
        }
        state.rpcs += 1;
        state.cursor
    };

    let payload = encode(&ReaddirIn {
        gah: dir.gah(),
        bulk: dir.bulk_id,
        offset: fetch_offset,
    });
    let dir2 = Arc::clone(&dir);
    send_request(
        proj,
        OpCode::Readdir,
        payload,
        false,
        Box::new(move |result| {
            let outcome = result.and_then(|bytes| {
                let (out, tail) = decode::<ReaddirOut>(&bytes).map_err(|_| libc::EIO)?;
                if out.err != 0 {
                    let mut state = dir2.state.lock();
                    state.valid = false;
                    drop(state);
                    return check_status(out.err, 0, || dir2.set_invalid()).map(|_| (Vec::new(), true));
                }
                let count = if out.iov_count > 0 {
                    out.iov_count as usize
                } else {
                    out.bulk_count as usize
                };
                let bulk_guard;
                let mut src: &[u8] = if out.iov_count > 0 {
                    tail
                } else {
                    bulk_guard = dir2.buf.lock();
                    &bulk_guard[..]
                };
                let mut state = dir2.state.lock();
                for _ in 0..count {
                    let (entry, rest) =
                        WireDirent::read_from_prefix(src).map_err(|_| libc::EIO)?;
                    src = rest;
                    if entry.read_rc != 0 {
                        state.valid = false;
                        return Err(entry.read_rc);
                    }
                    if entry.stat_rc != 0 {
                        debug!(
                            "skipping unstattable entry {:?}: {}",
                            entry.name, entry.stat_rc
                        );
                        state.cursor = entry.nextoff as u64;
                        continue;
                    }
                    state.entries.push_back(ClientDirent {
                        ino: entry.stat.ino,
                        mode: entry.stat.mode,
                        name: entry.name.as_os_str().to_os_string(),
                        nextoff: entry.nextoff,
                    });
                    state.cursor = entry.nextoff as u64;
                }
                state.last = out.last != 0;
                Ok((state.entries.iter().cloned().collect(), state.last))
            });
            reply(outcome);
        }),
    );
}

/// Drop the first `count` cached entries after they were delivered.
pub fn readdir_consume(proj: &Arc<Projection>, fh: u64, count: usize) {
    if let Some(dir) = proj.dir(fh) {
        let mut state = dir.state.lock();
        for _ in 0..count {
            state.entries.pop_front();
        }
    }
}

pub fn releasedir(proj: &Arc<Projection>, fh: u64) {
    proj.stats.closedir.inc();
    match proj.remove_dir(fh) {
        Some(dir) if dir.is_valid() => proj.send_close(OpCode::Closedir, dir.gah(), None),
        Some(_) => debug!("releasing invalidated dir handle {fh}"),
        None => warn!("releasedir of unknown fh {fh}"),
    }
}

pub fn statfs(proj: &Arc<Projection>, ino: u64, reply: OpReply<WireStatvfs>) {
    proj.stats.statfs.inc();
    let Some(gah) = proj.find_gah(ino) else {
        reply(Err(libc::ENOENT));
        return;
    };
    send_request(
        proj,
        OpCode::Statfs,
        encode(&GahIn { gah }),
        true,
        Box::new(move |result| {
            reply(result.and_then(|bytes| {
                let (out, _) = decode::<StatfsOut>(&bytes).map_err(|_| libc::EIO)?;
                check_status(out.err, out.rc, || {})?;
                Ok(out.stat)
            }));
        }),
    );
}
