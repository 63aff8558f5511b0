//! FUSE lowlevel dispatcher.
//!
//! Adapts kernel upcalls onto the operation core: every callback resolves
//! its arguments, hands a boxed continuation to [`ops`], and the reply
//! object travels into the completion running on the projection's
//! progress thread. Attribute and entry timeouts are zero; the client
//! does not cache attributes or data.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyIoctl, ReplyOpen, ReplyStatfs, ReplyWrite,
    Request, TimeOrNow,
};
use log::{debug, warn};
use zerocopy::IntoBytes;

use crate::proto::SetattrFlags;
use crate::proto::wire::{GAH_INFO_VERSION, GAH_IOCTL_CMD, GahInfo, WireStat};

use super::{Projection, ops};

const TTL: Duration = Duration::ZERO;

pub struct CnssFuse {
    proj: Arc<Projection>,
}

impl CnssFuse {
    pub fn new(proj: Arc<Projection>) -> CnssFuse {
        CnssFuse { proj }
    }

    /// Mount the projection on a dedicated session thread.
    pub fn mount(
        proj: Arc<Projection>,
        mountpoint: &Path,
    ) -> std::io::Result<fuser::BackgroundSession> {
        let mut options = vec![
            MountOption::FSName("projfs".to_string()),
            MountOption::AutoUnmount,
            MountOption::DefaultPermissions,
        ];
        if !proj.is_writeable() {
            options.push(MountOption::RO);
        }
        fuser::spawn_mount2(CnssFuse::new(proj), mountpoint, &options)
    }
}

fn kind_of(mode: u32) -> FileType {
    WireStat {
        mode,
        ..WireStat::default()
    }
    .file_type()
}

fn unix_time(time: SystemTime) -> (i64, u32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(e) => (-(e.duration().as_secs() as i64), 0),
    }
}

impl Filesystem for CnssFuse {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), libc::c_int> {
        if let Err(allowed) = config.set_max_write(self.proj.max_write) {
            warn!("kernel capped max_write at {allowed}");
        }
        debug!("projection {} session initialized", self.proj.fs_id);
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("projection {} session destroyed", self.proj.fs_id);
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        ops::lookup(
            &self.proj,
            parent,
            name,
            Box::new(move |result| match result {
                Ok(entry) => reply.entry(&TTL, &entry.attr, entry.generation),
                Err(errno) => reply.error(errno),
            }),
        );
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        ops::forget(&self.proj, ino, nlookup);
    }

    fn getattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: Option<u64>,
        reply: ReplyAttr,
    ) {
        ops::getattr(
            &self.proj,
            ino,
            fh,
            Box::new(move |result| match result {
                Ok(attr) => reply.attr(&TTL, &attr),
                Err(errno) => reply.error(errno),
            }),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let mut stat = WireStat::default();
        let mut to_set = SetattrFlags::empty();
        if let Some(mode) = mode {
            stat.mode = mode;
            to_set |= SetattrFlags::MODE;
        }
        if let Some(uid) = uid {
            stat.uid = uid;
            to_set |= SetattrFlags::UID;
        }
        if let Some(gid) = gid {
            stat.gid = gid;
            to_set |= SetattrFlags::GID;
        }
        if let Some(size) = size {
            stat.size = size as i64;
            to_set |= SetattrFlags::SIZE;
        }
        match atime {
            Some(TimeOrNow::SpecificTime(time)) => {
                (stat.atime, stat.atime_nsec) = unix_time(time);
                to_set |= SetattrFlags::ATIME;
            }
            Some(TimeOrNow::Now) => to_set |= SetattrFlags::ATIME_NOW,
            None => {}
        }
        match mtime {
            Some(TimeOrNow::SpecificTime(time)) => {
                (stat.mtime, stat.mtime_nsec) = unix_time(time);
                to_set |= SetattrFlags::MTIME;
            }
            Some(TimeOrNow::Now) => to_set |= SetattrFlags::MTIME_NOW,
            None => {}
        }
        ops::setattr(
            &self.proj,
            ino,
            fh,
            stat,
            to_set,
            Box::new(move |result| match result {
                Ok(attr) => reply.attr(&TTL, &attr),
                Err(errno) => reply.error(errno),
            }),
        );
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        ops::readlink(
            &self.proj,
            ino,
            Box::new(move |result| match result {
                Ok(path) => reply.data(&path),
                Err(errno) => reply.error(errno),
            }),
        );
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        ops::mkdir(
            &self.proj,
            parent,
            name,
            mode,
            Box::new(move |result| match result {
                Ok(entry) => reply.entry(&TTL, &entry.attr, entry.generation),
                Err(errno) => reply.error(errno),
            }),
        );
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        ops::unlink(
            &self.proj,
            parent,
            name,
            Box::new(move |result| match result {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }),
        );
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        ops::rmdir(
            &self.proj,
            parent,
            name,
            Box::new(move |result| match result {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }),
        );
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        ops::symlink(
            &self.proj,
            parent,
            link_name,
            target.as_os_str(),
            Box::new(move |result| match result {
                Ok(entry) => reply.entry(&TTL, &entry.attr, entry.generation),
                Err(errno) => reply.error(errno),
            }),
        );
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        ops::rename(
            &self.proj,
            parent,
            name,
            newparent,
            newname,
            flags,
            Box::new(move |result| match result {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }),
        );
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        ops::open(
            &self.proj,
            ino,
            flags,
            Box::new(move |result| match result {
                Ok(fh) => reply.opened(fh, 0),
                Err(errno) => reply.error(errno),
            }),
        );
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        ops::create(
            &self.proj,
            parent,
            name,
            mode,
            flags,
            Box::new(move |result| match result {
                Ok((entry, fh)) => reply.created(&TTL, &entry.attr, entry.generation, fh, 0),
                Err(errno) => reply.error(errno),
            }),
        );
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
        ops::read(
            &self.proj,
            fh,
            offset,
            size,
            Box::new(move |result| match result {
                Ok(data) => reply.data(&data),
                Err(errno) => reply.error(errno),
            }),
        );
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
        ops::write(
            &self.proj,
            fh,
            offset,
            data,
            Box::new(move |result| match result {
                Ok(written) => reply.written(written as u32),
                Err(errno) => reply.error(errno),
            }),
        );
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
        // The kernel has already committed to the close; there is no
        // remediation for a failed release RPC.
        ops::release(&self.proj, fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        ops::fsync(
            &self.proj,
            fh,
            datasync,
            Box::new(move |result| match result {
                Ok(()) => reply.ok(),
                Err(errno) => reply.error(errno),
            }),
        );
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        ops::opendir(
            &self.proj,
            ino,
            Box::new(move |result| match result {
                Ok(fh) => reply.opened(fh, 0),
                Err(errno) => reply.error(errno),
            }),
        );
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let proj = Arc::clone(&self.proj);
        ops::readdir(
            &self.proj,
            fh,
            offset,
            Box::new(move |result| match result {
                Err(errno) => reply.error(errno),
                Ok((entries, _last)) => {
                    let mut used = 0;
                    for entry in &entries {
                        if reply.add(entry.ino, entry.nextoff, kind_of(entry.mode), &entry.name)
                        {
                            break;
                        }
                        used += 1;
                    }
                    ops::readdir_consume(&proj, fh, used);
                    reply.ok();
                }
            }),
        );
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        ops::releasedir(&self.proj, fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        ops::statfs(
            &self.proj,
            ino,
            Box::new(move |result| match result {
                Ok(vfs) => reply.statfs(
                    vfs.blocks,
                    vfs.bfree,
                    vfs.bavail,
                    vfs.files,
                    vfs.ffree,
                    vfs.bsize as u32,
                    vfs.namemax as u32,
                    vfs.frsize as u32,
                ),
                Err(errno) => reply.error(errno),
            }),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn ioctl(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: u32,
        cmd: u32,
        _in_data: &[u8],
        out_size: u32,
        reply: ReplyIoctl,
    ) {
        if cmd != GAH_IOCTL_CMD {
            self.proj.stats.ioctl.inc();
            reply.error(libc::ENOTSUP);
            return;
        }
        // The interception library asking for the GAH behind an fd.
        self.proj.stats.il_ioctl.inc();
        if (out_size as usize) < std::mem::size_of::<GahInfo>() {
            reply.error(libc::EINVAL);
            return;
        }
        let Some(file) = self.proj.file(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        if !file.is_valid() {
            reply.error(libc::EIO);
            return;
        }
        let info = GahInfo {
            version: GAH_INFO_VERSION,
            gah: file.gah(),
            cnss_id: std::process::id() as i32,
            cli_fs_id: self.proj.fs_id,
        };
        reply.ioctl(0, info.as_bytes());
    }
}
