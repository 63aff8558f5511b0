//! Fixed-layout request and reply bodies.
//!
//! Every struct here is `repr(C)` with explicit padding so the zerocopy
//! derives hold and the encoding is bit-exact across builds. GAHs are
//! serialized verbatim as their 16 raw bytes; names are fixed 256-byte
//! NUL-terminated buffers bounded by `NAME_MAX`.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::gah::Gah;

pub const NAME_MAX: usize = 255;

/// Identifier of a registered bulk buffer, zero when absent.
pub type BulkId = u64;

/// A basename carried on the wire: NUL-terminated, at most `NAME_MAX`
/// bytes of payload.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WireName {
    bytes: [u8; NAME_MAX + 1],
}

impl WireName {
    pub const EMPTY: WireName = WireName {
        bytes: [0u8; NAME_MAX + 1],
    };

    /// Fails on empty names, embedded NULs, slashes and oversized names.
    pub fn new(name: &OsStr) -> Option<WireName> {
        let raw = name.as_bytes();
        if raw.is_empty() || raw.len() > NAME_MAX {
            return None;
        }
        if memchr::memchr2(0, b'/', raw).is_some() {
            return None;
        }
        let mut bytes = [0u8; NAME_MAX + 1];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(WireName { bytes })
    }

    pub fn as_os_str(&self) -> &OsStr {
        let len = memchr::memchr(0, &self.bytes).unwrap_or(self.bytes.len());
        OsStr::from_bytes(&self.bytes[..len])
    }

    pub fn is_empty(&self) -> bool {
        self.bytes[0] == 0
    }
}

impl std::fmt::Debug for WireName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_os_str())
    }
}

/// File attributes on the wire.  Only the inode number and type are
/// trusted across time by the client; the rest is advisory.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WireStat {
    pub ino: u64,
    pub size: i64,
    pub blocks: i64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub atime_nsec: u32,
    pub mtime_nsec: u32,
    pub ctime_nsec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub blksize: u32,
    pub rdev: u64,
}

impl WireStat {
    pub fn from_host(st: &libc::stat) -> WireStat {
        WireStat {
            ino: st.st_ino,
            size: st.st_size,
            blocks: st.st_blocks,
            atime: st.st_atime,
            mtime: st.st_mtime,
            ctime: st.st_ctime,
            atime_nsec: st.st_atime_nsec as u32,
            mtime_nsec: st.st_mtime_nsec as u32,
            ctime_nsec: st.st_ctime_nsec as u32,
            mode: st.st_mode,
            nlink: st.st_nlink as u32,
            uid: st.st_uid,
            gid: st.st_gid,
            blksize: st.st_blksize as u32,
            rdev: st.st_rdev,
        }
    }

    pub fn file_type(&self) -> fuser::FileType {
        match self.mode & libc::S_IFMT {
            libc::S_IFDIR => fuser::FileType::Directory,
            libc::S_IFLNK => fuser::FileType::Symlink,
            libc::S_IFCHR => fuser::FileType::CharDevice,
            libc::S_IFBLK => fuser::FileType::BlockDevice,
            libc::S_IFIFO => fuser::FileType::NamedPipe,
            libc::S_IFSOCK => fuser::FileType::Socket,
            _ => fuser::FileType::RegularFile,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    fn time(secs: i64, nsec: u32) -> SystemTime {
        if secs >= 0 {
            UNIX_EPOCH + Duration::new(secs as u64, nsec)
        } else {
            UNIX_EPOCH - Duration::from_secs((-secs) as u64)
        }
    }

    pub fn to_attr(&self) -> fuser::FileAttr {
        fuser::FileAttr {
            ino: self.ino,
            size: self.size.max(0) as u64,
            blocks: self.blocks.max(0) as u64,
            atime: Self::time(self.atime, self.atime_nsec),
            mtime: Self::time(self.mtime, self.mtime_nsec),
            ctime: Self::time(self.ctime, self.ctime_nsec),
            crtime: UNIX_EPOCH,
            kind: self.file_type(),
            perm: (self.mode & 0o7777) as u16,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev as u32,
            blksize: self.blksize,
            flags: 0,
        }
    }
}

/// A file extent: offset plus length.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Xtvec {
    pub off: i64,
    pub len: u64,
}

// ---- Requests ----

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GahIn {
    pub gah: Gah,
}

/// Operations addressing a child of a directory by name.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GahNameIn {
    pub gah: Gah,
    pub name: WireName,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct OpenIn {
    pub gah: Gah,
    pub flags: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CreateIn {
    pub gah: Gah,
    pub name: WireName,
    pub mode: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct UnlinkIn {
    pub name: WireName,
    pub gah: Gah,
    pub flags: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RenameIn {
    pub old_gah: Gah,
    pub new_gah: Gah,
    pub old_name: WireName,
    pub new_name: WireName,
    pub flags: u32,
    pub _pad: u32,
}

/// Symlink creation: the link name is fixed, the target path rides in the
/// message tail.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SymlinkIn {
    pub gah: Gah,
    pub name: WireName,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReaddirIn {
    pub gah: Gah,
    pub bulk: BulkId,
    pub offset: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReadxIn {
    pub gah: Gah,
    pub xtvec: Xtvec,
    pub xtvec_len: u64,
    pub bulk_len: u64,
    pub xtvec_bulk: BulkId,
    pub data_bulk: BulkId,
}

/// Write request; payloads under the iov threshold ride in the tail,
/// larger ones are fetched from `data_bulk`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WritexIn {
    pub gah: Gah,
    pub xtvec: Xtvec,
    pub xtvec_len: u64,
    pub bulk_len: u64,
    pub xtvec_bulk: BulkId,
    pub data_bulk: BulkId,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SetattrIn {
    pub gah: Gah,
    pub stat: WireStat,
    pub to_set: u32,
    pub _pad: u32,
}

// ---- Replies ----

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StatusOut {
    pub rc: i32,
    pub err: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GahOut {
    pub gah: Gah,
    pub rc: i32,
    pub err: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct EntryOut {
    pub gah: Gah,
    pub stat: WireStat,
    pub rc: i32,
    pub err: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CreateOut {
    pub gah: Gah,
    pub igah: Gah,
    pub stat: WireStat,
    pub rc: i32,
    pub err: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct AttrOut {
    pub stat: WireStat,
    pub rc: i32,
    pub err: i32,
}

/// Read reply: exactly one of `iov_len` (inline tail) or `bulk_len`
/// (payload already PUT into the caller's buffer) is non-zero on success.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReadxOut {
    pub bulk_len: u64,
    pub iov_len: u32,
    pub rc: i32,
    pub err: i32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WritexOut {
    pub len: u64,
    pub rc: i32,
    pub err: i32,
}

/// Readlink reply; the target path is the message tail.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StringOut {
    pub rc: i32,
    pub err: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WireStatvfs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub flag: u64,
    pub namemax: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StatfsOut {
    pub stat: WireStatvfs,
    pub rc: i32,
    pub err: i32,
}

/// Readdir reply header.  `iov_count` entries ride in the tail, or
/// `bulk_count` entries were PUT into the caller's readdir buffer.
/// `last == 1` marks the end of the stream.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReaddirOut {
    pub last: i32,
    pub iov_count: i32,
    pub bulk_count: i32,
    pub err: i32,
}

/// One directory entry in a readdir batch.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WireDirent {
    pub name: WireName,
    pub stat: WireStat,
    /// Server-side cursor to resume after this entry.
    pub nextoff: i64,
    pub read_rc: i32,
    pub stat_rc: i32,
}

pub const DIRENT_SIZE: usize = std::mem::size_of::<WireDirent>();

/// Query reply header, followed by `count` [`FsInfo`] records.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct QueryOut {
    pub count: u32,
    pub poll_interval: u32,
    pub progress_cb: u32,
    pub _pad: u32,
}

/// One projection as advertised by the server.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FsInfo {
    pub dir_name: WireName,
    pub gah: Gah,
    pub flags: u64,
    pub max_read: u32,
    pub max_write: u32,
    pub readdir_size: u32,
    pub max_iov_read: u32,
    pub max_iov_write: u32,
    pub id: u32,
}

// ---- IOCTL ----

/// Payload of the one supported ioctl: lets the interception library
/// discover the GAH behind an open file descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GahInfo {
    pub version: u32,
    pub gah: Gah,
    pub cnss_id: i32,
    pub cli_fs_id: u32,
}

pub const GAH_INFO_VERSION: u32 = 1;

/// `_IOR('p', 1, GahInfo)`
pub const GAH_IOCTL_CMD: u32 =
    (2u32 << 30) | ((std::mem::size_of::<GahInfo>() as u32) << 16) | ((b'p' as u32) << 8) | 1;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{decode, encode_with_tail};

    #[test]
    fn name_rules() {
        assert!(WireName::new(OsStr::new("")).is_none());
        assert!(WireName::new(OsStr::new("a/b")).is_none());
        assert!(WireName::new(OsStr::new(&"x".repeat(256))).is_none());
        let n = WireName::new(OsStr::new(&"x".repeat(255))).unwrap();
        assert_eq!(n.as_os_str().len(), 255);
        let n = WireName::new(OsStr::new("hello")).unwrap();
        assert_eq!(n.as_os_str(), OsStr::new("hello"));
        assert!(!n.is_empty());
        assert!(WireName::EMPTY.is_empty());
    }

    #[test]
    fn struct_sizes_are_stable() {
        use std::mem::size_of;
        assert_eq!(size_of::<WireStat>(), 88);
        assert_eq!(size_of::<GahNameIn>(), 272);
        assert_eq!(size_of::<RenameIn>(), 552);
        assert_eq!(size_of::<ReadxIn>(), 64);
        assert_eq!(size_of::<WritexIn>(), 64);
        assert_eq!(size_of::<EntryOut>(), 112);
        assert_eq!(size_of::<CreateOut>(), 128);
        assert_eq!(size_of::<WireDirent>(), 360);
        assert_eq!(size_of::<FsInfo>(), 304);
        assert_eq!(size_of::<GahInfo>(), 28);
    }

    #[test]
    fn tail_carries_payload() {
        let msg = WritexIn {
            gah: Gah::NULL,
            xtvec: Xtvec { off: 8, len: 5 },
            xtvec_len: 0,
            bulk_len: 0,
            xtvec_bulk: 0,
            data_bulk: 0,
        };
        let buf = encode_with_tail(&msg, b"hello");
        let (decoded, tail): (WritexIn, &[u8]) = decode(&buf).unwrap();
        assert_eq!(decoded.xtvec.off, 8);
        assert_eq!(tail, b"hello");
    }

    #[test]
    fn mode_to_file_type() {
        let mut st = WireStat::default();
        st.mode = libc::S_IFDIR | 0o755;
        assert_eq!(st.file_type(), fuser::FileType::Directory);
        assert!(st.is_dir());
        st.mode = libc::S_IFREG | 0o644;
        assert_eq!(st.file_type(), fuser::FileType::RegularFile);
        assert_eq!(st.to_attr().perm, 0o644);
    }
}
