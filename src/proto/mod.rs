//! Wire protocol.
//!
//! All operations are registered under one protocol identified by a fixed
//! 32-bit base opcode and an integer version. Requests and replies are
//! fixed-layout structs (see [`wire`]) optionally followed by a variable
//! tail (inline payload bytes, readdir batches, the projection list).
//!
//! Every reply carries `{err, rc}`: `err` is an internal [`ErrCode`] and
//! `rc` is the POSIX errno to surface. The client resolves the pair with
//! one rule: a non-zero `err` becomes `EIO` (after handle invalidation if
//! the code is `GahInvalid`), a non-zero `rc` passes through to userspace.

pub mod wire;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Base opcode all operations are registered under.
pub const PROTO_BASE: u32 = 0x0100_0000;
/// Protocol version, part of every wire opcode.
pub const PROTO_VERSION: u32 = 1;

/// Operation codes, in catalog order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum OpCode {
    QueryPsr = 0,
    Detach,
    Shutdown,
    Lookup,
    Getattr,
    Setattr,
    Opendir,
    Readdir,
    Closedir,
    Open,
    Create,
    Close,
    Readx,
    Writex,
    Mkdir,
    Unlink,
    Rmdir,
    Rename,
    Symlink,
    Readlink,
    Fsync,
    Fdatasync,
    Statfs,
}

impl OpCode {
    /// Full wire opcode: base | version | operation.
    pub fn wire(self) -> u32 {
        PROTO_BASE | (PROTO_VERSION << 16) | u32::from(self)
    }

    pub fn from_wire(raw: u32) -> Option<OpCode> {
        if raw & 0xff00_0000 != PROTO_BASE {
            return None;
        }
        if (raw >> 16) & 0xff != PROTO_VERSION {
            return None;
        }
        OpCode::try_from(raw & 0xffff).ok()
    }
}

/// Internal (non-POSIX) error codes carried in the `err` reply field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum ErrCode {
    Ok = 0,
    /// The GAH failed validation; the client must invalidate local state.
    GahInvalid = 1,
    NoMem = 2,
    Internal = 3,
    /// Transport-level failure while handling the request.
    Transport = 4,
    /// Malformed input (short buffer, bad name, unknown field value).
    BadData = 5,
    NotSupported = 6,
    Overflow = 7,
}

impl ErrCode {
    pub fn raw(self) -> i32 {
        self.into()
    }
}

/// The client-side outcome of one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    /// POSIX errno to pass through to userspace.
    Errno(i32),
    /// Internal failure, surfaced as EIO.  `gah_invalid` is set when local
    /// handles must be invalidated first.
    Internal { gah_invalid: bool },
}

impl ReplyStatus {
    /// The errno to hand to the kernel, zero on success.
    pub fn errno(&self) -> i32 {
        match self {
            ReplyStatus::Ok => 0,
            ReplyStatus::Errno(rc) => *rc,
            ReplyStatus::Internal { .. } => libc::EIO,
        }
    }
}

/// Resolve an `{err, rc}` pair per the reply discipline.
pub fn resolve(err: i32, rc: i32) -> ReplyStatus {
    if err != 0 {
        ReplyStatus::Internal {
            gah_invalid: err == ErrCode::GahInvalid.raw(),
        }
    } else if rc != 0 {
        ReplyStatus::Errno(rc)
    } else {
        ReplyStatus::Ok
    }
}

bitflags::bitflags! {
    /// Per-projection feature flags, exchanged in the query reply.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FsFlags: u64 {
        const WRITEABLE      = 0x001;
        const FAILOVER       = 0x002;
        /// Run the kernel session multi-threaded on the client.
        const CNSS_MT        = 0x080;
        /// Reply to reads with a plain buffer copy instead of splice.
        const FUSE_READ_BUF  = 0x100;
        /// Gather writes through the kernel buffer-copy path.
        const FUSE_WRITE_BUF = 0x200;
    }
}

bitflags::bitflags! {
    /// Which fields of a setattr request are to be applied.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SetattrFlags: u32 {
        const MODE      = 1 << 0;
        const UID       = 1 << 1;
        const GID       = 1 << 2;
        const SIZE      = 1 << 3;
        const ATIME     = 1 << 4;
        const MTIME     = 1 << 5;
        const ATIME_NOW = 1 << 7;
        const MTIME_NOW = 1 << 8;
    }
}

/// Decode the fixed part of a message, returning it with the tail.
pub fn decode<T: FromBytes>(buf: &[u8]) -> Result<(T, &[u8]), ErrCode> {
    T::read_from_prefix(buf).map_err(|_| ErrCode::BadData)
}

/// Encode a fixed struct followed by a variable tail.
pub fn encode_with_tail<T: IntoBytes + Immutable>(msg: &T, tail: &[u8]) -> Vec<u8> {
    let fixed = msg.as_bytes();
    let mut buf = Vec::with_capacity(fixed.len() + tail.len());
    buf.extend_from_slice(fixed);
    buf.extend_from_slice(tail);
    buf
}

/// Encode a fixed struct with no tail.
pub fn encode<T: IntoBytes + Immutable>(msg: &T) -> Vec<u8> {
    msg.as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_opcode_round_trip() {
        for op in [OpCode::QueryPsr, OpCode::Readx, OpCode::Statfs] {
            assert_eq!(OpCode::from_wire(op.wire()), Some(op));
        }
        assert_eq!(OpCode::from_wire(0x0200_0000), None);
        assert_eq!(OpCode::from_wire(PROTO_BASE | 0xffff), None);
    }

    #[test]
    fn reply_discipline() {
        assert_eq!(resolve(0, 0), ReplyStatus::Ok);
        assert_eq!(resolve(0, libc::ENOENT), ReplyStatus::Errno(libc::ENOENT));
        assert_eq!(
            resolve(ErrCode::Internal.raw(), 0),
            ReplyStatus::Internal { gah_invalid: false }
        );
        let st = resolve(ErrCode::GahInvalid.raw(), libc::ENOENT);
        assert_eq!(st, ReplyStatus::Internal { gah_invalid: true });
        assert_eq!(st.errno(), libc::EIO);
    }
}
