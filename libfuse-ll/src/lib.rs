//! Low-level FUSE binding.
//!
//! `libfuse-ll` sits between the kernel FUSE protocol and code that implements
//! filesystem semantics. Kernel messages are decoded into a single-use
//! [`Request`][raw::Request] handle plus a typed [`Operation`][raw::Operation],
//! routed through an [`OperationTable`][raw::OperationTable] and answered by
//! exactly one reply written back in the binary layout the kernel expects.
//!
//! The crate does not implement any filesystem by itself. A filesystem
//! registers handlers for the operations it supports; anything left
//! unregistered is answered with `ENOSYS`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use libfuse_ll::raw::{op, OperationTable, Session};
//! use libfuse_ll::Errno;
//!
//! # async fn demo(transport: libfuse_ll::raw::ChannelTransport) {
//! let mut table = OperationTable::new();
//! table.on::<op::Lookup, _>(|_fs: &Arc<()>, req, _args| {
//!     req.reply_err(Errno::new_not_exist());
//! });
//!
//! Session::new(transport, table, ())
//!     .run()
//!     .await
//!     .expect("session failed");
//! # }
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use errno::Errno;
pub use error::SessionError;
pub use mount_options::MountOptions;

mod errno;
mod error;
mod helper;
mod mount_options;
pub mod raw;

/// Per-request result, failing with an errno sent back to the kernel.
pub type Result<T> = std::result::Result<T, Errno>;

/// Inode number as seen by the kernel.
pub type Inode = u64;

/// The inode number of the filesystem root.
pub const ROOT_INODE: Inode = 1;

/// File types.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FileType {
    /// Named pipe (S_IFIFO)
    NamedPipe,
    /// Character device (S_IFCHR)
    CharDevice,
    /// Block device (S_IFBLK)
    BlockDevice,
    /// Directory (S_IFDIR)
    Directory,
    /// Regular file (S_IFREG)
    RegularFile,
    /// Symbolic link (S_IFLNK)
    Symlink,
    /// Unix domain socket (S_IFSOCK)
    Socket,
}

impl FileType {
    /// The `S_IFMT` bits of this file type.
    pub const fn mode_bits(self) -> u32 {
        match self {
            FileType::NamedPipe => libc::S_IFIFO as u32,
            FileType::CharDevice => libc::S_IFCHR as u32,
            FileType::BlockDevice => libc::S_IFBLK as u32,
            FileType::Directory => libc::S_IFDIR as u32,
            FileType::RegularFile => libc::S_IFREG as u32,
            FileType::Symlink => libc::S_IFLNK as u32,
            FileType::Socket => libc::S_IFSOCK as u32,
        }
    }

    /// The `d_type` value used in directory listings.
    pub const fn dirent_type(self) -> u32 {
        self.mode_bits() >> 12
    }

    /// Recover a file type from the `S_IFMT` bits of `mode`.
    pub fn from_mode(mode: u32) -> Option<Self> {
        let kind = match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
            m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
            m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
            m if m == libc::S_IFDIR as u32 => FileType::Directory,
            m if m == libc::S_IFREG as u32 => FileType::RegularFile,
            m if m == libc::S_IFLNK as u32 => FileType::Symlink,
            m if m == libc::S_IFSOCK as u32 => FileType::Socket,
            _ => return None,
        };
        Some(kind)
    }
}

/// A point in time as carried by the protocol: seconds plus nanoseconds.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: u32,
}

impl Timestamp {
    pub const fn new(sec: i64, nsec: u32) -> Self {
        Self { sec, nsec }
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp::new(d.as_secs() as i64, d.subsec_nanos()),
            Err(e) => {
                let d = e.duration();
                if d.subsec_nanos() == 0 {
                    Timestamp::new(-(d.as_secs() as i64), 0)
                } else {
                    Timestamp::new(-(d.as_secs() as i64) - 1, 1_000_000_000 - d.subsec_nanos())
                }
            }
        }
    }
}

impl From<Timestamp> for SystemTime {
    fn from(ts: Timestamp) -> Self {
        if ts.sec >= 0 {
            UNIX_EPOCH + Duration::new(ts.sec as u64, ts.nsec)
        } else {
            UNIX_EPOCH - Duration::from_secs(ts.sec.unsigned_abs())
                + Duration::from_nanos(ts.nsec as u64)
        }
    }
}

/// Attribute changes requested by `setattr`. Unset fields are `None`.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub lock_owner: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
    pub ctime: Option<Timestamp>,
    pub fh: Option<u64>,
}

/// A time that is either explicit or "the current time on the server".
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimeOrNow {
    Specific(Timestamp),
    Now,
}
