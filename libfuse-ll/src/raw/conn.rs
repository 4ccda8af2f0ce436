use bitflags::bitflags;
use nix::unistd::{sysconf, SysconfVar};

use crate::raw::abi::*;
use crate::SessionError;

/// Largest write the session accepts; the device read buffer is sized for it.
pub const MAX_WRITE_SIZE: u32 = 1024 * 1024;

const MIN_WRITE_SIZE: u32 = 4096;
const DEFAULT_MAX_BACKGROUND: u16 = 16;
const DEFAULT_CONGESTION_THRESHOLD: u16 = 12;

bitflags! {
    /// Capability bits exchanged in the INIT handshake.
    ///
    /// The bit values are the kernel's own, so a set can be written into the
    /// INIT reply as is.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct CapabilityFlags: u32 {
        const ASYNC_READ = FUSE_ASYNC_READ;
        const POSIX_LOCKS = FUSE_POSIX_LOCKS;
        const FILE_OPS = FUSE_FILE_OPS;
        const ATOMIC_O_TRUNC = FUSE_ATOMIC_O_TRUNC;
        const EXPORT_SUPPORT = FUSE_EXPORT_SUPPORT;
        const BIG_WRITES = FUSE_BIG_WRITES;
        const DONT_MASK = FUSE_DONT_MASK;
        const SPLICE_WRITE = FUSE_SPLICE_WRITE;
        const SPLICE_MOVE = FUSE_SPLICE_MOVE;
        const SPLICE_READ = FUSE_SPLICE_READ;
        const FLOCK_LOCKS = FUSE_FLOCK_LOCKS;
        const HAS_IOCTL_DIR = FUSE_HAS_IOCTL_DIR;
        const AUTO_INVAL_DATA = FUSE_AUTO_INVAL_DATA;
        const DO_READDIRPLUS = FUSE_DO_READDIRPLUS;
        const READDIRPLUS_AUTO = FUSE_READDIRPLUS_AUTO;
        const ASYNC_DIO = FUSE_ASYNC_DIO;
        const WRITEBACK_CACHE = FUSE_WRITEBACK_CACHE;
        const NO_OPEN_SUPPORT = FUSE_NO_OPEN_SUPPORT;
        const PARALLEL_DIROPS = FUSE_PARALLEL_DIROPS;
        const HANDLE_KILLPRIV = FUSE_HANDLE_KILLPRIV;
        const POSIX_ACL = FUSE_POSIX_ACL;
        const ABORT_ERROR = FUSE_ABORT_ERROR;
        const MAX_PAGES = FUSE_MAX_PAGES;
        const CACHE_SYMLINKS = FUSE_CACHE_SYMLINKS;
        const NO_OPENDIR_SUPPORT = FUSE_NO_OPENDIR_SUPPORT;
        const EXPLICIT_INVAL_DATA = FUSE_EXPLICIT_INVAL_DATA;
        const MAP_ALIGNMENT = FUSE_MAP_ALIGNMENT;
    }
}

impl CapabilityFlags {
    /// Capabilities enabled when the kernel offers them and the init handler
    /// does not say otherwise.
    pub const DEFAULT_WANT: Self = Self::ASYNC_READ
        .union(Self::BIG_WRITES)
        .union(Self::ATOMIC_O_TRUNC)
        .union(Self::AUTO_INVAL_DATA)
        .union(Self::ASYNC_DIO)
        .union(Self::PARALLEL_DIROPS)
        .union(Self::MAX_PAGES);
}

/// Connection parameters as seen by the init handler.
///
/// The protocol version and the `capable` set come from the kernel and are
/// read only. Everything else may be adjusted before the handler returns;
/// the result is validated and frozen into a [`ConnectionInfo`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    proto_major: u32,
    proto_minor: u32,
    capable: CapabilityFlags,
    want: CapabilityFlags,
    max_readahead: u32,
    max_write: u32,
    max_read: u32,
    max_background: u16,
    congestion_threshold: u16,
    time_gran: u32,
}

impl ConnectionConfig {
    pub(crate) fn new(init: &fuse_init_in, proto_minor: u32) -> Self {
        // Unknown bits from newer kernels are dropped so `want` can never
        // carry something this crate does not understand.
        let capable = CapabilityFlags::from_bits_truncate(init.flags);

        Self {
            proto_major: init.major,
            proto_minor,
            capable,
            want: capable & CapabilityFlags::DEFAULT_WANT,
            max_readahead: init.max_readahead,
            max_write: MAX_WRITE_SIZE,
            max_read: 0,
            max_background: DEFAULT_MAX_BACKGROUND,
            congestion_threshold: DEFAULT_CONGESTION_THRESHOLD,
            time_gran: 1,
        }
    }

    pub fn proto_major(&self) -> u32 {
        self.proto_major
    }

    pub fn proto_minor(&self) -> u32 {
        self.proto_minor
    }

    /// Capabilities offered by the kernel.
    pub fn capable(&self) -> CapabilityFlags {
        self.capable
    }

    pub fn want(&self) -> CapabilityFlags {
        self.want
    }

    /// Replace the wanted capabilities. Bits outside [`capable`][Self::capable]
    /// make the handshake fail.
    pub fn set_want(&mut self, want: CapabilityFlags) -> &mut Self {
        self.want = want;
        self
    }

    pub fn add_want(&mut self, want: CapabilityFlags) -> &mut Self {
        self.want |= want;
        self
    }

    pub fn remove_want(&mut self, want: CapabilityFlags) -> &mut Self {
        self.want -= want;
        self
    }

    pub fn max_readahead(&self) -> u32 {
        self.max_readahead
    }

    /// Lower the readahead window; values above the kernel proposal are ignored.
    pub fn set_max_readahead(&mut self, max_readahead: u32) -> &mut Self {
        self.max_readahead = max_readahead;
        self
    }

    pub fn max_write(&self) -> u32 {
        self.max_write
    }

    pub fn set_max_write(&mut self, max_write: u32) -> &mut Self {
        self.max_write = max_write;
        self
    }

    /// Largest read the filesystem expects, `0` for no limit.
    ///
    /// Informational only. The kernel learns its read limit from the
    /// `max_read=` mount option, never from the INIT reply, so this value is
    /// carried into [`ConnectionInfo`] for handlers and not sent anywhere.
    pub fn max_read(&self) -> u32 {
        self.max_read
    }

    pub fn set_max_read(&mut self, max_read: u32) -> &mut Self {
        self.max_read = max_read;
        self
    }

    pub fn max_background(&self) -> u16 {
        self.max_background
    }

    pub fn set_max_background(&mut self, max_background: u16) -> &mut Self {
        self.max_background = max_background;
        self
    }

    pub fn congestion_threshold(&self) -> u16 {
        self.congestion_threshold
    }

    pub fn set_congestion_threshold(&mut self, congestion_threshold: u16) -> &mut Self {
        self.congestion_threshold = congestion_threshold;
        self
    }

    /// Timestamp granularity in nanoseconds.
    pub fn time_gran(&self) -> u32 {
        self.time_gran
    }

    pub fn set_time_gran(&mut self, time_gran: u32) -> &mut Self {
        self.time_gran = time_gran;
        self
    }

    /// Check the handler's choices against what the kernel offered and freeze
    /// them.
    pub(crate) fn finish(self, kernel_readahead: u32) -> Result<ConnectionInfo, SessionError> {
        if !self.capable.contains(self.want) {
            return Err(SessionError::Capability {
                unsupported: self.want - self.capable,
            });
        }

        let max_write = self.max_write.clamp(MIN_WRITE_SIZE, MAX_WRITE_SIZE);
        let max_pages = if self.want.contains(CapabilityFlags::MAX_PAGES) {
            let page_size = page_size();
            max_write.div_ceil(page_size).min(u16::MAX as u32) as u16
        } else {
            0
        };

        Ok(ConnectionInfo {
            proto_major: self.proto_major,
            proto_minor: self.proto_minor,
            capable: self.capable,
            want: self.want,
            max_readahead: self.max_readahead.min(kernel_readahead),
            max_write,
            max_read: self.max_read,
            max_background: self.max_background,
            congestion_threshold: self.congestion_threshold.min(self.max_background),
            time_gran: self.time_gran.clamp(1, 1_000_000_000),
            max_pages,
        })
    }
}

fn page_size() -> u32 {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u32,
        _ => 4096,
    }
}

/// Negotiated connection parameters, fixed once the INIT reply is sent.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnectionInfo {
    proto_major: u32,
    proto_minor: u32,
    capable: CapabilityFlags,
    want: CapabilityFlags,
    max_readahead: u32,
    max_write: u32,
    max_read: u32,
    max_background: u16,
    congestion_threshold: u16,
    time_gran: u32,
    max_pages: u16,
}

impl ConnectionInfo {
    pub fn proto_major(&self) -> u32 {
        self.proto_major
    }

    pub fn proto_minor(&self) -> u32 {
        self.proto_minor
    }

    pub fn capable(&self) -> CapabilityFlags {
        self.capable
    }

    /// Capabilities in effect for this connection.
    pub fn want(&self) -> CapabilityFlags {
        self.want
    }

    pub fn max_readahead(&self) -> u32 {
        self.max_readahead
    }

    pub fn max_write(&self) -> u32 {
        self.max_write
    }

    /// The value the init handler chose; see [`ConnectionConfig::max_read`].
    pub fn max_read(&self) -> u32 {
        self.max_read
    }

    pub fn max_background(&self) -> u16 {
        self.max_background
    }

    pub fn congestion_threshold(&self) -> u16 {
        self.congestion_threshold
    }

    pub fn time_gran(&self) -> u32 {
        self.time_gran
    }

    pub fn max_pages(&self) -> u16 {
        self.max_pages
    }

    pub(crate) fn init_out(&self) -> fuse_init_out {
        fuse_init_out {
            major: FUSE_KERNEL_VERSION,
            minor: self.proto_minor,
            max_readahead: self.max_readahead,
            flags: self.want.bits(),
            max_background: self.max_background,
            congestion_threshold: self.congestion_threshold,
            max_write: self.max_write,
            time_gran: self.time_gran,
            max_pages: self.max_pages,
            map_alignment: 0,
            flags2: 0,
            unused: [0; 7],
        }
    }
}
