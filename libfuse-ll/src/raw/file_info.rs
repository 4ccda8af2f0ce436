use crate::raw::abi::*;

/// State of an open file as sent by the kernel with every request on it.
///
/// `fh` is the value the filesystem returned when the file was opened. It is
/// handed back exactly as stored; its meaning belongs to the filesystem.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FileInfo {
    fh: u64,
    flags: i32,
    lock_owner: Option<u64>,
    flush: bool,
    flock_release: bool,
    writepage: bool,
}

impl FileInfo {
    pub(crate) fn new(fh: u64, flags: u32) -> Self {
        Self {
            fh,
            flags: flags as i32,
            lock_owner: None,
            flush: false,
            flock_release: false,
            writepage: false,
        }
    }

    pub(crate) fn with_lock_owner(mut self, lock_owner: Option<u64>) -> Self {
        self.lock_owner = lock_owner;
        self
    }

    pub(crate) fn with_flush(mut self, flush: bool) -> Self {
        self.flush = flush;
        self
    }

    pub(crate) fn with_flock_release(mut self, flock_release: bool) -> Self {
        self.flock_release = flock_release;
        self
    }

    pub(crate) fn with_writepage(mut self, writepage: bool) -> Self {
        self.writepage = writepage;
        self
    }

    /// The handle chosen by the filesystem at open time.
    pub fn fh(&self) -> u64 {
        self.fh
    }

    /// Open flags (`O_RDONLY`, `O_APPEND`, ...).
    pub fn flags(&self) -> i32 {
        self.flags
    }

    /// Lock owner, when the kernel supplied one.
    pub fn lock_owner(&self) -> Option<u64> {
        self.lock_owner
    }

    /// Set on `release` when the file should be flushed first.
    pub fn flush(&self) -> bool {
        self.flush
    }

    /// Set on `release` when flock locks held by the owner must be dropped.
    pub fn flock_release(&self) -> bool {
        self.flock_release
    }

    /// Set on `write` when the data comes from the page cache.
    pub fn writepage(&self) -> bool {
        self.writepage
    }
}

/// Result of a successful `open`, `opendir` or `create`.
///
/// The handle is fixed when the value is built and is echoed by the kernel
/// unchanged until the matching `release`/`releasedir`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Opened {
    fh: u64,
    flags: u32,
}

impl Opened {
    pub fn new(fh: u64) -> Self {
        Self { fh, flags: 0 }
    }

    /// Bypass the page cache for this file.
    pub fn direct_io(mut self) -> Self {
        self.flags |= FOPEN_DIRECT_IO;
        self
    }

    /// Keep cached data from a previous open.
    pub fn keep_cache(mut self) -> Self {
        self.flags |= FOPEN_KEEP_CACHE;
        self
    }

    pub fn nonseekable(mut self) -> Self {
        self.flags |= FOPEN_NONSEEKABLE;
        self
    }

    /// Allow the kernel to cache directory contents (`opendir` only).
    pub fn cache_dir(mut self) -> Self {
        self.flags |= FOPEN_CACHE_DIR;
        self
    }

    pub fn fh(&self) -> u64 {
        self.fh
    }

    pub fn open_flags(&self) -> u32 {
        self.flags
    }

    pub(crate) fn open_out(&self) -> fuse_open_out {
        fuse_open_out {
            fh: self.fh,
            open_flags: self.flags,
            padding: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opened_flags() {
        let opened = Opened::new(u64::MAX).direct_io().nonseekable();
        let out = opened.open_out();
        assert_eq!(out.fh, u64::MAX);
        assert_eq!(out.open_flags, FOPEN_DIRECT_IO | FOPEN_NONSEEKABLE);
    }

    #[test]
    fn file_info_keeps_handle_bits() {
        let info = FileInfo::new(0xdead_beef_0000_0001, libc::O_RDWR as u32)
            .with_lock_owner(Some(9))
            .with_flush(true);
        assert_eq!(info.fh(), 0xdead_beef_0000_0001);
        assert_eq!(info.flags(), libc::O_RDWR);
        assert_eq!(info.lock_owner(), Some(9));
        assert!(info.flush());
        assert!(!info.flock_release());
        assert!(!info.writepage());
    }
}
