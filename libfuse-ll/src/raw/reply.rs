//! Reply values and their wire encoding.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::time::Duration;

use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::helper::{align8, get_bincode_config};
use crate::raw::abi::*;
use crate::raw::file_info::Opened;
use crate::{Errno, FileType, Inode, Timestamp};

/// File attributes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FileAttr {
    pub ino: Inode,
    pub size: u64,
    /// Size in 512-byte blocks.
    pub blocks: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub kind: FileType,
    /// Permission bits, without the file type.
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl FileAttr {
    /// Attributes with every counter zeroed and all times at the epoch.
    pub fn new(ino: Inode, kind: FileType, perm: u16) -> Self {
        Self {
            ino,
            size: 0,
            blocks: 0,
            atime: Timestamp::default(),
            mtime: Timestamp::default(),
            ctime: Timestamp::default(),
            kind,
            perm,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
        }
    }
}

impl From<FileAttr> for fuse_attr {
    fn from(attr: FileAttr) -> Self {
        fuse_attr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: attr.atime.sec as u64,
            mtime: attr.mtime.sec as u64,
            ctime: attr.ctime.sec as u64,
            atimensec: attr.atime.nsec,
            mtimensec: attr.mtime.nsec,
            ctimensec: attr.ctime.nsec,
            mode: attr.kind.mode_bits() | (attr.perm as u32 & 0o7777),
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: attr.blksize,
            padding: 0,
        }
    }
}

/// A directory entry returned by `lookup`, `mknod`, `mkdir`, `symlink`,
/// `link` and `create`.
///
/// If inode numbers are ever reused, the pair (inode, generation) must be
/// unique over the lifetime of the filesystem, otherwise the kernel cannot
/// tell a stale cached entry from the new file. Keeping that promise is up to
/// the filesystem.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Entry {
    attr: FileAttr,
    generation: u64,
    attr_ttl: Duration,
    entry_ttl: Duration,
}

impl Entry {
    pub fn new(attr: FileAttr) -> Self {
        Self {
            attr,
            generation: 0,
            attr_ttl: Duration::from_secs(1),
            entry_ttl: Duration::from_secs(1),
        }
    }

    pub fn generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// How long the kernel may cache the attributes.
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    /// How long the kernel may cache the name lookup.
    pub fn entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }

    pub fn attr(&self) -> &FileAttr {
        &self.attr
    }

    pub fn ino(&self) -> Inode {
        self.attr.ino
    }

    fn entry_out(&self) -> fuse_entry_out {
        fuse_entry_out {
            nodeid: self.attr.ino,
            generation: self.generation,
            entry_valid: self.entry_ttl.as_secs(),
            attr_valid: self.attr_ttl.as_secs(),
            entry_valid_nsec: self.entry_ttl.subsec_nanos(),
            attr_valid_nsec: self.attr_ttl.subsec_nanos(),
            attr: self.attr.into(),
        }
    }
}

/// Filesystem statistics returned by `statfs`.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

impl From<StatFs> for fuse_kstatfs {
    fn from(st: StatFs) -> Self {
        fuse_kstatfs {
            blocks: st.blocks,
            bfree: st.bfree,
            bavail: st.bavail,
            files: st.files,
            ffree: st.ffree,
            bsize: st.bsize,
            namelen: st.namelen,
            frsize: st.frsize,
            padding: 0,
            spare: [0; 6],
        }
    }
}

/// Accumulates directory entries for a `readdir` reply.
///
/// The buffer never grows past the size the kernel asked for; once an entry
/// does not fit, [`push`][DirBuf::push] returns `false` and the listing should
/// be sent as is. The kernel comes back with the offset of the last entry.
#[derive(Debug)]
pub struct DirBuf {
    buf: BytesMut,
    max: usize,
}

impl DirBuf {
    pub fn new(size: u32) -> Self {
        let max = size as usize;
        Self {
            buf: BytesMut::with_capacity(max.min(64 * 1024)),
            max,
        }
    }

    /// Append an entry. `offset` is the position the kernel passes back to
    /// continue after this entry.
    pub fn push(
        &mut self,
        ino: Inode,
        offset: u64,
        kind: FileType,
        name: impl AsRef<OsStr>,
    ) -> bool {
        let name = name.as_ref().as_bytes();
        let entry_len = FUSE_DIRENT_SIZE + name.len();
        let padded_len = align8(entry_len);
        if self.buf.len() + padded_len > self.max {
            return false;
        }

        self.buf.put_u64_ne(ino);
        self.buf.put_u64_ne(offset);
        self.buf.put_u32_ne(name.len() as u32);
        self.buf.put_u32_ne(kind.dirent_type());
        self.buf.put_slice(name);
        self.buf.put_bytes(0, padded_len - entry_len);

        true
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// The reply shapes a request may be completed with.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReplyShape {
    Error,
    None,
    Empty,
    Entry,
    Create,
    Attr,
    Readlink,
    Open,
    Write,
    Data,
    Dir,
    Statfs,
    XattrSize,
}

#[derive(Debug)]
pub(crate) enum Reply {
    Error(Errno),
    None,
    Empty,
    Entry(Entry),
    Create(Entry, Opened),
    Attr(FileAttr, Duration),
    Readlink(Bytes),
    Open(Opened),
    Write(u32),
    Data(Bytes),
    Dir(Bytes),
    Statfs(StatFs),
    XattrSize(u32),
}

impl Reply {
    pub(crate) fn shape(&self) -> ReplyShape {
        match self {
            Reply::Error(_) => ReplyShape::Error,
            Reply::None => ReplyShape::None,
            Reply::Empty => ReplyShape::Empty,
            Reply::Entry(_) => ReplyShape::Entry,
            Reply::Create(..) => ReplyShape::Create,
            Reply::Attr(..) => ReplyShape::Attr,
            Reply::Readlink(_) => ReplyShape::Readlink,
            Reply::Open(_) => ReplyShape::Open,
            Reply::Write(_) => ReplyShape::Write,
            Reply::Data(_) => ReplyShape::Data,
            Reply::Dir(_) => ReplyShape::Dir,
            Reply::Statfs(_) => ReplyShape::Statfs,
            Reply::XattrSize(_) => ReplyShape::XattrSize,
        }
    }

    /// Encode the complete message for request `unique`, laid out for
    /// protocol minor version `minor`. `None` means nothing is sent.
    pub(crate) fn encode(&self, unique: u64, minor: u32) -> bincode::Result<Option<Bytes>> {
        let payload = match self {
            Reply::None => return Ok(None),
            Reply::Error(errno) => return Ok(Some(error_frame(unique, *errno))),
            Reply::Empty => Vec::new(),
            Reply::Entry(entry) => entry_payload(entry, minor)?,
            Reply::Create(entry, opened) => {
                let mut data = entry_payload(entry, minor)?;
                data.extend(struct_payload(&opened.open_out())?);
                data
            }
            Reply::Attr(attr, ttl) => {
                let out = fuse_attr_out {
                    attr_valid: ttl.as_secs(),
                    attr_valid_nsec: ttl.subsec_nanos(),
                    dummy: 0,
                    attr: (*attr).into(),
                };
                let mut data = struct_payload(&out)?;
                if minor < 9 {
                    data.truncate(FUSE_COMPAT_ATTR_OUT_SIZE);
                }
                data
            }
            Reply::Open(opened) => struct_payload(&opened.open_out())?,
            Reply::Write(size) => struct_payload(&fuse_write_out {
                size: *size,
                padding: 0,
            })?,
            Reply::Readlink(data) | Reply::Data(data) | Reply::Dir(data) => {
                return Ok(Some(frame(unique, 0, data)))
            }
            Reply::Statfs(st) => {
                let mut data = struct_payload(&fuse_statfs_out { st: (*st).into() })?;
                if minor < 4 {
                    data.truncate(FUSE_COMPAT_STATFS_SIZE);
                }
                data
            }
            Reply::XattrSize(size) => struct_payload(&fuse_getxattr_out {
                size: *size,
                padding: 0,
            })?,
        };

        Ok(Some(frame(unique, 0, &payload)))
    }
}

fn struct_payload<T: Serialize>(value: &T) -> bincode::Result<Vec<u8>> {
    get_bincode_config().serialize(value)
}

fn entry_payload(entry: &Entry, minor: u32) -> bincode::Result<Vec<u8>> {
    let mut data = struct_payload(&entry.entry_out())?;
    if minor < 9 {
        data.truncate(FUSE_COMPAT_ENTRY_OUT_SIZE);
    }
    Ok(data)
}

pub(crate) fn init_frame(unique: u64, out: &fuse_init_out, minor: u32) -> bincode::Result<Bytes> {
    let mut data = struct_payload(out)?;
    if minor < 5 {
        data.truncate(FUSE_COMPAT_INIT_OUT_SIZE);
    } else if minor < 23 {
        data.truncate(FUSE_COMPAT_22_INIT_OUT_SIZE);
    }
    Ok(frame(unique, 0, &data))
}

pub(crate) fn error_frame(unique: u64, errno: Errno) -> Bytes {
    frame(unique, -errno.raw(), &[])
}

pub(crate) fn empty_frame(unique: u64) -> Bytes {
    frame(unique, 0, &[])
}

fn frame(unique: u64, error: i32, payload: &[u8]) -> Bytes {
    let len = FUSE_OUT_HEADER_SIZE + payload.len();
    let mut buf = BytesMut::with_capacity(len);
    buf.put_u32_ne(len as u32);
    buf.put_i32_ne(error);
    buf.put_u64_ne(unique);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_header(frame: &[u8]) -> fuse_out_header {
        get_bincode_config().deserialize(frame).unwrap()
    }

    fn sample_attr() -> FileAttr {
        FileAttr {
            ino: 42,
            size: 4097,
            blocks: 9,
            atime: Timestamp::new(1_700_000_000, 1),
            mtime: Timestamp::new(1_700_000_001, 2),
            ctime: Timestamp::new(-5, 999_999_999),
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 2,
            uid: 1000,
            gid: 1001,
            rdev: 0,
            blksize: 4096,
        }
    }

    #[test]
    fn error_reply_is_header_only() {
        let frame = error_frame(7, Errno::new_not_exist());
        assert_eq!(frame.len(), FUSE_OUT_HEADER_SIZE);
        let header = decode_header(&frame);
        assert_eq!(header.len, FUSE_OUT_HEADER_SIZE as u32);
        assert_eq!(header.error, -libc::ENOENT);
        assert_eq!(header.unique, 7);
    }

    #[test]
    fn entry_reply_layout() {
        let entry = Entry::new(sample_attr())
            .generation(3)
            .attr_ttl(Duration::new(2, 500))
            .entry_ttl(Duration::new(10, 0));

        let frame = Reply::Entry(entry).encode(1, 31).unwrap().unwrap();
        assert_eq!(frame.len(), FUSE_OUT_HEADER_SIZE + FUSE_ENTRY_OUT_SIZE);
        let out: fuse_entry_out = get_bincode_config()
            .deserialize(&frame[FUSE_OUT_HEADER_SIZE..])
            .unwrap();
        assert_eq!(out.nodeid, 42);
        assert_eq!(out.generation, 3);
        assert_eq!((out.attr_valid, out.attr_valid_nsec), (2, 500));
        assert_eq!((out.entry_valid, out.entry_valid_nsec), (10, 0));
        assert_eq!(out.attr.mode, libc::S_IFREG as u32 | 0o644);
        assert_eq!(out.attr.ctime as i64, -5);

        let compat = Reply::Entry(entry).encode(1, 8).unwrap().unwrap();
        assert_eq!(compat.len(), FUSE_OUT_HEADER_SIZE + FUSE_COMPAT_ENTRY_OUT_SIZE);
    }

    #[test]
    fn create_reply_appends_open_out() {
        let entry = Entry::new(sample_attr());
        let frame = Reply::Create(entry, Opened::new(77).keep_cache())
            .encode(5, 31)
            .unwrap()
            .unwrap();
        assert_eq!(frame.len(), FUSE_OUT_HEADER_SIZE + FUSE_ENTRY_OUT_SIZE + 16);
        let open: fuse_open_out = get_bincode_config()
            .deserialize(&frame[FUSE_OUT_HEADER_SIZE + FUSE_ENTRY_OUT_SIZE..])
            .unwrap();
        assert_eq!(open.fh, 77);
        assert_eq!(open.open_flags, FOPEN_KEEP_CACHE);
    }

    #[test]
    fn statfs_compat_size() {
        let st = StatFs {
            blocks: 1,
            bsize: 4096,
            namelen: 255,
            ..Default::default()
        };
        let frame = Reply::Statfs(st).encode(1, 31).unwrap().unwrap();
        assert_eq!(frame.len(), FUSE_OUT_HEADER_SIZE + FUSE_STATFS_OUT_SIZE);
        let frame = Reply::Statfs(st).encode(1, 3).unwrap().unwrap();
        assert_eq!(frame.len(), FUSE_OUT_HEADER_SIZE + FUSE_COMPAT_STATFS_SIZE);
    }

    #[test]
    fn init_reply_compat_sizes() {
        let out = fuse_init_out {
            major: 7,
            minor: 31,
            ..Default::default()
        };
        assert_eq!(
            init_frame(1, &out, 31).unwrap().len(),
            FUSE_OUT_HEADER_SIZE + FUSE_INIT_OUT_SIZE
        );
        assert_eq!(
            init_frame(1, &out, 22).unwrap().len(),
            FUSE_OUT_HEADER_SIZE + FUSE_COMPAT_22_INIT_OUT_SIZE
        );
        assert_eq!(
            init_frame(1, &out, 4).unwrap().len(),
            FUSE_OUT_HEADER_SIZE + FUSE_COMPAT_INIT_OUT_SIZE
        );
    }

    #[test]
    fn dir_buf_pads_and_stops_when_full() {
        let mut dir = DirBuf::new(64);
        assert!(dir.push(1, 1, FileType::Directory, "."));
        assert_eq!(dir.len(), 32);
        assert!(dir.push(1, 2, FileType::Directory, ".."));
        assert_eq!(dir.len(), 64);
        assert!(!dir.push(2, 3, FileType::RegularFile, "hello.txt"));
        assert_eq!(dir.len(), 64);

        let bytes = dir.into_bytes();
        let dirent: fuse_dirent = get_bincode_config().deserialize(&bytes[32..]).unwrap();
        assert_eq!(dirent.off, 2);
        assert_eq!(dirent.namelen, 2);
        assert_eq!(dirent.r#type, libc::DT_DIR as u32);
        assert_eq!(&bytes[32 + FUSE_DIRENT_SIZE..32 + FUSE_DIRENT_SIZE + 2], b"..");
        assert!(bytes[32 + FUSE_DIRENT_SIZE + 2..].iter().all(|b| *b == 0));
    }
}
