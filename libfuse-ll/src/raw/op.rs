//! Arguments of each operation, as decoded from the kernel request.

use std::ffi::OsString;

use bytes::Bytes;

use crate::raw::file_info::FileInfo;
use crate::{Inode, SetAttr};

#[derive(Debug, Clone)]
pub struct Lookup {
    pub parent: Inode,
    pub name: OsString,
}

/// The kernel dropped `nlookup` references to `ino`. Never answered.
#[derive(Debug, Clone)]
pub struct Forget {
    pub ino: Inode,
    pub nlookup: u64,
}

#[derive(Debug, Clone)]
pub struct Getattr {
    pub ino: Inode,
    /// Set when the kernel asks through an open file.
    pub fh: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Setattr {
    pub ino: Inode,
    pub attr: SetAttr,
}

#[derive(Debug, Clone)]
pub struct Readlink {
    pub ino: Inode,
}

#[derive(Debug, Clone)]
pub struct Mknod {
    pub parent: Inode,
    pub name: OsString,
    pub mode: u32,
    pub rdev: u32,
    pub umask: u32,
}

#[derive(Debug, Clone)]
pub struct Mkdir {
    pub parent: Inode,
    pub name: OsString,
    pub mode: u32,
    pub umask: u32,
}

#[derive(Debug, Clone)]
pub struct Unlink {
    pub parent: Inode,
    pub name: OsString,
}

#[derive(Debug, Clone)]
pub struct Rmdir {
    pub parent: Inode,
    pub name: OsString,
}

#[derive(Debug, Clone)]
pub struct Symlink {
    pub parent: Inode,
    pub name: OsString,
    pub link: OsString,
}

#[derive(Debug, Clone)]
pub struct Rename {
    pub parent: Inode,
    pub name: OsString,
    pub new_parent: Inode,
    pub new_name: OsString,
    /// `RENAME_NOREPLACE`, `RENAME_EXCHANGE`, ...; `0` for a plain rename.
    pub flags: u32,
}

#[derive(Debug, Clone)]
pub struct Link {
    pub ino: Inode,
    pub new_parent: Inode,
    pub new_name: OsString,
}

#[derive(Debug, Clone)]
pub struct Open {
    pub ino: Inode,
    pub flags: u32,
}

#[derive(Debug, Clone)]
pub struct Read {
    pub ino: Inode,
    pub offset: u64,
    pub size: u32,
    pub file: FileInfo,
}

#[derive(Debug, Clone)]
pub struct Write {
    pub ino: Inode,
    pub offset: u64,
    pub data: Bytes,
    pub file: FileInfo,
}

#[derive(Debug, Clone)]
pub struct Flush {
    pub ino: Inode,
    pub file: FileInfo,
}

#[derive(Debug, Clone)]
pub struct Release {
    pub ino: Inode,
    pub file: FileInfo,
}

#[derive(Debug, Clone)]
pub struct Fsync {
    pub ino: Inode,
    /// Only the data needs to reach stable storage.
    pub datasync: bool,
    pub file: FileInfo,
}

#[derive(Debug, Clone)]
pub struct Opendir {
    pub ino: Inode,
    pub flags: u32,
}

#[derive(Debug, Clone)]
pub struct Readdir {
    pub ino: Inode,
    pub offset: u64,
    pub size: u32,
    pub file: FileInfo,
}

#[derive(Debug, Clone)]
pub struct Releasedir {
    pub ino: Inode,
    pub file: FileInfo,
}

#[derive(Debug, Clone)]
pub struct Fsyncdir {
    pub ino: Inode,
    pub datasync: bool,
    pub file: FileInfo,
}

#[derive(Debug, Clone)]
pub struct Statfs {
    pub ino: Inode,
}

#[derive(Debug, Clone)]
pub struct Setxattr {
    pub ino: Inode,
    pub name: OsString,
    pub value: Bytes,
    pub flags: u32,
}

/// With `size == 0` the kernel asks for the value length only.
#[derive(Debug, Clone)]
pub struct Getxattr {
    pub ino: Inode,
    pub name: OsString,
    pub size: u32,
}

#[derive(Debug, Clone)]
pub struct Listxattr {
    pub ino: Inode,
    pub size: u32,
}

#[derive(Debug, Clone)]
pub struct Removexattr {
    pub ino: Inode,
    pub name: OsString,
}

#[derive(Debug, Clone)]
pub struct Access {
    pub ino: Inode,
    pub mask: u32,
}

#[derive(Debug, Clone)]
pub struct Create {
    pub parent: Inode,
    pub name: OsString,
    pub mode: u32,
    pub umask: u32,
    pub flags: u32,
}
