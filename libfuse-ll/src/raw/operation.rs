use std::ffi::OsString;
use std::fmt::{self, Display, Formatter};

use bincode::Options;
use bytes::{Buf, Bytes};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::helper::{get_bincode_config, split_name};
use crate::raw::abi::*;
use crate::raw::file_info::FileInfo;
use crate::raw::op;
use crate::raw::reply::ReplyShape;
use crate::{SetAttr, TimeOrNow, Timestamp};

/// Every operation a filesystem can implement.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum OperationKind {
    Init,
    Destroy,
    Lookup,
    Forget,
    Getattr,
    Setattr,
    Readlink,
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Symlink,
    Rename,
    Link,
    Open,
    Read,
    Write,
    Flush,
    Release,
    Fsync,
    Opendir,
    Readdir,
    Releasedir,
    Fsyncdir,
    Statfs,
    Setxattr,
    Getxattr,
    Listxattr,
    Removexattr,
    Access,
    Create,
}

impl OperationKind {
    pub const COUNT: usize = 31;

    pub const ALL: [OperationKind; Self::COUNT] = [
        OperationKind::Init,
        OperationKind::Destroy,
        OperationKind::Lookup,
        OperationKind::Forget,
        OperationKind::Getattr,
        OperationKind::Setattr,
        OperationKind::Readlink,
        OperationKind::Mknod,
        OperationKind::Mkdir,
        OperationKind::Unlink,
        OperationKind::Rmdir,
        OperationKind::Symlink,
        OperationKind::Rename,
        OperationKind::Link,
        OperationKind::Open,
        OperationKind::Read,
        OperationKind::Write,
        OperationKind::Flush,
        OperationKind::Release,
        OperationKind::Fsync,
        OperationKind::Opendir,
        OperationKind::Readdir,
        OperationKind::Releasedir,
        OperationKind::Fsyncdir,
        OperationKind::Statfs,
        OperationKind::Setxattr,
        OperationKind::Getxattr,
        OperationKind::Listxattr,
        OperationKind::Removexattr,
        OperationKind::Access,
        OperationKind::Create,
    ];

    pub(crate) const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            OperationKind::Init => "init",
            OperationKind::Destroy => "destroy",
            OperationKind::Lookup => "lookup",
            OperationKind::Forget => "forget",
            OperationKind::Getattr => "getattr",
            OperationKind::Setattr => "setattr",
            OperationKind::Readlink => "readlink",
            OperationKind::Mknod => "mknod",
            OperationKind::Mkdir => "mkdir",
            OperationKind::Unlink => "unlink",
            OperationKind::Rmdir => "rmdir",
            OperationKind::Symlink => "symlink",
            OperationKind::Rename => "rename",
            OperationKind::Link => "link",
            OperationKind::Open => "open",
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Flush => "flush",
            OperationKind::Release => "release",
            OperationKind::Fsync => "fsync",
            OperationKind::Opendir => "opendir",
            OperationKind::Readdir => "readdir",
            OperationKind::Releasedir => "releasedir",
            OperationKind::Fsyncdir => "fsyncdir",
            OperationKind::Statfs => "statfs",
            OperationKind::Setxattr => "setxattr",
            OperationKind::Getxattr => "getxattr",
            OperationKind::Listxattr => "listxattr",
            OperationKind::Removexattr => "removexattr",
            OperationKind::Access => "access",
            OperationKind::Create => "create",
        }
    }

    /// `forget` is the only request the kernel does not wait on.
    pub const fn expects_reply(self) -> bool {
        !matches!(self, OperationKind::Forget)
    }

    /// Whether a request of this kind may be completed with `shape`.
    pub fn accepts(self, shape: ReplyShape) -> bool {
        use OperationKind as K;

        match shape {
            ReplyShape::None => !self.expects_reply(),
            ReplyShape::Error => self.expects_reply(),
            ReplyShape::Entry => {
                matches!(self, K::Lookup | K::Mknod | K::Mkdir | K::Symlink | K::Link)
            }
            ReplyShape::Create => self == K::Create,
            ReplyShape::Attr => matches!(self, K::Getattr | K::Setattr),
            ReplyShape::Readlink => self == K::Readlink,
            ReplyShape::Open => matches!(self, K::Open | K::Opendir),
            ReplyShape::Write => self == K::Write,
            ReplyShape::Data => matches!(self, K::Read | K::Getxattr | K::Listxattr),
            ReplyShape::Dir => self == K::Readdir,
            ReplyShape::Statfs => self == K::Statfs,
            ReplyShape::XattrSize => matches!(self, K::Getxattr | K::Listxattr),
            ReplyShape::Empty => matches!(
                self,
                K::Unlink
                    | K::Rmdir
                    | K::Rename
                    | K::Flush
                    | K::Release
                    | K::Fsync
                    | K::Releasedir
                    | K::Fsyncdir
                    | K::Setxattr
                    | K::Removexattr
                    | K::Access
            ),
        }
    }
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Arguments of one operation kind, extracted from an [`Operation`].
pub trait OperationArgs: Sized + Send + 'static {
    const KIND: OperationKind;

    /// Take the arguments out, or give the operation back if it is of a
    /// different kind.
    fn from_operation(operation: Operation) -> Result<Self, Operation>;
}

macro_rules! operations {
    ($($kind:ident),* $(,)?) => {
        /// A decoded request, one variant per operation kind that carries a
        /// request handle.
        #[derive(Debug, Clone)]
        pub enum Operation {
            $($kind(op::$kind),)*
        }

        impl Operation {
            pub fn kind(&self) -> OperationKind {
                match self {
                    $(Operation::$kind(_) => OperationKind::$kind,)*
                }
            }
        }

        $(
            impl OperationArgs for op::$kind {
                const KIND: OperationKind = OperationKind::$kind;

                fn from_operation(operation: Operation) -> Result<Self, Operation> {
                    match operation {
                        Operation::$kind(args) => Ok(args),
                        other => Err(other),
                    }
                }
            }

            impl From<op::$kind> for Operation {
                fn from(args: op::$kind) -> Self {
                    Operation::$kind(args)
                }
            }
        )*
    };
}

operations! {
    Lookup,
    Forget,
    Getattr,
    Setattr,
    Readlink,
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Symlink,
    Rename,
    Link,
    Open,
    Read,
    Write,
    Flush,
    Release,
    Fsync,
    Opendir,
    Readdir,
    Releasedir,
    Fsyncdir,
    Statfs,
    Setxattr,
    Getxattr,
    Listxattr,
    Removexattr,
    Access,
    Create,
}

impl Operation {
    /// Upper bound on the reply payload: the buffer size the kernel asked
    /// for, or the length written.
    pub(crate) fn reply_limit(&self) -> Option<u32> {
        match self {
            Operation::Read(args) => Some(args.size),
            Operation::Readdir(args) => Some(args.size),
            Operation::Getxattr(args) => Some(args.size),
            Operation::Listxattr(args) => Some(args.size),
            Operation::Write(args) => Some(args.data.len() as u32),
            _ => None,
        }
    }
}

/// A message from the kernel after decoding.
#[derive(Debug)]
pub(crate) enum Message {
    Init(fuse_init_in),
    Destroy,
    Interrupt(u64),
    Forget(Vec<op::Forget>),
    Operation(Operation),
    Unsupported(u32),
}

#[derive(Debug, Error)]
pub(crate) enum DecodeError {
    #[error("message of {0} bytes is shorter than the header")]
    ShortHeader(usize),

    #[error("header claims {header} bytes but {received} arrived")]
    Length { header: u32, received: usize },

    #[error("missing or unterminated name")]
    Name,

    #[error("payload shorter than the {0} it announces")]
    Truncated(&'static str),

    #[error("bad argument layout: {0}")]
    Layout(#[from] bincode::Error),
}

pub(crate) fn decode_header(frame: &[u8]) -> Result<fuse_in_header, DecodeError> {
    if frame.len() < FUSE_IN_HEADER_SIZE {
        return Err(DecodeError::ShortHeader(frame.len()));
    }

    Ok(get_bincode_config().deserialize(&frame[..FUSE_IN_HEADER_SIZE])?)
}

/// Decode the message body following `header`. `minor` selects the layout of
/// structures that grew over protocol revisions.
pub(crate) fn decode_message(
    header: &fuse_in_header,
    frame: Bytes,
    minor: u32,
) -> Result<Message, DecodeError> {
    if header.len as usize != frame.len() {
        return Err(DecodeError::Length {
            header: header.len,
            received: frame.len(),
        });
    }

    let mut args = ArgReader {
        data: frame.slice(FUSE_IN_HEADER_SIZE..),
    };
    let ino = header.nodeid;

    let operation: Operation = match header.opcode {
        FUSE_INIT => return Ok(Message::Init(args.fetch()?)),
        FUSE_DESTROY => return Ok(Message::Destroy),
        FUSE_INTERRUPT => {
            let interrupt: fuse_interrupt_in = args.fetch()?;
            return Ok(Message::Interrupt(interrupt.unique));
        }
        FUSE_FORGET => {
            let forget: fuse_forget_in = args.fetch()?;
            return Ok(Message::Forget(vec![op::Forget {
                ino,
                nlookup: forget.nlookup,
            }]));
        }
        FUSE_BATCH_FORGET => {
            let batch: fuse_batch_forget_in = args.fetch()?;
            let forgets = (0..batch.count)
                .map(|_| {
                    let one: fuse_forget_one = args.fetch()?;
                    Ok(op::Forget {
                        ino: one.nodeid,
                        nlookup: one.nlookup,
                    })
                })
                .collect::<Result<Vec<_>, DecodeError>>()?;
            return Ok(Message::Forget(forgets));
        }

        FUSE_LOOKUP => op::Lookup {
            parent: ino,
            name: args.fetch_name()?,
        }
        .into(),
        FUSE_GETATTR => {
            let fh = if minor >= 9 {
                let getattr: fuse_getattr_in = args.fetch()?;
                (getattr.getattr_flags & FUSE_GETATTR_FH != 0).then_some(getattr.fh)
            } else {
                None
            };
            op::Getattr { ino, fh }.into()
        }
        FUSE_SETATTR => {
            let setattr: fuse_setattr_in = args.fetch()?;
            op::Setattr {
                ino,
                attr: set_attr(&setattr),
            }
            .into()
        }
        FUSE_READLINK => op::Readlink { ino }.into(),
        FUSE_SYMLINK => {
            let name = args.fetch_name()?;
            op::Symlink {
                parent: ino,
                name,
                link: args.fetch_name()?,
            }
            .into()
        }
        FUSE_MKNOD => {
            let mknod = if minor >= 12 {
                args.fetch::<fuse_mknod_in>()?
            } else {
                let compat: fuse_compat_mknod_in = args.fetch()?;
                fuse_mknod_in {
                    mode: compat.mode,
                    rdev: compat.rdev,
                    ..Default::default()
                }
            };
            op::Mknod {
                parent: ino,
                name: args.fetch_name()?,
                mode: mknod.mode,
                rdev: mknod.rdev,
                umask: mknod.umask,
            }
            .into()
        }
        FUSE_MKDIR => {
            let mkdir: fuse_mkdir_in = args.fetch()?;
            op::Mkdir {
                parent: ino,
                name: args.fetch_name()?,
                mode: mkdir.mode,
                umask: mkdir.umask,
            }
            .into()
        }
        FUSE_UNLINK => op::Unlink {
            parent: ino,
            name: args.fetch_name()?,
        }
        .into(),
        FUSE_RMDIR => op::Rmdir {
            parent: ino,
            name: args.fetch_name()?,
        }
        .into(),
        FUSE_RENAME | FUSE_RENAME2 => {
            let (new_parent, flags) = if header.opcode == FUSE_RENAME2 {
                let rename: fuse_rename2_in = args.fetch()?;
                (rename.newdir, rename.flags)
            } else {
                let rename: fuse_rename_in = args.fetch()?;
                (rename.newdir, 0)
            };
            let name = args.fetch_name()?;
            op::Rename {
                parent: ino,
                name,
                new_parent,
                new_name: args.fetch_name()?,
                flags,
            }
            .into()
        }
        FUSE_LINK => {
            let link: fuse_link_in = args.fetch()?;
            op::Link {
                ino: link.oldnodeid,
                new_parent: ino,
                new_name: args.fetch_name()?,
            }
            .into()
        }
        FUSE_OPEN => {
            let open: fuse_open_in = args.fetch()?;
            op::Open {
                ino,
                flags: open.flags,
            }
            .into()
        }
        FUSE_OPENDIR => {
            let open: fuse_open_in = args.fetch()?;
            op::Opendir {
                ino,
                flags: open.flags,
            }
            .into()
        }
        FUSE_READ => {
            let read = args.fetch_read_in(minor)?;
            op::Read {
                ino,
                offset: read.offset,
                size: read.size,
                file: read_file_info(&read),
            }
            .into()
        }
        FUSE_READDIR => {
            let read = args.fetch_read_in(minor)?;
            op::Readdir {
                ino,
                offset: read.offset,
                size: read.size,
                file: read_file_info(&read),
            }
            .into()
        }
        FUSE_WRITE => {
            let write = if minor >= 9 {
                args.fetch::<fuse_write_in>()?
            } else {
                let compat: fuse_compat_write_in = args.fetch()?;
                fuse_write_in {
                    fh: compat.fh,
                    offset: compat.offset,
                    size: compat.size,
                    write_flags: compat.write_flags,
                    ..Default::default()
                }
            };
            let lock_owner =
                (write.write_flags & FUSE_WRITE_LOCKOWNER != 0).then_some(write.lock_owner);
            op::Write {
                ino,
                offset: write.offset,
                data: args.fetch_bytes(write.size as usize, "write data")?,
                file: FileInfo::new(write.fh, write.flags)
                    .with_lock_owner(lock_owner)
                    .with_writepage(write.write_flags & FUSE_WRITE_CACHE != 0),
            }
            .into()
        }
        FUSE_STATFS => op::Statfs { ino }.into(),
        FUSE_RELEASE => op::Release {
            ino,
            file: args.fetch_release_file(minor)?,
        }
        .into(),
        FUSE_RELEASEDIR => op::Releasedir {
            ino,
            file: args.fetch_release_file(minor)?,
        }
        .into(),
        FUSE_FSYNC => {
            let fsync: fuse_fsync_in = args.fetch()?;
            op::Fsync {
                ino,
                datasync: fsync.fsync_flags & FUSE_FSYNC_FDATASYNC != 0,
                file: FileInfo::new(fsync.fh, 0),
            }
            .into()
        }
        FUSE_FSYNCDIR => {
            let fsync: fuse_fsync_in = args.fetch()?;
            op::Fsyncdir {
                ino,
                datasync: fsync.fsync_flags & FUSE_FSYNC_FDATASYNC != 0,
                file: FileInfo::new(fsync.fh, 0),
            }
            .into()
        }
        FUSE_FLUSH => {
            let flush: fuse_flush_in = args.fetch()?;
            op::Flush {
                ino,
                file: FileInfo::new(flush.fh, 0).with_lock_owner(Some(flush.lock_owner)),
            }
            .into()
        }
        FUSE_SETXATTR => {
            let setxattr: fuse_setxattr_in = args.fetch()?;
            let name = args.fetch_name()?;
            op::Setxattr {
                ino,
                name,
                value: args.fetch_bytes(setxattr.size as usize, "xattr value")?,
                flags: setxattr.flags,
            }
            .into()
        }
        FUSE_GETXATTR => {
            let getxattr: fuse_getxattr_in = args.fetch()?;
            op::Getxattr {
                ino,
                name: args.fetch_name()?,
                size: getxattr.size,
            }
            .into()
        }
        FUSE_LISTXATTR => {
            let getxattr: fuse_getxattr_in = args.fetch()?;
            op::Listxattr {
                ino,
                size: getxattr.size,
            }
            .into()
        }
        FUSE_REMOVEXATTR => op::Removexattr {
            ino,
            name: args.fetch_name()?,
        }
        .into(),
        FUSE_ACCESS => {
            let access: fuse_access_in = args.fetch()?;
            op::Access {
                ino,
                mask: access.mask,
            }
            .into()
        }
        FUSE_CREATE => {
            let create = if minor >= 12 {
                args.fetch::<fuse_create_in>()?
            } else {
                let compat: fuse_compat_create_in = args.fetch()?;
                fuse_create_in {
                    flags: compat.flags,
                    mode: compat.mode,
                    ..Default::default()
                }
            };
            op::Create {
                parent: ino,
                name: args.fetch_name()?,
                mode: create.mode,
                umask: create.umask,
                flags: create.flags,
            }
            .into()
        }

        opcode => return Ok(Message::Unsupported(opcode)),
    };

    Ok(Message::Operation(operation))
}

struct ArgReader {
    data: Bytes,
}

impl ArgReader {
    fn fetch<T: DeserializeOwned + Serialize>(&mut self) -> Result<T, DecodeError> {
        let value: T = get_bincode_config().deserialize(&self.data)?;
        let size = get_bincode_config().serialized_size(&value)? as usize;
        self.data.advance(size);

        Ok(value)
    }

    fn fetch_name(&mut self) -> Result<OsString, DecodeError> {
        let (name, rest) = split_name(&self.data).ok_or(DecodeError::Name)?;
        let consumed = self.data.len() - rest.len();
        let name = name.to_os_string();
        self.data.advance(consumed);

        Ok(name)
    }

    fn fetch_bytes(&mut self, len: usize, what: &'static str) -> Result<Bytes, DecodeError> {
        if self.data.len() < len {
            return Err(DecodeError::Truncated(what));
        }

        Ok(self.data.split_to(len))
    }

    fn fetch_read_in(&mut self, minor: u32) -> Result<fuse_read_in, DecodeError> {
        if minor >= 9 {
            return self.fetch();
        }

        let compat: fuse_compat_read_in = self.fetch()?;
        Ok(fuse_read_in {
            fh: compat.fh,
            offset: compat.offset,
            size: compat.size,
            read_flags: compat.read_flags,
            ..Default::default()
        })
    }

    fn fetch_release_file(&mut self, minor: u32) -> Result<FileInfo, DecodeError> {
        let release = if minor >= 8 {
            self.fetch::<fuse_release_in>()?
        } else {
            let compat: fuse_compat_release_in = self.fetch()?;
            fuse_release_in {
                fh: compat.fh,
                flags: compat.flags,
                release_flags: compat.release_flags,
                lock_owner: 0,
            }
        };

        let flush = release.release_flags & FUSE_RELEASE_FLUSH != 0;
        let flock_release = release.release_flags & FUSE_RELEASE_FLOCK_UNLOCK != 0;
        let lock_owner = (minor >= 8 && (flush || flock_release)).then_some(release.lock_owner);

        Ok(FileInfo::new(release.fh, release.flags)
            .with_lock_owner(lock_owner)
            .with_flush(flush)
            .with_flock_release(flock_release))
    }
}

fn read_file_info(read: &fuse_read_in) -> FileInfo {
    let lock_owner = (read.read_flags & FUSE_READ_LOCKOWNER != 0).then_some(read.lock_owner);
    FileInfo::new(read.fh, read.flags).with_lock_owner(lock_owner)
}

fn set_attr(setattr: &fuse_setattr_in) -> SetAttr {
    let valid = setattr.valid;
    let has = |bit: u32| valid & bit != 0;

    let time = |now: u32, set: u32, sec: u64, nsec: u32| {
        if has(now) {
            Some(TimeOrNow::Now)
        } else if has(set) {
            Some(TimeOrNow::Specific(Timestamp::new(sec as i64, nsec)))
        } else {
            None
        }
    };

    SetAttr {
        mode: has(FATTR_MODE).then_some(setattr.mode),
        uid: has(FATTR_UID).then_some(setattr.uid),
        gid: has(FATTR_GID).then_some(setattr.gid),
        size: has(FATTR_SIZE).then_some(setattr.size),
        lock_owner: has(FATTR_LOCKOWNER).then_some(setattr.lock_owner),
        atime: time(FATTR_ATIME_NOW, FATTR_ATIME, setattr.atime, setattr.atimensec),
        mtime: time(FATTR_MTIME_NOW, FATTR_MTIME, setattr.mtime, setattr.mtimensec),
        ctime: has(FATTR_CTIME).then(|| Timestamp::new(setattr.ctime as i64, setattr.ctimensec)),
        fh: has(FATTR_FH).then_some(setattr.fh),
    }
}
