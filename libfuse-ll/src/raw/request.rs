use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::raw::abi::fuse_in_header;
use crate::raw::conn::ConnectionInfo;
use crate::raw::file_info::Opened;
use crate::raw::operation::OperationKind;
use crate::raw::reply::{error_frame, DirBuf, Entry, FileAttr, Reply, ReplyShape, StatFs};
use crate::raw::session::Shared;
use crate::Errno;

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CLOSED: u8 = 2;

/// Completion state of one in-flight request, shared with the session so it
/// can deliver interrupts and force completion on shutdown.
#[derive(Debug)]
pub(crate) struct Slot {
    unique: u64,
    state: AtomicU8,
    interrupted: AtomicBool,
    notify: Notify,
}

impl Slot {
    fn new(unique: u64) -> Self {
        Self {
            unique,
            state: AtomicU8::new(PENDING),
            interrupted: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub(crate) fn unique(&self) -> u64 {
        self.unique
    }

    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Take the completion away from the handler. Returns `false` when the
    /// handler already replied.
    pub(crate) fn close(&self) -> bool {
        let closed = self
            .state
            .compare_exchange(PENDING, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if closed {
            self.interrupt();
        }

        closed
    }
}

#[derive(Debug, Error)]
enum Violation {
    #[error("{shape:?} reply is not valid for a {kind} request")]
    Shape { shape: ReplyShape, kind: OperationKind },

    #[error("errno {0} is outside 1..=4095")]
    Errno(i32),

    #[error("reply of {len} bytes exceeds the {limit} allowed")]
    TooLong { len: usize, limit: u32 },

    #[error("xattr reply does not match the requested size {0}")]
    XattrSize(u32),
}

/// One kernel request waiting for its reply.
///
/// Every `reply_*` method consumes the handle, so a request is answered at
/// most once:
///
/// ```compile_fail
/// # fn demo(req: libfuse_ll::raw::Request) {
/// req.reply_empty();
/// req.reply_empty();
/// # }
/// ```
///
/// Replies are queued for the writer task; none of the methods wait for the
/// kernel. A handle dropped without a reply answers `EIO`.
///
/// Replying with a shape the request kind does not take (a directory listing
/// for a `read`, for example) panics when debug assertions are enabled and is
/// answered with `EIO` otherwise.
#[derive(Debug)]
pub struct Request {
    unique: u64,
    uid: u32,
    gid: u32,
    pid: u32,
    kind: OperationKind,
    limit: Option<u32>,
    slot: Arc<Slot>,
    session: Weak<Shared>,
}

impl Request {
    pub(crate) fn new(
        header: &fuse_in_header,
        kind: OperationKind,
        limit: Option<u32>,
        session: &Arc<Shared>,
    ) -> Self {
        let slot = Arc::new(Slot::new(header.unique));
        if kind.expects_reply() {
            session.track(slot.clone());
        }

        Self {
            unique: header.unique,
            uid: header.uid,
            gid: header.gid,
            pid: header.pid,
            kind,
            limit,
            slot,
            session: Arc::downgrade(session),
        }
    }

    /// The kernel's identifier for this request.
    pub fn unique(&self) -> u64 {
        self.unique
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Negotiated connection parameters, `None` once the session is gone.
    pub fn connection(&self) -> Option<ConnectionInfo> {
        self.session.upgrade().and_then(|session| session.connection())
    }

    /// Whether the kernel asked to abandon this request, or the session is
    /// shutting down. Replying anyway is harmless.
    pub fn is_interrupted(&self) -> bool {
        self.slot.interrupted.load(Ordering::Acquire)
    }

    /// Resolves once [`is_interrupted`][Self::is_interrupted] becomes true.
    pub async fn interrupted(&self) {
        loop {
            let notified = self.slot.notify.notified();
            if self.is_interrupted() {
                return;
            }
            notified.await;
        }
    }

    /// Fail the request with `errno`. Valid for every kind but `forget`.
    pub fn reply_err(self, errno: impl Into<Errno>) {
        self.complete(Reply::Error(errno.into()))
    }

    /// Answer `lookup`, `mknod`, `mkdir`, `symlink` or `link`.
    pub fn reply_entry(self, entry: Entry) {
        self.complete(Reply::Entry(entry))
    }

    pub fn reply_create(self, entry: Entry, opened: Opened) {
        self.complete(Reply::Create(entry, opened))
    }

    /// Answer `getattr` or `setattr`; `ttl` is how long the kernel may cache
    /// the attributes.
    pub fn reply_attr(self, attr: FileAttr, ttl: Duration) {
        self.complete(Reply::Attr(attr, ttl))
    }

    pub fn reply_readlink(self, target: impl AsRef<OsStr>) {
        let target = Bytes::copy_from_slice(target.as_ref().as_bytes());
        self.complete(Reply::Readlink(target))
    }

    /// Answer `open` or `opendir`.
    pub fn reply_open(self, opened: Opened) {
        self.complete(Reply::Open(opened))
    }

    /// Report how many bytes of a `write` were stored.
    pub fn reply_write(self, written: u32) {
        self.complete(Reply::Write(written))
    }

    /// Answer `read`, or a sized `getxattr`/`listxattr`. The data must not be
    /// longer than requested.
    pub fn reply_data(self, data: impl Into<Bytes>) {
        self.complete(Reply::Data(data.into()))
    }

    pub fn reply_dir(self, dir: DirBuf) {
        self.complete(Reply::Dir(dir.into_bytes()))
    }

    pub fn reply_statfs(self, st: StatFs) {
        self.complete(Reply::Statfs(st))
    }

    /// Answer a `getxattr`/`listxattr` that asked only for the size (requested
    /// size `0`).
    pub fn reply_xattr_size(self, size: u32) {
        self.complete(Reply::XattrSize(size))
    }

    /// Success without payload.
    pub fn reply_empty(self) {
        self.complete(Reply::Empty)
    }

    /// Close a `forget` request; nothing is sent to the kernel.
    pub fn reply_none(self) {
        self.complete(Reply::None)
    }

    fn complete(self, reply: Reply) {
        let reply = match self.check(&reply) {
            Ok(()) => reply,
            Err(violation) => {
                error!(unique = self.unique, kind = %self.kind, "{violation}");
                if cfg!(debug_assertions) {
                    panic!("request {} ({}): {violation}", self.unique, self.kind);
                }

                if self.kind.expects_reply() {
                    Reply::Error(Errno::from(libc::EIO))
                } else {
                    Reply::None
                }
            }
        };

        match self
            .slot
            .state
            .compare_exchange(PENDING, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => self.send(reply),
            Err(CLOSED) => debug!(unique = self.unique, "session closing, reply dropped"),
            Err(_) => {
                error!(unique = self.unique, kind = %self.kind, "request completed twice");
                if cfg!(debug_assertions) {
                    panic!("request {} ({}) completed twice", self.unique, self.kind);
                }
            }
        }
    }

    fn check(&self, reply: &Reply) -> Result<(), Violation> {
        let shape = reply.shape();
        if !self.kind.accepts(shape) {
            return Err(Violation::Shape {
                shape,
                kind: self.kind,
            });
        }

        let limit = self.limit.unwrap_or(u32::MAX);
        match reply {
            Reply::Error(errno) if !errno.is_valid() => Err(Violation::Errno(errno.raw())),
            Reply::Write(written) if *written > limit => Err(Violation::TooLong {
                len: *written as usize,
                limit,
            }),
            Reply::Data(data) | Reply::Dir(data) if data.len() > limit as usize => {
                Err(Violation::TooLong {
                    len: data.len(),
                    limit,
                })
            }
            Reply::Data(_) if self.kind != OperationKind::Read && limit == 0 => {
                Err(Violation::XattrSize(limit))
            }
            Reply::XattrSize(_) if limit != 0 => Err(Violation::XattrSize(limit)),
            _ => Ok(()),
        }
    }

    fn send(&self, reply: Reply) {
        let Some(session) = self.session.upgrade() else {
            debug!(unique = self.unique, "session gone, reply dropped");
            return;
        };
        session.untrack(self.unique);

        match reply.encode(self.unique, session.proto_minor()) {
            Ok(Some(frame)) => session.queue(frame),
            Ok(None) => {}
            Err(err) => {
                error!(unique = self.unique, "encode reply failed: {err}");
                session.queue(error_frame(self.unique, Errno::from(libc::EIO)));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn duplicate(&self) -> Self {
        Self {
            unique: self.unique,
            uid: self.uid,
            gid: self.gid,
            pid: self.pid,
            kind: self.kind,
            limit: self.limit,
            slot: self.slot.clone(),
            session: self.session.clone(),
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self
            .slot
            .state
            .compare_exchange(PENDING, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if self.kind.expects_reply() {
            warn!(
                unique = self.unique,
                kind = %self.kind,
                "request dropped without reply, answering EIO"
            );
            self.send(Reply::Error(Errno::from(libc::EIO)));
        }
    }
}
