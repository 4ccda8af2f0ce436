use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use async_notify::Notify;
use bytes::Bytes;
use futures_channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;
use tracing::{debug, error, info, instrument, warn};

use crate::raw::abi::*;
use crate::raw::conn::{ConnectionConfig, ConnectionInfo};
use crate::raw::operation::{decode_header, decode_message, Message, Operation};
use crate::raw::reply::{empty_frame, error_frame, init_frame};
use crate::raw::request::{Request, Slot};
use crate::raw::table::OperationTable;
use crate::raw::transport::Transport;
use crate::{Errno, SessionError};

/// Lifecycle of a [`Session`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    /// Waiting for the kernel's INIT.
    Created,
    /// INIT received, reply not sent yet.
    Initializing,
    /// Requests are dispatched to the operation table.
    Running,
    /// Unmounted or asked to stop; pending requests are being failed.
    Destroying,
    /// Nothing left to do.
    Terminated,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Created,
            1 => SessionState::Initializing,
            2 => SessionState::Running,
            3 => SessionState::Destroying,
            _ => SessionState::Terminated,
        }
    }
}

/// Session state reachable from request handles.
#[derive(Debug)]
pub(crate) struct Shared {
    replies: UnboundedSender<Bytes>,
    pending: Mutex<HashMap<u64, Arc<Slot>>>,
    conn: OnceLock<ConnectionInfo>,
    state: AtomicU8,
}

impl Shared {
    pub(crate) fn new(replies: UnboundedSender<Bytes>) -> Self {
        Self {
            replies,
            pending: Mutex::new(HashMap::new()),
            conn: OnceLock::new(),
            state: AtomicU8::new(SessionState::Created as u8),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Arc<Slot>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        debug!(?state, "session state");
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn connection(&self) -> Option<ConnectionInfo> {
        self.conn.get().copied()
    }

    /// Minor version used to lay out replies.
    pub(crate) fn proto_minor(&self) -> u32 {
        self.conn
            .get()
            .map_or(FUSE_KERNEL_MINOR_VERSION, ConnectionInfo::proto_minor)
    }

    pub(crate) fn queue(&self, frame: Bytes) {
        if self.replies.unbounded_send(frame).is_err() {
            debug!("reply channel closed, reply dropped");
        }
    }

    pub(crate) fn track(&self, slot: Arc<Slot>) {
        self.pending().insert(slot.unique(), slot);
    }

    pub(crate) fn untrack(&self, unique: u64) {
        self.pending().remove(&unique);
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Flag request `unique` as interrupted. `false` if it is not pending.
    fn interrupt(&self, unique: u64) -> bool {
        let slot = self.pending().get(&unique).cloned();
        match slot {
            Some(slot) => {
                slot.interrupt();
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with `ENOTCONN`. Late replies from their
    /// handlers are dropped.
    fn close_pending(&self) -> usize {
        let slots: Vec<_> = self.pending().drain().map(|(_, slot)| slot).collect();

        let mut closed = 0;
        for slot in slots {
            if slot.close() {
                self.queue(error_frame(slot.unique(), Errno::from(libc::ENOTCONN)));
                closed += 1;
            }
        }

        closed
    }
}

/// Stops a running session from outside, as if the filesystem was unmounted.
#[derive(Clone)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
    shared: Arc<Shared>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.notify.notify();
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }
}

impl Debug for ShutdownHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// One connection to the kernel.
///
/// The session owns the transport, the operation table and the user data.
/// [`run`][Session::run] performs the INIT handshake, dispatches requests
/// until the transport reports an unmount or a shutdown is requested, then
/// runs the destroy handler and fails whatever is still pending.
///
/// Handlers run on the dispatch loop itself. A handler that needs to wait
/// should move its [`Request`] into a spawned task; the loop never waits for
/// a reply. Requests are handed out in the order the kernel sent them;
/// keeping that order for concurrent work on one file is up to the
/// filesystem.
pub struct Session<T, U> {
    transport: Arc<T>,
    table: OperationTable<U>,
    user: Arc<U>,
    shared: Arc<Shared>,
    replies: UnboundedReceiver<Bytes>,
    shutdown: Arc<Notify>,
}

enum Exit {
    Unmounted,
    Shutdown,
    Destroy(u64),
}

impl<T: Transport, U: Send + Sync + 'static> Session<T, U> {
    pub fn new(transport: T, table: OperationTable<U>, user_data: U) -> Self {
        let (tx, rx) = mpsc::unbounded();

        Self {
            transport: Arc::new(transport),
            table,
            user: Arc::new(user_data),
            shared: Arc::new(Shared::new(tx)),
            replies: rx,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            notify: self.shutdown.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Serve the connection until it ends.
    ///
    /// Returns `Ok(())` on unmount, kernel DESTROY or shutdown. Failing the
    /// handshake or losing the transport is an error.
    #[instrument(name = "fuse_session", skip_all)]
    pub async fn run(self) -> Result<(), SessionError> {
        let Session {
            transport,
            table,
            user,
            shared,
            replies,
            shutdown,
        } = self;

        let writer = tokio::spawn(write_replies(transport.clone(), replies));
        let dispatcher = Dispatcher {
            transport,
            table,
            user,
            shared,
        };

        let result = dispatcher.serve(&shutdown).await;
        let exit = match &result {
            Ok(exit) => Some(exit),
            Err(_) => None,
        };
        dispatcher.wind_down(exit);

        if let Err(err) = writer.await {
            error!("reply writer failed: {err}");
        }
        dispatcher.shared.set_state(SessionState::Terminated);
        info!("unmounted");

        result.map(|_| ())
    }
}

struct Dispatcher<T, U> {
    transport: Arc<T>,
    table: OperationTable<U>,
    user: Arc<U>,
    shared: Arc<Shared>,
}

impl<T: Transport, U: Send + Sync + 'static> Dispatcher<T, U> {
    async fn serve(&self, shutdown: &Notify) -> Result<Exit, SessionError> {
        loop {
            let frame = tokio::select! {
                frame = self.transport.receive() => frame?,
                _ = shutdown.notified() => {
                    info!("shutdown requested");
                    return Ok(Exit::Shutdown);
                }
            };

            let Some(frame) = frame else {
                if self.shared.state() < SessionState::Running {
                    return Err(SessionError::ClosedBeforeInit);
                }
                return Ok(Exit::Unmounted);
            };

            if let Some(exit) = self.handle_frame(frame)? {
                return Ok(exit);
            }
        }
    }

    fn handle_frame(&self, frame: Bytes) -> Result<Option<Exit>, SessionError> {
        let header = match decode_header(&frame) {
            Ok(header) => header,
            Err(err) => {
                warn!("dropping malformed message: {err}");
                return Ok(None);
            }
        };

        let message = match decode_message(&header, frame, self.shared.proto_minor()) {
            Ok(message) => message,
            Err(err) => {
                warn!(unique = header.unique, opcode = header.opcode, "malformed request: {err}");
                if !matches!(header.opcode, FUSE_FORGET | FUSE_BATCH_FORGET) {
                    self.reply_errno(header.unique, libc::EIO);
                }
                return Ok(None);
            }
        };

        let state = self.shared.state();
        match message {
            Message::Init(init) if state == SessionState::Created => self.init(&header, init)?,
            Message::Init(_) => {
                warn!(unique = header.unique, "unexpected INIT");
                self.reply_errno(header.unique, libc::EIO);
            }
            Message::Forget(_) if state != SessionState::Running => {}
            _ if state != SessionState::Running => {
                warn!(unique = header.unique, opcode = header.opcode, "request before INIT");
                self.reply_errno(header.unique, libc::EIO);
            }
            Message::Destroy => return Ok(Some(Exit::Destroy(header.unique))),
            Message::Interrupt(target) => {
                if self.shared.interrupt(target) {
                    debug!(unique = target, "request interrupted");
                } else {
                    self.reply_errno(header.unique, libc::EAGAIN);
                }
            }
            Message::Forget(forgets) => {
                for forget in forgets {
                    self.dispatch(&header, Operation::Forget(forget));
                }
            }
            Message::Operation(operation) => self.dispatch(&header, operation),
            Message::Unsupported(opcode) => {
                debug!(unique = header.unique, opcode, "unsupported opcode");
                self.reply_errno(header.unique, libc::ENOSYS);
            }
        }

        Ok(None)
    }

    fn init(&self, header: &fuse_in_header, init: fuse_init_in) -> Result<(), SessionError> {
        self.shared.set_state(SessionState::Initializing);
        debug!(major = init.major, minor = init.minor, flags = init.flags, "INIT");

        if init.major < FUSE_KERNEL_VERSION {
            error!(major = init.major, minor = init.minor, "unsupported protocol version");
            self.reply_errno(header.unique, libc::EPROTO);
            return Err(SessionError::UnsupportedProtocol {
                major: init.major,
                minor: init.minor,
            });
        }

        if init.major > FUSE_KERNEL_VERSION {
            // The kernel retries with our major version after seeing it.
            let out = fuse_init_out {
                major: FUSE_KERNEL_VERSION,
                minor: FUSE_KERNEL_MINOR_VERSION,
                ..Default::default()
            };
            let frame =
                init_frame(header.unique, &out, FUSE_KERNEL_MINOR_VERSION).map_err(invalid_data)?;
            self.shared.queue(frame);
            self.shared.set_state(SessionState::Created);
            return Ok(());
        }

        let minor = init.minor.min(FUSE_KERNEL_MINOR_VERSION);
        let mut config = ConnectionConfig::new(&init, minor);
        if let Some(handler) = self.table.init_handler() {
            let call = AssertUnwindSafe(|| handler(&self.user, &mut config));
            let result = panic::catch_unwind(call).unwrap_or_else(|panic| {
                error!("init handler panicked: {}", panic_message(&*panic));
                Err(Errno::from(libc::EIO))
            });
            if let Err(errno) = result {
                let errno = if errno.is_valid() {
                    errno
                } else {
                    Errno::from(libc::EIO)
                };
                error!("init handler refused the connection: {errno}");
                self.shared.queue(error_frame(header.unique, errno));
                return Err(SessionError::InitRejected(errno));
            }
        }

        let info = match config.finish(init.max_readahead) {
            Ok(info) => info,
            Err(err) => {
                error!("{err}");
                self.reply_errno(header.unique, libc::EPROTO);
                return Err(err);
            }
        };

        let frame = init_frame(header.unique, &info.init_out(), minor).map_err(invalid_data)?;
        // Set before queueing: replies encoded from now on use the negotiated minor.
        let _ = self.shared.conn.set(info);
        self.shared.queue(frame);
        self.shared.set_state(SessionState::Running);

        info!(
            major = FUSE_KERNEL_VERSION,
            minor,
            want = ?info.want(),
            max_write = info.max_write(),
            "connection initialized"
        );

        Ok(())
    }

    fn dispatch(&self, header: &fuse_in_header, operation: Operation) {
        let kind = operation.kind();
        debug!(unique = header.unique, nodeid = header.nodeid, %kind, "dispatch");

        let req = Request::new(header, kind, operation.reply_limit(), &self.shared);
        match self.table.resolve(kind) {
            Some(handler) => {
                // An unwinding handler drops its request, which answers EIO.
                let call = AssertUnwindSafe(|| handler(&self.user, req, operation));
                if let Err(panic) = panic::catch_unwind(call) {
                    error!(
                        unique = header.unique,
                        %kind,
                        "handler panicked: {}",
                        panic_message(&*panic)
                    );
                }
            }
            None if kind.expects_reply() => req.reply_err(libc::ENOSYS),
            None => req.reply_none(),
        }
    }

    fn reply_errno(&self, unique: u64, errno: i32) {
        self.shared.queue(error_frame(unique, Errno::from(errno)));
    }

    /// Leave the running state: destroy handler, forced completion of
    /// pending requests, then close the reply channel so the writer drains
    /// and stops.
    fn wind_down(&self, exit: Option<&Exit>) {
        let initialized = self.shared.connection().is_some();
        self.shared.set_state(SessionState::Destroying);

        if initialized {
            if let Some(handler) = self.table.destroy_handler() {
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler(&self.user))) {
                    error!("destroy handler panicked: {}", panic_message(&*panic));
                }
            }
        }

        let closed = self.shared.close_pending();
        if closed > 0 {
            info!(closed, "failed pending requests");
        }

        match exit {
            Some(Exit::Destroy(unique)) => self.shared.queue(empty_frame(*unique)),
            Some(Exit::Unmounted) | Some(Exit::Shutdown) | None => {}
        }

        self.shared.replies.close_channel();
    }
}

async fn write_replies<T: Transport>(transport: Arc<T>, mut replies: UnboundedReceiver<Bytes>) {
    while let Some(frame) = replies.next().await {
        if let Err(err) = transport.send(frame).await {
            error!("send reply failed: {err}");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

fn invalid_data(err: bincode::Error) -> SessionError {
    SessionError::Io(io::Error::new(io::ErrorKind::InvalidData, err))
}
