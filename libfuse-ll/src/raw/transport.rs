use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;
use tokio::sync::Mutex;

/// The byte channel between the kernel and a session.
///
/// Each received buffer is exactly one request; each sent buffer is exactly
/// one reply.
#[trait_make::make(Send)]
pub trait Transport: Send + Sync + 'static {
    /// Next request from the kernel. `Ok(None)` means the filesystem was
    /// unmounted or the channel closed.
    async fn receive(&self) -> io::Result<Option<Bytes>>;

    async fn send(&self, reply: Bytes) -> io::Result<()>;
}

impl<T: Transport> Transport for Arc<T> {
    async fn receive(&self) -> io::Result<Option<Bytes>> {
        (**self).receive().await
    }

    async fn send(&self, reply: Bytes) -> io::Result<()> {
        (**self).send(reply).await
    }
}

/// An in-memory transport, for embedding a session in another process or
/// driving one from tests. The [`KernelEnd`] plays the kernel's part.
pub fn channel() -> (ChannelTransport, KernelEnd) {
    let (request_tx, request_rx) = mpsc::unbounded();
    let (reply_tx, reply_rx) = mpsc::unbounded();

    (
        ChannelTransport {
            requests: Mutex::new(request_rx),
            replies: reply_tx,
        },
        KernelEnd {
            requests: request_tx,
            replies: reply_rx,
        },
    )
}

/// Session side of [`channel`].
#[derive(Debug)]
pub struct ChannelTransport {
    requests: Mutex<UnboundedReceiver<Bytes>>,
    replies: UnboundedSender<Bytes>,
}

impl Transport for ChannelTransport {
    async fn receive(&self) -> io::Result<Option<Bytes>> {
        Ok(self.requests.lock().await.next().await)
    }

    async fn send(&self, reply: Bytes) -> io::Result<()> {
        self.replies
            .unbounded_send(reply)
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

/// Kernel side of [`channel`].
#[derive(Debug)]
pub struct KernelEnd {
    requests: UnboundedSender<Bytes>,
    replies: UnboundedReceiver<Bytes>,
}

impl KernelEnd {
    /// Queue a raw request for the session.
    pub fn send_request(&self, request: impl Into<Bytes>) -> io::Result<()> {
        self.requests
            .unbounded_send(request.into())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    /// Simulate an unmount: the session sees the end of the request stream.
    pub fn close(&self) {
        self.requests.close_channel();
    }

    /// Next reply, or `None` once the session dropped its end.
    pub async fn reply(&mut self) -> Option<Bytes> {
        self.replies.next().await
    }

    /// A reply if one is already queued.
    pub fn try_reply(&mut self) -> Option<Bytes> {
        self.replies.try_recv().ok()
    }
}
