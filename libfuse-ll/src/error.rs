use std::io;

use thiserror::Error;

use crate::raw::CapabilityFlags;
use crate::Errno;

/// Errors that end a [`Session`][crate::raw::Session].
///
/// Per-request failures never show up here; they are answered to the kernel
/// and the session keeps running.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport failed: {0}")]
    Io(#[from] io::Error),

    #[error("kernel speaks unsupported protocol {major}.{minor}")]
    UnsupportedProtocol { major: u32, minor: u32 },

    #[error("filesystem wants capabilities the kernel does not offer: {unsupported:?}")]
    Capability { unsupported: CapabilityFlags },

    #[error("init handler rejected the connection: {0}")]
    InitRejected(Errno),

    #[error("transport closed before the init handshake completed")]
    ClosedBeforeInit,
}
