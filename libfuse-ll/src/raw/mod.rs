//! The request/reply protocol between the kernel and a filesystem.

pub use conn::{CapabilityFlags, ConnectionConfig, ConnectionInfo, MAX_WRITE_SIZE};
#[cfg(target_os = "linux")]
pub use device::FuseDevice;
pub use file_info::{FileInfo, Opened};
pub use operation::{Operation, OperationArgs, OperationKind};
pub use reply::{DirBuf, Entry, FileAttr, ReplyShape, StatFs};
pub use request::Request;
pub use session::{Session, SessionState, ShutdownHandle};
pub use table::{DestroyHandler, Handler, InitHandler, OperationTable};
pub use transport::{channel, ChannelTransport, KernelEnd, Transport};

pub mod abi;
mod conn;
#[cfg(target_os = "linux")]
mod device;
mod file_info;
pub mod op;
mod operation;
mod reply;
mod request;
mod session;
mod table;
mod transport;
