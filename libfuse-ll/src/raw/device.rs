//! The `/dev/fuse` transport.

use std::fmt::{self, Debug, Formatter};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::mount::{self, MntFlags, MsFlags};
use nix::unistd;
use tokio::io::unix::AsyncFd;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::raw::conn::MAX_WRITE_SIZE;
use crate::raw::transport::Transport;
use crate::MountOptions;

/// Room for the largest write plus its headers.
const BUFFER_SIZE: usize = MAX_WRITE_SIZE as usize + 4096;

const FUSE_DEVICE: &str = "/dev/fuse";

/// A mounted FUSE filesystem, read and written through its device fd.
pub struct FuseDevice {
    fd: AsyncFd<OwnedFd>,
    buffer: Mutex<Vec<u8>>,
    mountpoint: PathBuf,
    unprivileged: bool,
}

impl FuseDevice {
    fn new(fd: OwnedFd, mountpoint: PathBuf, unprivileged: bool) -> io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(fd)?,
            buffer: Mutex::new(vec![0; BUFFER_SIZE]),
            mountpoint,
            unprivileged,
        })
    }

    /// Mount with `mount(2)`; needs `CAP_SYS_ADMIN`.
    pub async fn mount(mountpoint: impl AsRef<Path>, options: &MountOptions) -> io::Result<Self> {
        let mountpoint = mountpoint.as_ref().to_path_buf();
        let fd: OwnedFd = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(FUSE_DEVICE)?
            .into();

        let data = options.build_kernel_options(fd.as_raw_fd());
        let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
        if options.read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        let fs_type = options.fs_type();

        mount::mount(
            Some(options.source()),
            &mountpoint,
            Some(fs_type.as_str()),
            flags,
            Some(data.as_os_str()),
        )?;
        info!(mountpoint = %mountpoint.display(), "mounted");

        Self::new(fd, mountpoint, false)
    }

    /// Mount through the setuid `fusermount3` helper, which passes the
    /// device fd back over a unix socket.
    #[cfg(feature = "unprivileged")]
    pub async fn mount_unprivileged(
        mountpoint: impl AsRef<Path>,
        options: &MountOptions,
    ) -> io::Result<Self> {
        use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
        use tokio::process::Command;

        let mountpoint = mountpoint.as_ref().to_path_buf();
        let fusermount = find_fusermount()?;
        let (parent, child) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;

        let status = Command::new(&fusermount)
            .arg("-o")
            .arg(options.build_fusermount_options())
            .arg("--")
            .arg(&mountpoint)
            .env("_FUSE_COMMFD", child.as_raw_fd().to_string())
            .status()
            .await?;
        drop(child);
        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} failed: {status}", fusermount.display()),
            ));
        }

        let fd = receive_fd(&parent)?;
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        info!(mountpoint = %mountpoint.display(), "mounted through fusermount3");

        Self::new(fd, mountpoint, true)
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Detach the mount. The running session then sees `ENODEV` and ends.
    pub async fn unmount(&self) -> io::Result<()> {
        #[cfg(feature = "unprivileged")]
        if self.unprivileged {
            let fusermount = find_fusermount()?;
            let status = tokio::process::Command::new(&fusermount)
                .arg("-u")
                .arg("-z")
                .arg("--")
                .arg(&self.mountpoint)
                .status()
                .await?;
            if !status.success() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{} -u failed: {status}", fusermount.display()),
                ));
            }
            return Ok(());
        }

        mount::umount2(&self.mountpoint, MntFlags::MNT_DETACH)?;
        Ok(())
    }
}

impl Debug for FuseDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuseDevice")
            .field("fd", &self.fd.get_ref().as_raw_fd())
            .field("mountpoint", &self.mountpoint)
            .field("unprivileged", &self.unprivileged)
            .finish()
    }
}

impl Transport for FuseDevice {
    async fn receive(&self) -> io::Result<Option<Bytes>> {
        let mut buffer = self.buffer.lock().await;

        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|fd| {
                unistd::read(fd.get_ref().as_raw_fd(), &mut buffer).map_err(io::Error::from)
            });

            match result {
                Ok(Ok(n)) => return Ok(Some(Bytes::copy_from_slice(&buffer[..n]))),
                Ok(Err(err)) => match err.raw_os_error() {
                    // The request was interrupted before we could read it.
                    Some(libc::ENOENT) | Some(libc::EINTR) => continue,
                    Some(libc::ENODEV) => {
                        debug!("fuse device reports unmount");
                        return Ok(None);
                    }
                    _ => return Err(err),
                },
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&self, reply: Bytes) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            let result =
                guard.try_io(|fd| unistd::write(fd.get_ref(), &reply).map_err(io::Error::from));

            match result {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(err)) => match err.raw_os_error() {
                    // The kernel already gave up on this request.
                    Some(libc::ENOENT) => return Ok(()),
                    Some(libc::EINTR) => continue,
                    _ => return Err(err),
                },
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(feature = "unprivileged")]
fn find_fusermount() -> io::Result<PathBuf> {
    which::which("fusermount3").map_err(|err| io::Error::new(io::ErrorKind::NotFound, err))
}

#[cfg(feature = "unprivileged")]
fn receive_fd(socket: &OwnedFd) -> io::Result<OwnedFd> {
    use std::io::IoSliceMut;
    use std::os::fd::{FromRawFd, RawFd};

    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};

    let mut data = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut data)];
    let mut cmsg = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(socket.as_raw_fd(), &mut iov, Some(&mut cmsg), MsgFlags::empty())?;

    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(fd) = fds.first() {
                // SAFETY: the fd was just received through SCM_RIGHTS and is owned by no one else.
                return Ok(unsafe { OwnedFd::from_raw_fd(*fd) });
            }
        }
    }

    Err(io::Error::new(
        io::ErrorKind::Other,
        "fusermount3 did not pass a file descriptor",
    ))
}
