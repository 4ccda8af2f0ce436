use std::fmt::{self, Display, Formatter};
use std::io::{Error as IoError, ErrorKind};
use std::os::raw::c_int;

/// Errno of a failed request.
///
/// The wrapped value is the positive error number; it is negated when it is
/// written into a reply header.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Errno(c_int);

impl Errno {
    /// Largest error number the kernel accepts in a reply.
    pub(crate) const MAX: c_int = 4095;

    pub const fn raw(self) -> c_int {
        self.0
    }

    /// Whether the kernel accepts this value as an error reply.
    pub(crate) fn is_valid(self) -> bool {
        self.0 > 0 && self.0 <= Self::MAX
    }

    pub fn new_not_exist() -> Self {
        Self(libc::ENOENT)
    }

    pub fn new_exist() -> Self {
        Self(libc::EEXIST)
    }

    pub fn new_is_dir() -> Self {
        Self(libc::EISDIR)
    }

    pub fn new_is_not_dir() -> Self {
        Self(libc::ENOTDIR)
    }

    pub fn is_not_exist(&self) -> bool {
        self.0 == libc::ENOENT
    }

    pub fn is_dir(&self) -> bool {
        self.0 == libc::EISDIR
    }

    pub fn is_not_dir(&self) -> bool {
        self.0 == libc::ENOTDIR
    }
}

impl From<Errno> for c_int {
    fn from(errno: Errno) -> Self {
        errno.0
    }
}

impl From<c_int> for Errno {
    fn from(errno: c_int) -> Self {
        Self(errno)
    }
}

impl From<IoError> for Errno {
    fn from(err: IoError) -> Self {
        if let Some(errno) = err.raw_os_error() {
            return Self(errno);
        }

        match err.kind() {
            ErrorKind::NotFound => Self(libc::ENOENT),
            ErrorKind::PermissionDenied => Self(libc::EACCES),
            ErrorKind::AlreadyExists => Self(libc::EEXIST),
            ErrorKind::InvalidInput => Self(libc::EINVAL),
            ErrorKind::Unsupported => Self(libc::ENOSYS),
            _ => Self(libc::EIO),
        }
    }
}

impl From<Errno> for IoError {
    fn from(errno: Errno) -> Self {
        IoError::from_raw_os_error(errno.0)
    }
}

impl From<nix::Error> for Errno {
    fn from(err: nix::Error) -> Self {
        Self(err as c_int)
    }
}

impl Display for Errno {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "errno is {}", self.0)
    }
}

impl std::error::Error for Errno {}
