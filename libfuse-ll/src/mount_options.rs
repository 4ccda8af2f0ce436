use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

use nix::unistd;

/// Mount options accepted by the kernel and by `fusermount3`.
///
/// Only the options relevant to the protocol harness are modelled; anything
/// else can be passed through [`MountOptions::custom_options`].
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub(crate) fs_name: Option<String>,
    pub(crate) subtype: Option<String>,
    pub(crate) uid: Option<u32>,
    pub(crate) gid: Option<u32>,
    pub(crate) allow_other: bool,
    pub(crate) allow_root: bool,
    pub(crate) read_only: bool,
    pub(crate) default_permissions: bool,
    pub(crate) nonempty: bool,
    pub(crate) max_read: Option<u32>,
    pub(crate) rootmode: Option<u32>,
    pub(crate) debug: bool,
    pub(crate) custom_options: Option<OsString>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            fs_name: None,
            subtype: None,
            uid: None,
            gid: None,
            allow_other: false,
            allow_root: false,
            read_only: false,
            default_permissions: false,
            nonempty: false,
            max_read: None,
            rootmode: None,
            debug: false,
            custom_options: None,
        }
    }
}

impl MountOptions {
    /// Set fuse filesystem name, default is **fuse**.
    pub fn fs_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.fs_name = Some(name.into());
        self
    }

    /// Set the filesystem subtype, reported as `fuse.<subtype>`.
    pub fn subtype(&mut self, subtype: impl Into<String>) -> &mut Self {
        self.subtype = Some(subtype.into());
        self
    }

    /// Set the uid of the mount owner, default is the current uid.
    pub fn uid(&mut self, uid: u32) -> &mut Self {
        self.uid = Some(uid);
        self
    }

    /// Set the gid of the mount owner, default is the current gid.
    pub fn gid(&mut self, gid: u32) -> &mut Self {
        self.gid = Some(gid);
        self
    }

    /// Allow all users to access the filesystem. Conflicts with `allow_root`.
    pub fn allow_other(&mut self, allow_other: bool) -> &mut Self {
        self.allow_other = allow_other;
        self
    }

    /// Allow root to access the filesystem. Conflicts with `allow_other`.
    pub fn allow_root(&mut self, allow_root: bool) -> &mut Self {
        self.allow_root = allow_root;
        self
    }

    pub fn read_only(&mut self, read_only: bool) -> &mut Self {
        self.read_only = read_only;
        self
    }

    /// Let the kernel do permission checking based on file modes.
    pub fn default_permissions(&mut self, default_permissions: bool) -> &mut Self {
        self.default_permissions = default_permissions;
        self
    }

    /// Allow mounting over a non-empty directory (fusermount only).
    pub fn nonempty(&mut self, nonempty: bool) -> &mut Self {
        self.nonempty = nonempty;
        self
    }

    /// Limit the size of a single read request.
    pub fn max_read(&mut self, max_read: u32) -> &mut Self {
        self.max_read = Some(max_read);
        self
    }

    /// Mode of the root inode, default is `S_IFDIR`.
    pub fn rootmode(&mut self, rootmode: u32) -> &mut Self {
        self.rootmode = Some(rootmode);
        self
    }

    /// Request verbose protocol logging.
    pub fn debug(&mut self, debug: bool) -> &mut Self {
        self.debug = debug;
        self
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Extra comma separated options appended verbatim.
    pub fn custom_options(&mut self, options: impl AsRef<OsStr>) -> &mut Self {
        self.custom_options = Some(options.as_ref().to_os_string());
        self
    }

    pub(crate) fn source(&self) -> &str {
        self.fs_name.as_deref().unwrap_or("fuse")
    }

    pub(crate) fn fs_type(&self) -> String {
        match &self.subtype {
            Some(subtype) => format!("fuse.{subtype}"),
            None => "fuse".to_string(),
        }
    }

    /// Options shared by the kernel and `fusermount3`.
    fn common_options(&self) -> Vec<String> {
        let mut opts = Vec::new();

        if self.allow_other {
            opts.push("allow_other".to_string());
        }
        if self.allow_root {
            opts.push("allow_root".to_string());
        }
        if self.default_permissions {
            opts.push("default_permissions".to_string());
        }
        if let Some(max_read) = self.max_read {
            opts.push(format!("max_read={max_read}"));
        }

        opts
    }

    /// Mount data for `mount(2)` against an already opened `/dev/fuse` fd.
    pub(crate) fn build_kernel_options(&self, fd: i32) -> OsString {
        let mut opts = vec![
            format!("fd={fd}"),
            format!(
                "user_id={}",
                self.uid.unwrap_or_else(|| unistd::getuid().as_raw())
            ),
            format!(
                "group_id={}",
                self.gid.unwrap_or_else(|| unistd::getgid().as_raw())
            ),
            format!("rootmode={:o}", self.rootmode.unwrap_or(libc::S_IFDIR as u32)),
        ];
        opts.extend(self.common_options());

        self.with_custom(opts.join(","))
    }

    /// The `-o` argument handed to `fusermount3`.
    #[cfg(feature = "unprivileged")]
    pub(crate) fn build_fusermount_options(&self) -> OsString {
        let mut opts = vec![
            format!("fsname={}", self.source()),
            format!(
                "user_id={}",
                self.uid.unwrap_or_else(|| unistd::getuid().as_raw())
            ),
            format!(
                "group_id={}",
                self.gid.unwrap_or_else(|| unistd::getgid().as_raw())
            ),
            format!("rootmode={:o}", self.rootmode.unwrap_or(libc::S_IFDIR as u32)),
        ];
        if let Some(subtype) = &self.subtype {
            opts.push(format!("subtype={subtype}"));
        }
        if self.read_only {
            opts.push("ro".to_string());
        }
        if self.nonempty {
            opts.push("nonempty".to_string());
        }
        opts.extend(self.common_options());

        self.with_custom(opts.join(","))
    }

    fn with_custom(&self, opts: String) -> OsString {
        let mut out = OsString::from(opts);
        if let Some(custom) = &self.custom_options {
            if !custom.as_bytes().is_empty() {
                out.push(",");
                out.push(custom);
            }
        }
        out
    }
}
