// A writable filesystem kept entirely in memory. Everything is lost on
// unmount.

use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use clap::Parser;
use libfuse_ll::raw::{
    op, DirBuf, Entry, FileAttr, FuseDevice, OperationTable, Opened, Session, StatFs,
};
use libfuse_ll::{Errno, FileType, MountOptions, SetAttr, TimeOrNow, Timestamp, ROOT_INODE};
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 4096;
const MAX_NAME: usize = 255;

#[derive(Parser, Debug)]
#[command(author, version, about = "Mount an empty in-memory filesystem")]
struct Args {
    /// Mount point path
    #[arg(long)]
    mountpoint: String,
    /// Mount with mount(2) instead of fusermount3
    #[arg(long, default_value_t = false)]
    privileged: bool,
    /// Log every dispatched request
    #[arg(long, default_value_t = false)]
    debug: bool,
}

struct Node {
    attr: FileAttr,
    parent: u64,
    data: Vec<u8>,
    children: BTreeMap<OsString, u64>,
}

impl Node {
    fn is_dir(&self) -> bool {
        self.attr.kind == FileType::Directory
    }
}

struct Inodes {
    nodes: HashMap<u64, Node>,
    next_ino: u64,
}

impl Inodes {
    fn new(uid: u32, gid: u32) -> Self {
        let mut attr = FileAttr::new(ROOT_INODE, FileType::Directory, 0o755);
        attr.nlink = 2;
        attr.uid = uid;
        attr.gid = gid;
        stamp(&mut attr);

        let root = Node {
            attr,
            parent: ROOT_INODE,
            data: Vec::new(),
            children: BTreeMap::new(),
        };
        Self {
            nodes: HashMap::from([(ROOT_INODE, root)]),
            next_ino: ROOT_INODE + 1,
        }
    }

    fn node(&self, ino: u64) -> Result<&Node, Errno> {
        self.nodes.get(&ino).ok_or_else(Errno::new_not_exist)
    }

    fn node_mut(&mut self, ino: u64) -> Result<&mut Node, Errno> {
        self.nodes.get_mut(&ino).ok_or_else(Errno::new_not_exist)
    }

    fn dir(&self, ino: u64) -> Result<&Node, Errno> {
        let node = self.node(ino)?;
        if !node.is_dir() {
            return Err(Errno::new_is_not_dir());
        }
        Ok(node)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<u64, Errno> {
        self.dir(parent)?
            .children
            .get(name)
            .copied()
            .ok_or_else(Errno::new_not_exist)
    }

    fn lookup(&self, parent: u64, name: &OsStr) -> Result<FileAttr, Errno> {
        let ino = self.child(parent, name)?;
        Ok(self.node(ino)?.attr)
    }

    fn insert(
        &mut self,
        parent: u64,
        name: OsString,
        kind: FileType,
        perm: u16,
        owner: (u32, u32),
    ) -> Result<FileAttr, Errno> {
        if name.len() > MAX_NAME {
            return Err(libc::ENAMETOOLONG.into());
        }
        if self.dir(parent)?.children.contains_key(&name) {
            return Err(Errno::new_exist());
        }

        let ino = self.next_ino;
        self.next_ino += 1;

        let mut attr = FileAttr::new(ino, kind, perm);
        (attr.uid, attr.gid) = owner;
        stamp(&mut attr);
        if kind == FileType::Directory {
            attr.nlink = 2;
        }

        let dir = self.node_mut(parent)?;
        dir.children.insert(name, ino);
        touch(&mut dir.attr);
        if kind == FileType::Directory {
            dir.attr.nlink += 1;
        }

        self.nodes.insert(
            ino,
            Node {
                attr,
                parent,
                data: Vec::new(),
                children: BTreeMap::new(),
            },
        );
        Ok(attr)
    }

    fn setattr(&mut self, ino: u64, set: &SetAttr) -> Result<FileAttr, Errno> {
        let node = self.node_mut(ino)?;
        if let Some(size) = set.size {
            if node.is_dir() {
                return Err(Errno::new_is_dir());
            }
            node.data.resize(size as usize, 0);
            resize(&mut node.attr, size);
            node.attr.mtime = SystemTime::now().into();
        }
        if let Some(mode) = set.mode {
            node.attr.perm = (mode & 0o7777) as u16;
        }
        if let Some(uid) = set.uid {
            node.attr.uid = uid;
        }
        if let Some(gid) = set.gid {
            node.attr.gid = gid;
        }
        if let Some(atime) = set.atime {
            node.attr.atime = resolve(atime);
        }
        if let Some(mtime) = set.mtime {
            node.attr.mtime = resolve(mtime);
        }
        node.attr.ctime = set.ctime.unwrap_or_else(|| SystemTime::now().into());
        Ok(node.attr)
    }

    fn read(&self, ino: u64, offset: u64, size: u32) -> Result<Bytes, Errno> {
        let node = self.node(ino)?;
        if node.is_dir() {
            return Err(Errno::new_is_dir());
        }
        let start = (offset as usize).min(node.data.len());
        let end = start.saturating_add(size as usize).min(node.data.len());
        Ok(Bytes::copy_from_slice(&node.data[start..end]))
    }

    fn write(&mut self, ino: u64, offset: u64, data: &[u8]) -> Result<u32, Errno> {
        let node = self.node_mut(ino)?;
        if node.is_dir() {
            return Err(Errno::new_is_dir());
        }
        let start = offset as usize;
        let end = start.checked_add(data.len()).ok_or(Errno::from(libc::EFBIG))?;
        if end > node.data.len() {
            node.data.resize(end, 0);
        }
        node.data[start..end].copy_from_slice(data);
        resize(&mut node.attr, node.data.len() as u64);
        touch(&mut node.attr);
        Ok(data.len() as u32)
    }

    /// Unlink `name` from `parent`; `dir` selects rmdir semantics.
    fn remove(&mut self, parent: u64, name: &OsStr, dir: bool) -> Result<(), Errno> {
        let ino = self.child(parent, name)?;
        let node = self.node(ino)?;
        match (dir, node.is_dir()) {
            (false, true) => return Err(Errno::new_is_dir()),
            (true, false) => return Err(Errno::new_is_not_dir()),
            (true, true) if !node.children.is_empty() => return Err(libc::ENOTEMPTY.into()),
            _ => {}
        }

        self.nodes.remove(&ino);
        let parent = self.node_mut(parent)?;
        parent.children.remove(name);
        touch(&mut parent.attr);
        if dir {
            parent.attr.nlink -= 1;
        }
        Ok(())
    }

    fn rename(&mut self, args: &op::Rename) -> Result<(), Errno> {
        let noreplace = libc::RENAME_NOREPLACE as u32;
        if args.flags & !noreplace != 0 {
            return Err(libc::EINVAL.into());
        }

        let ino = self.child(args.parent, &args.name)?;
        self.dir(args.new_parent)?;
        let moving_dir = self.node(ino)?.is_dir();

        // A directory cannot move below itself.
        let mut cursor = args.new_parent;
        while moving_dir && cursor != ROOT_INODE {
            if cursor == ino {
                return Err(libc::EINVAL.into());
            }
            cursor = self.node(cursor)?.parent;
        }

        if let Ok(target) = self.child(args.new_parent, &args.new_name) {
            if target == ino {
                return Ok(());
            }
            if args.flags & noreplace != 0 {
                return Err(Errno::new_exist());
            }
            let target_dir = self.node(target)?.is_dir();
            match (moving_dir, target_dir) {
                (false, true) => return Err(Errno::new_is_dir()),
                (true, false) => return Err(Errno::new_is_not_dir()),
                _ => self.remove(args.new_parent, &args.new_name, target_dir)?,
            }
        }

        let old_parent = self.node_mut(args.parent)?;
        old_parent.children.remove(&args.name);
        touch(&mut old_parent.attr);
        if moving_dir {
            old_parent.attr.nlink -= 1;
        }

        let new_parent = self.node_mut(args.new_parent)?;
        new_parent.children.insert(args.new_name.clone(), ino);
        touch(&mut new_parent.attr);
        if moving_dir {
            new_parent.attr.nlink += 1;
        }

        let node = self.node_mut(ino)?;
        node.parent = args.new_parent;
        node.attr.ctime = SystemTime::now().into();
        Ok(())
    }

    fn entries(&self, ino: u64) -> Result<Vec<(u64, FileType, OsString)>, Errno> {
        let dir = self.dir(ino)?;
        let mut entries = vec![
            (ino, FileType::Directory, OsString::from(".")),
            (dir.parent, FileType::Directory, OsString::from("..")),
        ];
        for (name, child) in &dir.children {
            entries.push((*child, self.node(*child)?.attr.kind, name.clone()));
        }
        Ok(entries)
    }

    fn statfs(&self) -> StatFs {
        let used: u64 = self.nodes.values().map(|node| node.attr.blocks).sum();
        StatFs {
            blocks: used,
            files: self.nodes.len() as u64,
            bsize: BLOCK_SIZE,
            frsize: BLOCK_SIZE,
            namelen: MAX_NAME as u32,
            ..Default::default()
        }
    }
}

fn stamp(attr: &mut FileAttr) {
    let now: Timestamp = SystemTime::now().into();
    attr.atime = now;
    attr.mtime = now;
    attr.ctime = now;
}

fn touch(attr: &mut FileAttr) {
    let now: Timestamp = SystemTime::now().into();
    attr.mtime = now;
    attr.ctime = now;
}

fn resize(attr: &mut FileAttr, size: u64) {
    attr.size = size;
    attr.blocks = size.div_ceil(512);
}

fn resolve(time: TimeOrNow) -> Timestamp {
    match time {
        TimeOrNow::Specific(time) => time,
        TimeOrNow::Now => SystemTime::now().into(),
    }
}

fn perm(mode: u32, umask: u32) -> u16 {
    (mode & !umask & 0o7777) as u16
}

fn entry(attr: FileAttr) -> Entry {
    Entry::new(attr).attr_ttl(TTL).entry_ttl(TTL)
}

struct MemFs {
    inodes: Mutex<Inodes>,
}

impl MemFs {
    fn inodes(&self) -> MutexGuard<'_, Inodes> {
        self.inodes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn operations() -> OperationTable<MemFs> {
    let mut table = OperationTable::<MemFs>::new();
    table
        .on::<op::Lookup, _>(|fs, req, args| match fs.inodes().lookup(args.parent, &args.name) {
            Ok(attr) => req.reply_entry(entry(attr)),
            Err(errno) => req.reply_err(errno),
        })
        .on::<op::Getattr, _>(|fs, req, args| match fs.inodes().node(args.ino) {
            Ok(node) => req.reply_attr(node.attr, TTL),
            Err(errno) => req.reply_err(errno),
        })
        .on::<op::Setattr, _>(|fs, req, args| match fs.inodes().setattr(args.ino, &args.attr) {
            Ok(attr) => req.reply_attr(attr, TTL),
            Err(errno) => req.reply_err(errno),
        })
        .on::<op::Mkdir, _>(|fs, req, args| {
            let owner = (req.uid(), req.gid());
            let perm = perm(args.mode, args.umask);
            match fs.inodes().insert(args.parent, args.name, FileType::Directory, perm, owner) {
                Ok(attr) => req.reply_entry(entry(attr)),
                Err(errno) => req.reply_err(errno),
            }
        })
        .on::<op::Create, _>(|fs, req, args| {
            let owner = (req.uid(), req.gid());
            let perm = perm(args.mode, args.umask);
            match fs.inodes().insert(args.parent, args.name, FileType::RegularFile, perm, owner) {
                Ok(attr) => req.reply_create(entry(attr), Opened::new(0)),
                Err(errno) => req.reply_err(errno),
            }
        })
        .on::<op::Open, _>(|fs, req, args| {
            let mut inodes = fs.inodes();
            let node = match inodes.node_mut(args.ino) {
                Ok(node) => node,
                Err(errno) => return req.reply_err(errno),
            };
            if node.is_dir() {
                return req.reply_err(Errno::new_is_dir());
            }
            if args.flags & libc::O_TRUNC as u32 != 0 {
                node.data.clear();
                resize(&mut node.attr, 0);
                touch(&mut node.attr);
            }
            req.reply_open(Opened::new(0));
        })
        .on::<op::Read, _>(|fs, req, args| {
            match fs.inodes().read(args.ino, args.offset, args.size) {
                Ok(data) => req.reply_data(data),
                Err(errno) => req.reply_err(errno),
            }
        })
        .on::<op::Write, _>(|fs, req, args| {
            match fs.inodes().write(args.ino, args.offset, &args.data) {
                Ok(written) => req.reply_write(written),
                Err(errno) => req.reply_err(errno),
            }
        })
        .on::<op::Flush, _>(|_, req, _| req.reply_empty())
        .on::<op::Release, _>(|_, req, _| req.reply_empty())
        .on::<op::Fsync, _>(|_, req, _| req.reply_empty())
        .on::<op::Unlink, _>(|fs, req, args| {
            match fs.inodes().remove(args.parent, &args.name, false) {
                Ok(()) => req.reply_empty(),
                Err(errno) => req.reply_err(errno),
            }
        })
        .on::<op::Rmdir, _>(|fs, req, args| {
            match fs.inodes().remove(args.parent, &args.name, true) {
                Ok(()) => req.reply_empty(),
                Err(errno) => req.reply_err(errno),
            }
        })
        .on::<op::Rename, _>(|fs, req, args| match fs.inodes().rename(&args) {
            Ok(()) => req.reply_empty(),
            Err(errno) => req.reply_err(errno),
        })
        .on::<op::Opendir, _>(|fs, req, args| match fs.inodes().dir(args.ino) {
            Ok(_) => req.reply_open(Opened::new(0)),
            Err(errno) => req.reply_err(errno),
        })
        .on::<op::Readdir, _>(|fs, req, args| {
            let entries = match fs.inodes().entries(args.ino) {
                Ok(entries) => entries,
                Err(errno) => return req.reply_err(errno),
            };
            let mut dir = DirBuf::new(args.size);
            let skip = args.offset as usize;
            for (index, (ino, kind, name)) in entries.into_iter().enumerate().skip(skip) {
                if !dir.push(ino, index as u64 + 1, kind, name) {
                    break;
                }
            }
            req.reply_dir(dir);
        })
        .on::<op::Releasedir, _>(|_, req, _| req.reply_empty())
        .on::<op::Statfs, _>(|fs, req, _| req.reply_statfs(fs.inodes().statfs()))
        .on_destroy(|fs| {
            let count = fs.inodes().nodes.len();
            debug!(count, "dropping inodes");
            info!("memfs destroyed");
        });

    table
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut options = MountOptions::default();
    options.fs_name("memfs").debug(args.debug);

    let level = if options.is_debug() { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    let device = if args.privileged {
        FuseDevice::mount(&args.mountpoint, &options).await
    } else {
        FuseDevice::mount_unprivileged(&args.mountpoint, &options).await
    };
    let device = match device {
        Ok(device) => Arc::new(device),
        Err(err) => {
            error!("mount {} failed: {err}", args.mountpoint);
            std::process::exit(1);
        }
    };

    let owner = nix::unistd::getuid().as_raw();
    let group = nix::unistd::getgid().as_raw();
    let fs = MemFs {
        inodes: Mutex::new(Inodes::new(owner, group)),
    };
    let session = Session::new(device.clone(), operations(), fs);
    let handle = session.shutdown_handle();
    let mut session = tokio::spawn(session.run());

    tokio::select! {
        res = &mut session => match res {
            Ok(Ok(())) => return,
            Ok(Err(err)) => error!("session failed: {err}"),
            Err(err) => error!("session task failed: {err}"),
        },
        _ = signal::ctrl_c() => {
            handle.shutdown();
            if let Err(err) = device.unmount().await {
                error!("unmount failed: {err}");
            }
            if let Ok(Err(err)) = session.await {
                error!("session failed: {err}");
            }
        }
    }
}
