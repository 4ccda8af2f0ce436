// A read-only filesystem with a single file, `hello`, in its root.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use clap::Parser;
use libfuse_ll::raw::{
    op, CapabilityFlags, DirBuf, Entry, FileAttr, FuseDevice, OperationTable, Opened, Session,
};
use libfuse_ll::{Errno, FileType, MountOptions, Timestamp, ROOT_INODE};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const HELLO_INODE: u64 = 2;
const HELLO_NAME: &str = "hello";
const TTL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about = "Mount a one-file hello filesystem")]
struct Args {
    /// Mount point path
    #[arg(long)]
    mountpoint: String,
    /// Mount with mount(2) instead of fusermount3
    #[arg(long, default_value_t = false)]
    privileged: bool,
    /// Content of the hello file
    #[arg(long, default_value = "Hello World!\n")]
    content: String,
    /// Log every dispatched request
    #[arg(long, default_value_t = false)]
    debug: bool,
}

struct Hello {
    content: Bytes,
    mounted_at: Timestamp,
}

impl Hello {
    fn attr(&self, ino: u64) -> Option<FileAttr> {
        let mut attr = match ino {
            ROOT_INODE => FileAttr::new(ROOT_INODE, FileType::Directory, 0o755),
            HELLO_INODE => {
                let mut attr = FileAttr::new(HELLO_INODE, FileType::RegularFile, 0o444);
                attr.size = self.content.len() as u64;
                attr.blocks = attr.size.div_ceil(512);
                attr
            }
            _ => return None,
        };
        attr.atime = self.mounted_at;
        attr.mtime = self.mounted_at;
        attr.ctime = self.mounted_at;
        Some(attr)
    }
}

fn operations() -> OperationTable<Hello> {
    let mut table = OperationTable::<Hello>::new();
    table
        .on_init(|_, config| {
            config.remove_want(CapabilityFlags::WRITEBACK_CACHE);
            Ok(())
        })
        .on::<op::Lookup, _>(|fs, req, args| {
            if args.parent != ROOT_INODE || args.name != HELLO_NAME {
                return req.reply_err(Errno::new_not_exist());
            }
            match fs.attr(HELLO_INODE) {
                Some(attr) => req.reply_entry(Entry::new(attr).attr_ttl(TTL).entry_ttl(TTL)),
                None => req.reply_err(Errno::new_not_exist()),
            }
        })
        .on::<op::Getattr, _>(|fs, req, args| match fs.attr(args.ino) {
            Some(attr) => req.reply_attr(attr, TTL),
            None => req.reply_err(Errno::new_not_exist()),
        })
        .on::<op::Open, _>(|_, req, args| {
            if args.ino != HELLO_INODE {
                return req.reply_err(libc::EISDIR);
            }
            if args.flags & libc::O_ACCMODE as u32 != libc::O_RDONLY as u32 {
                return req.reply_err(libc::EACCES);
            }
            req.reply_open(Opened::new(0).keep_cache());
        })
        .on::<op::Read, _>(|fs, req, args| {
            let start = (args.offset as usize).min(fs.content.len());
            let end = (start + args.size as usize).min(fs.content.len());
            req.reply_data(fs.content.slice(start..end));
        })
        .on::<op::Opendir, _>(|_, req, args| {
            if args.ino != ROOT_INODE {
                return req.reply_err(Errno::new_is_not_dir());
            }
            req.reply_open(Opened::new(0));
        })
        .on::<op::Readdir, _>(|_, req, args| {
            if args.ino != ROOT_INODE {
                return req.reply_err(Errno::new_is_not_dir());
            }
            let entries = [
                (ROOT_INODE, FileType::Directory, "."),
                (ROOT_INODE, FileType::Directory, ".."),
                (HELLO_INODE, FileType::RegularFile, HELLO_NAME),
            ];
            let mut dir = DirBuf::new(args.size);
            let skip = args.offset as usize;
            for (index, (ino, kind, name)) in entries.into_iter().enumerate().skip(skip) {
                if !dir.push(ino, index as u64 + 1, kind, name) {
                    break;
                }
            }
            req.reply_dir(dir);
        })
        .on_destroy(|_| info!("hello filesystem destroyed"));

    table
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut options = MountOptions::default();
    options.fs_name("hello").read_only(true).debug(args.debug);

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

    let fs = Hello {
        content: Bytes::from(args.content),
        mounted_at: SystemTime::now().into(),
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
