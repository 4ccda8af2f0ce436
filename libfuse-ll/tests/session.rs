use std::ffi::OsString;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bincode::Options;
use bytes::Bytes;
use libfuse_ll::raw::abi::*;
use libfuse_ll::raw::{
    channel, op, CapabilityFlags, ConnectionInfo, DirBuf, Entry, FileAttr, KernelEnd, OperationKind,
    OperationTable, Opened, Request, Session, SessionState, ShutdownHandle,
};
use libfuse_ll::{Errno, FileType, SessionError, Timestamp};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_native_endian()
        .allow_trailing_bytes()
}

fn message(opcode: u32, unique: u64, nodeid: u64, body: &[u8]) -> Vec<u8> {
    let header = fuse_in_header {
        len: (FUSE_IN_HEADER_SIZE + body.len()) as u32,
        opcode,
        unique,
        nodeid,
        uid: 1000,
        gid: 1000,
        pid: 4242,
        padding: 0,
    };
    let mut frame = config().serialize(&header).unwrap();
    frame.extend_from_slice(body);
    frame
}

fn args<T: Serialize>(value: &T, tail: &[u8]) -> Vec<u8> {
    let mut body = config().serialize(value).unwrap();
    body.extend_from_slice(tail);
    body
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> T {
    config().deserialize(payload).unwrap()
}

struct Reply {
    header: fuse_out_header,
    payload: Bytes,
}

async fn next_reply(kernel: &mut KernelEnd) -> Reply {
    let frame = timeout(WAIT, kernel.reply())
        .await
        .expect("timed out waiting for a reply")
        .expect("reply channel closed");
    let header: fuse_out_header = decode(&frame);
    assert_eq!(header.len as usize, frame.len());

    Reply {
        header,
        payload: frame.slice(FUSE_OUT_HEADER_SIZE..),
    }
}

fn start<U: Send + Sync + 'static>(
    table: OperationTable<U>,
    user_data: U,
) -> (JoinHandle<Result<(), SessionError>>, KernelEnd, ShutdownHandle) {
    let (transport, kernel) = channel();
    let session = Session::new(transport, table, user_data);
    assert_eq!(session.state(), SessionState::Created);
    let handle = session.shutdown_handle();

    (tokio::spawn(session.run()), kernel, handle)
}

async fn init(kernel: &mut KernelEnd, flags: u32) -> fuse_init_out {
    let init = fuse_init_in {
        major: 7,
        minor: 31,
        max_readahead: 128 * 1024,
        flags,
    };
    kernel.send_request(message(FUSE_INIT, 1, 0, &args(&init, &[]))).unwrap();

    let reply = next_reply(kernel).await;
    assert_eq!(reply.header.unique, 1);
    assert_eq!(reply.header.error, 0);
    assert_eq!(reply.payload.len(), FUSE_INIT_OUT_SIZE);
    decode(&reply.payload)
}

async fn finish(session: JoinHandle<Result<(), SessionError>>, kernel: &KernelEnd) {
    kernel.close();
    timeout(WAIT, session).await.unwrap().unwrap().unwrap();
}

fn file_attr(ino: u64, kind: FileType) -> FileAttr {
    FileAttr {
        ino,
        size: 13,
        blocks: 1,
        atime: Timestamp::new(1_600_000_000, 5),
        mtime: Timestamp::new(1_600_000_001, 6),
        ctime: Timestamp::new(1_600_000_002, 7),
        kind,
        perm: 0o644,
        nlink: 1,
        uid: 1000,
        gid: 1000,
        rdev: 0,
        blksize: 4096,
    }
}

/// One well-formed request of `kind` addressed to inode 1, or `None` for the
/// kinds that carry no request handle.
fn request_for(kind: OperationKind, unique: u64) -> Option<Vec<u8>> {
    use OperationKind as K;

    let read = fuse_read_in {
        size: 4096,
        ..Default::default()
    };
    let (opcode, body) = match kind {
        K::Init | K::Destroy | K::Forget => return None,
        K::Lookup => (FUSE_LOOKUP, b"name\0".to_vec()),
        K::Getattr => (FUSE_GETATTR, args(&fuse_getattr_in::default(), &[])),
        K::Setattr => (FUSE_SETATTR, args(&fuse_setattr_in::default(), &[])),
        K::Readlink => (FUSE_READLINK, Vec::new()),
        K::Mknod => {
            let mknod = fuse_mknod_in {
                mode: libc::S_IFIFO as u32 | 0o644,
                ..Default::default()
            };
            (FUSE_MKNOD, args(&mknod, b"fifo\0"))
        }
        K::Mkdir => {
            let mkdir = fuse_mkdir_in {
                mode: 0o755,
                umask: 0o022,
            };
            (FUSE_MKDIR, args(&mkdir, b"dir\0"))
        }
        K::Unlink => (FUSE_UNLINK, b"gone\0".to_vec()),
        K::Rmdir => (FUSE_RMDIR, b"dir\0".to_vec()),
        K::Symlink => (FUSE_SYMLINK, b"link\0target\0".to_vec()),
        K::Rename => (FUSE_RENAME, args(&fuse_rename_in { newdir: 1 }, b"a\0b\0")),
        K::Link => (FUSE_LINK, args(&fuse_link_in { oldnodeid: 5 }, b"hard\0")),
        K::Open => (FUSE_OPEN, args(&fuse_open_in::default(), &[])),
        K::Read => (FUSE_READ, args(&read, &[])),
        K::Write => {
            let write = fuse_write_in {
                size: 3,
                ..Default::default()
            };
            (FUSE_WRITE, args(&write, b"abc"))
        }
        K::Flush => (FUSE_FLUSH, args(&fuse_flush_in::default(), &[])),
        K::Release => (FUSE_RELEASE, args(&fuse_release_in::default(), &[])),
        K::Fsync => (FUSE_FSYNC, args(&fuse_fsync_in::default(), &[])),
        K::Opendir => (FUSE_OPENDIR, args(&fuse_open_in::default(), &[])),
        K::Readdir => (FUSE_READDIR, args(&read, &[])),
        K::Releasedir => (FUSE_RELEASEDIR, args(&fuse_release_in::default(), &[])),
        K::Fsyncdir => (FUSE_FSYNCDIR, args(&fuse_fsync_in::default(), &[])),
        K::Statfs => (FUSE_STATFS, Vec::new()),
        K::Setxattr => {
            let setxattr = fuse_setxattr_in { size: 3, flags: 0 };
            (FUSE_SETXATTR, args(&setxattr, b"user.a\0abc"))
        }
        K::Getxattr => {
            let getxattr = fuse_getxattr_in {
                size: 64,
                padding: 0,
            };
            (FUSE_GETXATTR, args(&getxattr, b"user.a\0"))
        }
        K::Listxattr => (FUSE_LISTXATTR, args(&fuse_getxattr_in::default(), &[])),
        K::Removexattr => (FUSE_REMOVEXATTR, b"user.a\0".to_vec()),
        K::Access => (FUSE_ACCESS, args(&fuse_access_in::default(), &[])),
        K::Create => {
            let create = fuse_create_in {
                flags: (libc::O_CREAT | libc::O_WRONLY) as u32,
                mode: libc::S_IFREG as u32 | 0o644,
                umask: 0o022,
                padding: 0,
            };
            (FUSE_CREATE, args(&create, b"new\0"))
        }
    };

    Some(message(opcode, unique, 1, &body))
}

#[tokio::test]
async fn unregistered_operations_answer_enosys() {
    let (session, mut kernel, _) = start(OperationTable::<()>::new(), ());
    init(&mut kernel, FUSE_ASYNC_READ).await;

    let mut expected = Vec::new();
    for (unique, kind) in (2..).zip(OperationKind::ALL) {
        if let Some(request) = request_for(kind, unique) {
            kernel.send_request(request).unwrap();
            expected.push(unique);
        }
    }
    assert_eq!(expected.len(), OperationKind::COUNT - 3);

    // forget is never answered, even without a handler
    let forget = args(&fuse_forget_in { nlookup: 1 }, &[]);
    kernel.send_request(message(FUSE_FORGET, 100, 5, &forget)).unwrap();
    // an opcode this crate does not know
    kernel.send_request(message(39, 101, 1, &[])).unwrap();
    expected.push(101);

    for unique in expected {
        let reply = next_reply(&mut kernel).await;
        assert_eq!(reply.header.unique, unique);
        assert_eq!(reply.header.error, -libc::ENOSYS);
        assert!(reply.payload.is_empty());
    }

    finish(session, &kernel).await;
    assert!(kernel.try_reply().is_none());
}

#[tokio::test]
async fn init_reports_only_wanted_capabilities() {
    let seen: Arc<Mutex<Option<ConnectionInfo>>> = Arc::new(Mutex::new(None));

    let mut table = OperationTable::new();
    table
        .on_init(|_: &Arc<Arc<Mutex<Option<ConnectionInfo>>>>, config| {
            assert_eq!(config.proto_major(), 7);
            assert_eq!(config.proto_minor(), 31);
            assert_eq!(
                config.capable(),
                CapabilityFlags::ASYNC_READ | CapabilityFlags::POSIX_LOCKS
            );
            config.set_want(CapabilityFlags::ASYNC_READ);
            Ok(())
        })
        .on::<op::Getattr, _>(|seen, req, _| {
            *seen.lock().unwrap() = req.connection();
            req.reply_err(Errno::new_not_exist());
        });

    let (session, mut kernel, handle) = start(table, seen.clone());
    let out = init(&mut kernel, FUSE_ASYNC_READ | FUSE_POSIX_LOCKS).await;
    assert_eq!(out.major, 7);
    assert_eq!(out.minor, 31);
    assert_eq!(out.flags, FUSE_ASYNC_READ);
    assert_eq!(handle.state(), SessionState::Running);

    kernel
        .send_request(message(FUSE_GETATTR, 2, 1, &args(&fuse_getattr_in::default(), &[])))
        .unwrap();
    assert_eq!(next_reply(&mut kernel).await.header.error, -libc::ENOENT);

    let conn = (*seen.lock().unwrap()).expect("connection info");
    assert!(conn.want().contains(CapabilityFlags::ASYNC_READ));
    assert!(!conn.want().contains(CapabilityFlags::POSIX_LOCKS));
    assert!(conn.capable().contains(CapabilityFlags::POSIX_LOCKS));

    finish(session, &kernel).await;
    assert_eq!(handle.state(), SessionState::Terminated);
}

#[tokio::test]
async fn unsupported_want_fails_initialization() {
    let destroyed = Arc::new(AtomicBool::new(false));

    let mut table = OperationTable::new();
    table
        .on_init(|_: &Arc<Arc<AtomicBool>>, config| {
            config.add_want(CapabilityFlags::WRITEBACK_CACHE);
            Ok(())
        })
        .on_destroy(|destroyed| destroyed.store(true, Ordering::SeqCst));

    let (session, mut kernel, handle) = start(table, destroyed.clone());
    let init = fuse_init_in {
        major: 7,
        minor: 31,
        max_readahead: 4096,
        flags: FUSE_ASYNC_READ,
    };
    kernel.send_request(message(FUSE_INIT, 1, 0, &args(&init, &[]))).unwrap();

    let reply = next_reply(&mut kernel).await;
    assert_eq!(reply.header.error, -libc::EPROTO);

    match timeout(WAIT, session).await.unwrap().unwrap() {
        Err(SessionError::Capability { unsupported }) => {
            assert_eq!(unsupported, CapabilityFlags::WRITEBACK_CACHE)
        }
        other => panic!("unexpected session result {other:?}"),
    }
    assert_eq!(handle.state(), SessionState::Terminated);
    assert!(!destroyed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn panicking_init_handler_refuses_the_connection() {
    let destroyed = Arc::new(AtomicBool::new(false));

    let mut table = OperationTable::new();
    table
        .on_init(|_: &Arc<Arc<AtomicBool>>, _| panic!("init handler failed"))
        .on_destroy(|destroyed| destroyed.store(true, Ordering::SeqCst));

    let (session, mut kernel, handle) = start(table, destroyed.clone());
    let init = fuse_init_in {
        major: 7,
        minor: 31,
        max_readahead: 4096,
        flags: FUSE_ASYNC_READ,
    };
    kernel.send_request(message(FUSE_INIT, 1, 0, &args(&init, &[]))).unwrap();

    let reply = next_reply(&mut kernel).await;
    assert_eq!(reply.header.unique, 1);
    assert_eq!(reply.header.error, -libc::EIO);

    match timeout(WAIT, session).await.unwrap().unwrap() {
        Err(SessionError::InitRejected(errno)) => assert_eq!(errno.raw(), libc::EIO),
        other => panic!("unexpected session result {other:?}"),
    }
    assert_eq!(handle.state(), SessionState::Terminated);
    assert!(!destroyed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn newer_major_version_waits_for_second_init() {
    let (session, mut kernel, handle) = start(OperationTable::<()>::new(), ());

    let init = fuse_init_in {
        major: 8,
        minor: 0,
        max_readahead: 4096,
        flags: 0,
    };
    kernel.send_request(message(FUSE_INIT, 1, 0, &args(&init, &[]))).unwrap();
    let reply = next_reply(&mut kernel).await;
    let out: fuse_init_out = decode(&reply.payload);
    assert_eq!((out.major, out.minor), (7, 31));
    assert_eq!(handle.state(), SessionState::Created);

    let out = self::init(&mut kernel, 0).await;
    assert_eq!(out.flags, 0);
    assert_eq!(handle.state(), SessionState::Running);

    finish(session, &kernel).await;
}

#[tokio::test]
async fn requests_before_init_are_refused() {
    let (session, mut kernel, _) = start(OperationTable::<()>::new(), ());

    kernel.send_request(message(FUSE_STATFS, 7, 1, &[])).unwrap();
    let reply = next_reply(&mut kernel).await;
    assert_eq!(reply.header.unique, 7);
    assert_eq!(reply.header.error, -libc::EIO);

    kernel.close();
    let result = timeout(WAIT, session).await.unwrap().unwrap();
    assert!(matches!(result, Err(SessionError::ClosedBeforeInit)));
}

#[tokio::test]
async fn lookup_of_missing_name_fails_once() {
    let calls = Arc::new(AtomicUsize::new(0));

    let mut table = OperationTable::new();
    table.on::<op::Lookup, _>(|calls: &Arc<Arc<AtomicUsize>>, req, args| {
        calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(args.parent, 1);
        if args.name == "missing" {
            req.reply_err(Errno::new_not_exist());
        } else {
            req.reply_entry(Entry::new(file_attr(2, FileType::RegularFile)));
        }
    });

    let (session, mut kernel, _) = start(table, calls.clone());
    init(&mut kernel, FUSE_ASYNC_READ).await;

    kernel.send_request(message(FUSE_LOOKUP, 2, 1, b"missing\0")).unwrap();
    let reply = next_reply(&mut kernel).await;
    assert_eq!(reply.header.unique, 2);
    assert_eq!(reply.header.error, -libc::ENOENT);
    assert!(reply.payload.is_empty());

    finish(session, &kernel).await;
    assert!(kernel.try_reply().is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn entry_reply_round_trips() {
    let attr = file_attr(77, FileType::Directory);
    let entry = Entry::new(attr)
        .generation(0x1234_5678_9abc_def0)
        .attr_ttl(Duration::new(3, 250_000_000))
        .entry_ttl(Duration::new(9, 1));

    let mut table = OperationTable::new();
    table.on::<op::Lookup, _>(|entry: &Arc<Entry>, req, _| req.reply_entry(**entry));

    let (session, mut kernel, _) = start(table, entry);
    init(&mut kernel, 0).await;

    kernel.send_request(message(FUSE_LOOKUP, 2, 1, b"dir\0")).unwrap();
    let reply = next_reply(&mut kernel).await;
    assert_eq!(reply.header.error, 0);
    assert_eq!(reply.payload.len(), FUSE_ENTRY_OUT_SIZE);

    let out: fuse_entry_out = decode(&reply.payload);
    assert_eq!(out.nodeid, 77);
    assert_eq!(out.generation, 0x1234_5678_9abc_def0);
    assert_eq!((out.attr_valid, out.attr_valid_nsec), (3, 250_000_000));
    assert_eq!((out.entry_valid, out.entry_valid_nsec), (9, 1));
    assert_eq!(
        out.attr,
        fuse_attr {
            ino: 77,
            size: 13,
            blocks: 1,
            atime: 1_600_000_000,
            mtime: 1_600_000_001,
            ctime: 1_600_000_002,
            atimensec: 5,
            mtimensec: 6,
            ctimensec: 7,
            mode: libc::S_IFDIR as u32 | 0o644,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            blksize: 4096,
            padding: 0,
        }
    );

    finish(session, &kernel).await;
}

#[derive(Default)]
struct Handles {
    seen: Mutex<Vec<(OperationKind, u64)>>,
}

#[tokio::test]
async fn file_handle_is_echoed_unchanged() {
    const FH: u64 = 0xdead_beef_cafe_f00d;

    let mut table = OperationTable::new();
    table
        .on::<op::Open, _>(|_: &Arc<Arc<Handles>>, req, _| req.reply_open(Opened::new(FH).keep_cache()))
        .on::<op::Write, _>(|handles, req, args| {
            handles.seen.lock().unwrap().push((req.kind(), args.file.fh()));
            assert_eq!(args.offset, 4096);
            assert_eq!(&args.data[..], b"hello world");
            // a short write is fine
            req.reply_write(args.data.len() as u32 - 6);
        })
        .on::<op::Flush, _>(|handles, req, args| {
            handles.seen.lock().unwrap().push((req.kind(), args.file.fh()));
            req.reply_empty();
        })
        .on::<op::Release, _>(|handles, req, args| {
            handles.seen.lock().unwrap().push((req.kind(), args.file.fh()));
            assert!(args.file.flush());
            req.reply_empty();
        });

    let handles = Arc::new(Handles::default());
    let (session, mut kernel, _) = start(table, handles);
    init(&mut kernel, FUSE_ASYNC_READ).await;

    let open = fuse_open_in {
        flags: libc::O_RDWR as u32,
        unused: 0,
    };
    kernel.send_request(message(FUSE_OPEN, 2, 5, &args(&open, &[]))).unwrap();
    let reply = next_reply(&mut kernel).await;
    let opened: fuse_open_out = decode(&reply.payload);
    assert_eq!(opened.fh, FH);
    assert_eq!(opened.open_flags, FOPEN_KEEP_CACHE);

    let data = b"hello world";
    let write = fuse_write_in {
        fh: opened.fh,
        offset: 4096,
        size: data.len() as u32,
        ..Default::default()
    };
    kernel.send_request(message(FUSE_WRITE, 3, 5, &args(&write, data))).unwrap();
    let reply = next_reply(&mut kernel).await;
    assert_eq!(reply.header.error, 0);
    let written: fuse_write_out = decode(&reply.payload);
    assert!(written.size as usize <= data.len());
    assert_eq!(written.size, 5);

    let flush = fuse_flush_in {
        fh: opened.fh,
        lock_owner: 1,
        ..Default::default()
    };
    kernel.send_request(message(FUSE_FLUSH, 4, 5, &args(&flush, &[]))).unwrap();
    assert_eq!(next_reply(&mut kernel).await.header.error, 0);

    let release = fuse_release_in {
        fh: opened.fh,
        flags: libc::O_RDWR as u32,
        release_flags: FUSE_RELEASE_FLUSH,
        lock_owner: 1,
    };
    kernel.send_request(message(FUSE_RELEASE, 5, 5, &args(&release, &[]))).unwrap();
    assert_eq!(next_reply(&mut kernel).await.header.error, 0);

    finish(session, &kernel).await;
}

#[tokio::test]
async fn handle_echo_reaches_handlers() {
    const FH: u64 = 7;

    let mut table = OperationTable::new();
    table.on::<op::Read, _>(|handles: &Arc<Arc<Handles>>, req, args| {
        handles.seen.lock().unwrap().push((req.kind(), args.file.fh()));
        req.reply_data(Bytes::from_static(b"abc"));
    });

    let handles = Arc::new(Handles::default());
    let (session, mut kernel, _) = start(table, handles.clone());
    init(&mut kernel, FUSE_ASYNC_READ).await;

    for unique in 2..5 {
        let read = fuse_read_in {
            fh: FH,
            offset: 0,
            size: 3,
            ..Default::default()
        };
        kernel.send_request(message(FUSE_READ, unique, 5, &args(&read, &[]))).unwrap();
        let reply = next_reply(&mut kernel).await;
        assert_eq!(&reply.payload[..], b"abc");
    }
    finish(session, &kernel).await;

    let seen = handles.seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|(kind, fh)| *kind == OperationKind::Read && *fh == FH));
}

#[derive(Default)]
struct Parked {
    requests: Mutex<Vec<Request>>,
    destroyed: AtomicBool,
}

fn park(parked: &Arc<Arc<Parked>>, req: Request, _: op::Getattr) {
    parked.requests.lock().unwrap().push(req);
}

#[tokio::test]
async fn unmount_fails_suspended_requests() {
    let mut table = OperationTable::new();
    table
        .on::<op::Getattr, _>(park)
        .on_destroy(|parked| parked.destroyed.store(true, Ordering::SeqCst));

    let parked = Arc::new(Parked::default());
    let (session, mut kernel, handle) = start(table, parked.clone());
    init(&mut kernel, FUSE_ASYNC_READ).await;

    let getattr = fuse_getattr_in::default();
    kernel.send_request(message(FUSE_GETATTR, 10, 1, &args(&getattr, &[]))).unwrap();
    kernel.send_request(message(FUSE_GETATTR, 11, 2, &args(&getattr, &[]))).unwrap();
    kernel.close();

    let mut uniques = Vec::new();
    for _ in 0..2 {
        let reply = next_reply(&mut kernel).await;
        assert_eq!(reply.header.error, -libc::ENOTCONN);
        uniques.push(reply.header.unique);
    }
    uniques.sort();
    assert_eq!(uniques, vec![10, 11]);

    timeout(WAIT, session).await.unwrap().unwrap().unwrap();
    assert_eq!(handle.state(), SessionState::Terminated);
    assert!(parked.destroyed.load(Ordering::SeqCst));
    drop(handle);

    // late replies from the suspended handlers go nowhere
    let requests: Vec<_> = parked.requests.lock().unwrap().drain(..).collect();
    for req in requests {
        assert!(req.is_interrupted());
        assert!(req.connection().is_none());
        req.reply_attr(file_attr(1, FileType::Directory), Duration::from_secs(1));
    }
    assert!(timeout(WAIT, kernel.reply()).await.unwrap().is_none());
}

#[tokio::test]
async fn panicking_handler_does_not_stop_the_session() {
    let mut table = OperationTable::new();
    table
        .on::<op::Getattr, _>(park)
        .on::<op::Statfs, _>(|_, _req, _| panic!("statfs handler failed"))
        // a directory listing is not a valid answer to read
        .on::<op::Read, _>(|_, req, _| req.reply_dir(DirBuf::new(64)))
        .on_destroy(|parked| parked.destroyed.store(true, Ordering::SeqCst));

    let parked = Arc::new(Parked::default());
    let (session, mut kernel, handle) = start(table, parked.clone());
    init(&mut kernel, FUSE_ASYNC_READ).await;

    let getattr = fuse_getattr_in::default();
    let read = fuse_read_in {
        size: 64,
        ..Default::default()
    };
    kernel.send_request(message(FUSE_GETATTR, 2, 1, &args(&getattr, &[]))).unwrap();
    kernel.send_request(message(FUSE_STATFS, 3, 1, &[])).unwrap();
    kernel.send_request(message(FUSE_STATFS, 4, 1, &[])).unwrap();
    kernel.send_request(message(FUSE_READ, 5, 1, &args(&read, &[]))).unwrap();

    for unique in [3, 4, 5] {
        let reply = next_reply(&mut kernel).await;
        assert_eq!(reply.header.unique, unique);
        assert_eq!(reply.header.error, -libc::EIO);
    }
    assert_eq!(handle.state(), SessionState::Running);

    kernel.close();
    let reply = next_reply(&mut kernel).await;
    assert_eq!(reply.header.unique, 2);
    assert_eq!(reply.header.error, -libc::ENOTCONN);

    timeout(WAIT, session).await.unwrap().unwrap().unwrap();
    assert_eq!(handle.state(), SessionState::Terminated);
    assert!(parked.destroyed.load(Ordering::SeqCst));
    assert!(timeout(WAIT, kernel.reply()).await.unwrap().is_none());
}

#[tokio::test]
async fn shutdown_handle_stops_the_session() {
    let mut table = OperationTable::new();
    table.on_destroy(|parked: &Arc<Arc<Parked>>| parked.destroyed.store(true, Ordering::SeqCst));

    let parked = Arc::new(Parked::default());
    let (session, mut kernel, handle) = start(table, parked.clone());
    init(&mut kernel, 0).await;

    handle.shutdown();
    timeout(WAIT, session).await.unwrap().unwrap().unwrap();
    assert!(parked.destroyed.load(Ordering::SeqCst));
    assert_eq!(handle.state(), SessionState::Terminated);
}

#[tokio::test]
async fn destroy_request_is_acknowledged() {
    let mut table = OperationTable::new();
    table.on_destroy(|parked: &Arc<Arc<Parked>>| parked.destroyed.store(true, Ordering::SeqCst));

    let parked = Arc::new(Parked::default());
    let (session, mut kernel, _) = start(table, parked.clone());
    init(&mut kernel, 0).await;

    kernel.send_request(message(FUSE_DESTROY, 9, 0, &[])).unwrap();
    let reply = next_reply(&mut kernel).await;
    assert_eq!(reply.header.unique, 9);
    assert_eq!(reply.header.error, 0);

    timeout(WAIT, session).await.unwrap().unwrap().unwrap();
    assert!(parked.destroyed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn interrupt_reaches_suspended_handler() {
    let mut table = OperationTable::new();
    table.on::<op::Read, _>(|_: &Arc<()>, req, _| {
        tokio::spawn(async move {
            req.interrupted().await;
            req.reply_err(libc::EINTR);
        });
    });

    let (session, mut kernel, _) = start(table, ());
    init(&mut kernel, FUSE_ASYNC_READ).await;

    let read = fuse_read_in {
        size: 4096,
        ..Default::default()
    };
    kernel.send_request(message(FUSE_READ, 20, 5, &args(&read, &[]))).unwrap();
    kernel
        .send_request(message(FUSE_INTERRUPT, 21, 0, &args(&fuse_interrupt_in { unique: 20 }, &[])))
        .unwrap();

    let reply = next_reply(&mut kernel).await;
    assert_eq!(reply.header.unique, 20);
    assert_eq!(reply.header.error, -libc::EINTR);

    // the request is gone now, so the kernel is asked to retry
    kernel
        .send_request(message(FUSE_INTERRUPT, 22, 0, &args(&fuse_interrupt_in { unique: 20 }, &[])))
        .unwrap();
    let reply = next_reply(&mut kernel).await;
    assert_eq!(reply.header.unique, 22);
    assert_eq!(reply.header.error, -libc::EAGAIN);

    finish(session, &kernel).await;
}

#[tokio::test]
async fn malformed_requests_do_not_stop_the_session() {
    let mut table = OperationTable::new();
    table.on::<op::Statfs, _>(|_: &Arc<()>, req, _| req.reply_statfs(Default::default()));

    let (session, mut kernel, _) = start(table, ());
    init(&mut kernel, 0).await;

    // too short for a header: dropped without reply
    kernel.send_request(vec![1u8, 2, 3]).unwrap();
    // lookup name without terminator: answered with EIO
    kernel.send_request(message(FUSE_LOOKUP, 30, 1, b"unterminated")).unwrap();
    kernel.send_request(message(FUSE_STATFS, 31, 1, &[])).unwrap();

    let reply = next_reply(&mut kernel).await;
    assert_eq!(reply.header.unique, 30);
    assert_eq!(reply.header.error, -libc::EIO);

    let reply = next_reply(&mut kernel).await;
    assert_eq!(reply.header.unique, 31);
    assert_eq!(reply.header.error, 0);
    assert_eq!(reply.payload.len(), FUSE_STATFS_OUT_SIZE);

    finish(session, &kernel).await;
}

#[tokio::test]
async fn readdir_and_rename2_arguments() {
    let renamed = Arc::new(Mutex::new(None));

    let mut table = OperationTable::new();
    table
        .on::<op::Readdir, _>(|_: &Arc<Arc<Mutex<Option<(OsString, OsString, u32)>>>>, req, args| {
            let mut dir = DirBuf::new(args.size);
            let entries = [(1, FileType::Directory, "."), (2, FileType::RegularFile, "file")];
            let skip = args.offset as usize;
            for (index, (ino, kind, name)) in entries.into_iter().enumerate().skip(skip) {
                if !dir.push(ino, index as u64 + 1, kind, name) {
                    break;
                }
            }
            req.reply_dir(dir);
        })
        .on::<op::Rename, _>(|renamed, req, args| {
            *renamed.lock().unwrap() = Some((args.name, args.new_name, args.flags));
            req.reply_empty();
        });

    let (session, mut kernel, _) = start(table, renamed.clone());
    init(&mut kernel, 0).await;

    let read = fuse_read_in {
        size: 4096,
        offset: 1,
        ..Default::default()
    };
    kernel.send_request(message(FUSE_READDIR, 2, 1, &args(&read, &[]))).unwrap();
    let reply = next_reply(&mut kernel).await;
    let dirent: fuse_dirent = decode(&reply.payload);
    assert_eq!(dirent.ino, 2);
    assert_eq!(dirent.off, 2);
    assert_eq!(dirent.r#type, libc::DT_REG as u32);
    assert_eq!(&reply.payload[FUSE_DIRENT_SIZE..FUSE_DIRENT_SIZE + 4], b"file");
    assert_eq!(reply.payload.len(), 32);

    let rename = fuse_rename2_in {
        newdir: 1,
        flags: libc::RENAME_EXCHANGE,
        padding: 0,
    };
    kernel
        .send_request(message(FUSE_RENAME2, 3, 1, &args(&rename, b"a\0b\0")))
        .unwrap();
    assert_eq!(next_reply(&mut kernel).await.header.error, 0);
    assert_eq!(
        renamed.lock().unwrap().clone(),
        Some((OsString::from("a"), OsString::from("b"), libc::RENAME_EXCHANGE))
    );

    finish(session, &kernel).await;
}
