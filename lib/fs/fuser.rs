//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`DriveFs`].

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, instrument};

use super::{AttributeRecord, DriveFs};
use crate::error::Error;
use crate::remote::{ObjectKind, RemoteStore};

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyDirectory,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyWrite,
    fuser::ReplyEmpty,
    fuser::ReplyStatfs,
);

/// Extension trait on `Result<T, Error>` for FUSE reply handling.
///
/// Centralizes the error-logging + errno-reply path so each FUSE callback
/// only has to express its success path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, Error> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.errno());
            }
        }
    }
}

fn kind_to_fuser(kind: ObjectKind) -> fuser::FileType {
    match kind {
        ObjectKind::Directory => fuser::FileType::Directory,
        ObjectKind::File => fuser::FileType::RegularFile,
    }
}

/// Convert an [`AttributeRecord`] to the fuser-specific `FileAttr`.
fn record_to_fuser_attr(attr: &AttributeRecord, block_size: u32) -> fuser::FileAttr {
    fuser::FileAttr {
        ino: attr.node,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.crtime,
        kind: kind_to_fuser(attr.kind),
        perm: attr.perms.bits(),
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: block_size,
        flags: 0,
    }
}

const BLOCK_SIZE: u32 = 4096;

/// Bridges a [`DriveFs`] to the [`fuser::Filesystem`] trait.
///
/// Every request runs on the tokio runtime behind `runtime`, under a cancellation token that
/// fires when the request's deadline passes.
pub struct FuserAdapter<S: RemoteStore> {
    fs: Arc<DriveFs<S>>,
    runtime: tokio::runtime::Handle,
    request_timeout: Duration,
}

impl<S: RemoteStore> FuserAdapter<S> {
    // TODO: Raise this once changes on the remote are pushed to the kernel with
    // notify_inval_inode / notify_inval_entry instead of waiting for the TTL to lapse.
    const SHAMEFUL_TTL: Duration = Duration::from_secs(1);

    /// Create a new adapter over `fs`.
    pub fn new(
        fs: Arc<DriveFs<S>>,
        runtime: tokio::runtime::Handle,
        request_timeout: Duration,
    ) -> Self {
        Self {
            fs,
            runtime,
            request_timeout,
        }
    }

    /// A token that fires once the request deadline passes. The timer stops when the guard drops.
    fn deadline(&self) -> (CancellationToken, DropGuard) {
        let token = CancellationToken::new();
        let timer = token.clone();
        let timeout = self.request_timeout;
        self.runtime.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => {
                    debug!(?timeout, "request deadline passed");
                    timer.cancel();
                }
                () = timer.cancelled() => {}
            }
        });
        let guard = token.clone().drop_guard();
        (token, guard)
    }
}

impl<S: RemoteStore> fuser::Filesystem for FuserAdapter<S> {
    fn destroy(&mut self) {
        debug!("filesystem unmounted, shutting down");
        self.fs.shutdown();
    }

    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            debug!("name is not valid UTF-8, replying ENOENT");
            reply.error(libc::ENOENT);
            return;
        };

        let (cancel, _deadline) = self.deadline();
        self.runtime
            .block_on(async {
                let node = self.fs.lookup_child(parent, name, &cancel).await?;
                match self.fs.get_attributes(node, &cancel).await {
                    Ok(attr) => Ok(attr),
                    Err(e) => {
                        // The kernel never learns about this lookup, so it will never forget it.
                        self.fs.forget(node, 1);
                        Err(e)
                    }
                }
            })
            .fuse_reply(reply, |attr, reply| {
                let f_attr = record_to_fuser_attr(&attr, BLOCK_SIZE);
                debug!(?f_attr, "replying...");
                reply.entry(&Self::SHAMEFUL_TTL, &f_attr, 0);
            });
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.fs.forget(ino, nlookup);
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let (cancel, _deadline) = self.deadline();
        self.runtime
            .block_on(self.fs.get_attributes(ino, &cancel))
            .fuse_reply(reply, |attr, reply| {
                let attr = record_to_fuser_attr(&attr, BLOCK_SIZE);
                debug!(?attr, "replying...");
                reply.attr(&Self::SHAMEFUL_TTL, &attr);
            });
    }

    /// Only size changes are applied; every other attribute follows the remote object.
    #[instrument(
        name = "FuserAdapter::setattr",
        skip(
            self, _req, _mode, _uid, _gid, _atime, _mtime, _ctime, _fh, _crtime, _chgtime,
            _bkuptime, _flags, reply
        )
    )]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        let (cancel, _deadline) = self.deadline();
        let result = match size {
            Some(size) => self.runtime.block_on(self.fs.set_size(ino, size, &cancel)),
            None => self.runtime.block_on(self.fs.get_attributes(ino, &cancel)),
        };
        result.fuse_reply(reply, |attr, reply| {
            let attr = record_to_fuser_attr(&attr, BLOCK_SIZE);
            debug!(?attr, "replying...");
            reply.attr(&Self::SHAMEFUL_TTL, &attr);
        });
    }

    #[instrument(name = "FuserAdapter::opendir", skip(self, _req, _flags, reply))]
    fn opendir(&mut self, _req: &fuser::Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        self.fs.open_directory(ino).fuse_reply(reply, |fh, reply| {
            debug!(handle = fh, "replying...");
            reply.opened(fh, 0);
        });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, fh, offset, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let (cancel, _deadline) = self.deadline();
        let entries = match self.runtime.block_on(self.fs.read_directory(fh, &cancel)) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.errno());
                return;
            }
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, entry) in entries.iter().enumerate().skip(skip) {
            let Ok(next): Result<i64, _> = (i + 1).try_into() else {
                error!("Directory entry index {} too large for fuser", i + 1);
                reply.error(libc::EIO);
                return;
            };

            debug!(name = %entry.name, ino = entry.node, "adding entry to reply...");
            if reply.add(entry.node, next, kind_to_fuser(entry.kind), &entry.name) {
                debug!("buffer full for now, stopping readdir");
                break;
            }
        }

        debug!("finalizing reply...");
        reply.ok();
    }

    #[instrument(
        name = "FuserAdapter::releasedir",
        skip(self, _req, _ino, _flags, reply)
    )]
    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs.release(fh).fuse_reply(reply, |(), reply| {
            debug!("replying ok");
            reply.ok();
        });
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let (cancel, _deadline) = self.deadline();
        let writable = flags & libc::O_ACCMODE != libc::O_RDONLY;
        let result = if writable {
            self.runtime.block_on(async {
                let fh = self.fs.open_for_write(ino, &cancel).await?;
                if flags & libc::O_TRUNC != 0
                    && let Err(e) = self.fs.set_size(ino, 0, &cancel).await
                {
                    let _ = self.fs.release(fh);
                    return Err(e);
                }
                Ok::<_, Error>(fh)
            })
        } else {
            self.runtime.block_on(self.fs.open_for_read(ino, &cancel))
        };
        result.fuse_reply(reply, |fh, reply| {
            debug!(handle = fh, "replying...");
            reply.opened(fh, 0);
        });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _ino, fh, offset, size, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        self.fs
            .read(fh, offset.cast_unsigned(), size)
            .fuse_reply(reply, |data, reply| {
                debug!(read_bytes = data.len(), "replying...");
                reply.data(&data);
            });
    }

    #[instrument(
        name = "FuserAdapter::write",
        skip(self, _req, _ino, fh, offset, data, _write_flags, _flags, _lock_owner, reply)
    )]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        self.fs
            .write(fh, offset.cast_unsigned(), data)
            .fuse_reply(reply, |written, reply| {
                debug!(written, "replying...");
                reply.written(u32::try_from(written).unwrap_or(u32::MAX));
            });
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, fh, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.fs.release(fh).fuse_reply(reply, |(), reply| {
            debug!("replying ok");
            reply.ok();
        });
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        self.fs.stat_filesystem().fuse_reply(reply, |stats, reply| {
            debug!(?stats, "replying...");
            reply.statfs(
                stats.total_blocks,
                stats.free_blocks,
                stats.available_blocks,
                stats.total_inodes,
                stats.free_inodes,
                stats.block_size,
                stats.max_filename_length,
                stats.block_size,
            );
        });
    }
}
