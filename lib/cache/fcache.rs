//! Local on-disk content cache.
//!
//! The cache lives in one directory, the [`CacheRoot`]. Every remote file whose bytes have been
//! requested gets one regular file in that directory, named by its remote id and owned by a
//! [`CachedFile`]. Each open session on that file is a [`CacheHandle`] with its own duplicated
//! descriptor.
//!
//! Lifetimes are reference counted rather than tied to Rust ownership, because the backing file
//! must be unlinked at a precise moment: when the node that owns it has been forgotten *and* the
//! last handle on it has been closed. The root directory descriptor is likewise closed only once
//! its creator and every cached file have let go of it.

use std::ffi::OsStr;
use std::fs::{File, FileTimes, OpenOptions, Permissions};
use std::os::unix::fs::{FileExt as _, OpenOptionsExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::error::Error;
use crate::fs::FsStats;
use crate::io;
use crate::sync::ReferenceCounter;

/// Reasons a directory cannot be used as a cache root.
#[derive(Debug, thiserror::Error)]
pub enum InvalidRootPathError {
    /// The path exists but is not a directory.
    #[error("Root path is not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The directory holds files this program did not put there.
    #[error("Root path appears to contain data stemming from sources different to this app: {0}")]
    RootPathUnsafeCache(PathBuf),

    /// The directory could not be inspected or prepared.
    #[error("IO error while accessing root path: {0}")]
    Io(#[from] std::io::Error),
}

/// The cache directory and its shared descriptor.
pub struct CacheRoot {
    path: PathBuf,
    dir: Mutex<Option<File>>,
    refs: ReferenceCounter,
    files: scc::HashMap<String, Arc<CachedFile>>,
}

impl CacheRoot {
    // Dangerous: Changing this constant may cause the program to treat existing cache directories
    // as invalid. Changing this will break backwards compatibility with existing cache
    // directories.
    const MARKER_FILE: &'static str = ".drive_fs_cache";

    /// Open (creating if needed) a cache root at `path`.
    ///
    /// If the path exists, it must either be an empty directory, or a directory which was
    /// previously used as a cache by this program. Stale content from a previous run is removed.
    pub async fn open(path: &Path) -> Result<Arc<Self>, InvalidRootPathError> {
        let mut pbuf = match tokio::fs::canonicalize(path).await {
            Ok(mut p) => {
                if !tokio::fs::metadata(&p).await?.is_dir() {
                    return Err(InvalidRootPathError::NotADirectory(p));
                }

                let mut entries = tokio::fs::read_dir(&p).await?;
                let is_empty = entries.next_entry().await?.is_none();

                p.push(Self::MARKER_FILE);
                let marker_exists = tokio::fs::try_exists(&p).await?;
                p.pop();

                if !(is_empty || marker_exists) {
                    return Err(InvalidRootPathError::RootPathUnsafeCache(p));
                }

                io::clear_dir(&p, &[OsStr::new(Self::MARKER_FILE)]).await?;
                p
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(path).await?;
                tokio::fs::canonicalize(path).await?
            }
            Err(e) => return Err(e.into()),
        };

        pbuf.push(Self::MARKER_FILE);
        tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&pbuf)
            .await?;
        pbuf.pop();

        let dir = File::open(&pbuf)?;
        debug!(path = %pbuf.display(), "opened cache root");

        Ok(Arc::new(Self {
            path: pbuf,
            dir: Mutex::new(Some(dir)),
            refs: ReferenceCounter::new(),
            files: scc::HashMap::new(),
        }))
    }

    /// Canonical path of the cache directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the directory descriptor is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Number of cached files currently registered.
    #[must_use]
    pub fn cached_file_count(&self) -> usize {
        self.files.len()
    }

    /// Statistics of the filesystem holding the cache directory.
    pub fn statfs(&self) -> Result<FsStats, Error> {
        let dir = self.dir.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = dir.as_ref().ok_or(Error::Shutdown)?;
        let st = nix::sys::statvfs::fstatvfs(dir)?;

        Ok(FsStats {
            block_size: u32::try_from(st.fragment_size()).unwrap_or(4096),
            total_blocks: u64::from(st.blocks()),
            free_blocks: u64::from(st.blocks_free()),
            available_blocks: u64::from(st.blocks_available()),
            total_inodes: u64::from(st.files()),
            free_inodes: u64::from(st.files_free()),
            max_filename_length: u32::try_from(st.name_max()).unwrap_or(255),
        })
    }

    /// Drop the creator's reference. The descriptor closes once every cached file is gone too.
    pub fn close(&self) {
        self.unref();
    }

    fn unref(&self) {
        if self.refs.dec() {
            let dir = self
                .dir
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            drop(dir);
            debug!(path = %self.path.display(), "closed cache root");
        }
    }

    /// The cached file for remote object `id`, created empty if there is no live one.
    ///
    /// Every call hands out one owner reference, released with [`CachedFile::forget`]. Owners
    /// of the same id share one file until all of them have forgotten it.
    pub fn file(self: &Arc<Self>, id: &str) -> Result<Arc<CachedFile>, Error> {
        match self.files.entry_sync(id.to_owned()) {
            scc::hash_map::Entry::Occupied(mut occ) => {
                if occ.get().refs.try_inc() {
                    occ.get().owners.fetch_add(1, Ordering::AcqRel);
                    return Ok(Arc::clone(occ.get()));
                }
                // The registered file is being torn down. Its teardown sees it was superseded
                // and leaves the path to us.
                let fresh = self.create(id)?;
                *occ.get_mut() = Arc::clone(&fresh);
                Ok(fresh)
            }
            scc::hash_map::Entry::Vacant(vac) => {
                let fresh = self.create(id)?;
                vac.insert_entry(Arc::clone(&fresh));
                Ok(fresh)
            }
        }
    }

    fn create(self: &Arc<Self>, id: &str) -> Result<Arc<CachedFile>, Error> {
        if id.is_empty() || id.contains('/') || id == "." || id == ".." || id == Self::MARKER_FILE {
            return Err(Error::InvalidId(id.to_owned()));
        }
        if !self.refs.try_inc() {
            return Err(Error::Shutdown);
        }

        let path = self.path.join(id);
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path);
        let fd = match fd {
            Ok(fd) => fd,
            Err(e) => {
                self.unref();
                return Err(e.into());
            }
        };

        debug!(id, "created cached file");
        Ok(Arc::new(CachedFile {
            id: id.to_owned(),
            path,
            fd: RwLock::new(Some(fd)),
            refs: ReferenceCounter::new(),
            root: Arc::clone(self),
            owners: AtomicUsize::new(1),
            materialized: AtomicBool::new(false),
        }))
    }
}

/// One remote file's bytes on local disk.
pub struct CachedFile {
    id: String,
    path: PathBuf,
    fd: RwLock<Option<File>>,
    refs: ReferenceCounter,
    root: Arc<CacheRoot>,
    owners: AtomicUsize,
    materialized: AtomicBool,
}

impl CachedFile {
    /// The remote id this file caches.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Live references: one per owner plus one per open handle.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.refs.count()
    }

    /// Open a new session on the file.
    ///
    /// The reference is taken before the descriptor is duplicated, and released again if
    /// duplication fails.
    pub fn open(self: &Arc<Self>, writable: bool) -> Result<CacheHandle, Error> {
        if !self.refs.try_inc() {
            return Err(Error::Shutdown);
        }
        let owner = FileRef(Arc::clone(self));
        let fd = self.with_fd(File::try_clone)?;

        Ok(CacheHandle {
            fd: Some(fd),
            writable,
            owner,
        })
    }

    /// Release one owner reference. Calls beyond the number of owners are ignored.
    pub fn forget(&self) {
        if self
            .owners
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            warn!(id = %self.id, "cached file forgotten more often than it was handed out");
            return;
        }
        self.unref();
    }

    /// Whether the remote content has been downloaded into this file.
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.materialized.load(Ordering::Acquire)
    }

    /// Record whether the file holds the current remote content.
    pub fn set_materialized(&self, materialized: bool) {
        self.materialized.store(materialized, Ordering::Release);
    }

    /// Local stat of the backing file.
    pub fn stat(&self) -> Result<std::fs::Metadata, Error> {
        self.with_fd(File::metadata)
    }

    /// Push access and modification times onto the backing file.
    pub fn set_times(&self, atime: SystemTime, mtime: SystemTime) -> Result<(), Error> {
        let times = FileTimes::new().set_accessed(atime).set_modified(mtime);
        self.with_fd(|f| f.set_times(times))
    }

    /// Push permission bits onto the backing file.
    pub fn set_mode(&self, mode: u32) -> Result<(), Error> {
        self.with_fd(|f| f.set_permissions(Permissions::from_mode(mode)))
    }

    /// Write all of `buf` at `offset`.
    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<(), Error> {
        self.with_fd(|f| f.write_all_at(buf, offset))
    }

    /// Resize the backing file.
    pub fn truncate(&self, len: u64) -> Result<(), Error> {
        self.with_fd(|f| f.set_len(len))
    }

    fn with_fd<R>(&self, op: impl FnOnce(&File) -> std::io::Result<R>) -> Result<R, Error> {
        let fd = self.fd.read().unwrap_or_else(PoisonError::into_inner);
        let fd = fd.as_ref().ok_or(Error::Shutdown)?;
        Ok(op(fd)?)
    }

    fn unref(&self) {
        if self.refs.dec() {
            self.teardown();
        }
    }

    /// Unlink, close, and let go of the root. Runs once, when the count reaches zero.
    fn teardown(&self) {
        match self.root.files.entry_sync(self.id.clone()) {
            scc::hash_map::Entry::Occupied(occ) if std::ptr::eq(Arc::as_ptr(occ.get()), self) => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(id = %self.id, error = %e, "failed to unlink cached file");
                }
                let _ = occ.remove();
                debug!(id = %self.id, "unlinked cached file");
            }
            scc::hash_map::Entry::Occupied(_) | scc::hash_map::Entry::Vacant(_) => {
                debug!(id = %self.id, "cached file superseded, leaving path alone");
            }
        }

        let fd = self
            .fd
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(fd);
        self.root.unref();
    }
}

/// Releases one [`CachedFile`] reference when dropped.
struct FileRef(Arc<CachedFile>);

impl Drop for FileRef {
    fn drop(&mut self) {
        self.0.unref();
    }
}

/// One open session on a [`CachedFile`].
///
/// Owns a duplicated descriptor and one file reference. Both are released by
/// [`close`](Self::close), or on drop if the handle is never closed explicitly.
pub struct CacheHandle {
    fd: Option<File>,
    writable: bool,
    owner: FileRef,
}

impl CacheHandle {
    /// The file this handle was opened on.
    #[must_use]
    pub fn file(&self) -> &Arc<CachedFile> {
        &self.owner.0
    }

    /// Whether the handle was opened for writing.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Read up to `size` bytes at `offset`. Short only at end of file.
    pub fn read(&self, offset: u64, size: u32) -> Result<Bytes, Error> {
        let fd = self.fd.as_ref().ok_or(Error::BadHandle)?;
        let mut buf = BytesMut::zeroed(size as usize);
        let mut filled = 0;
        while filled < buf.len() {
            match fd.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(buf.freeze())
    }

    /// Write `data` at `offset`. Fails with [`Error::BadHandle`] on a read-only handle.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize, Error> {
        if !self.writable {
            return Err(Error::BadHandle);
        }
        let fd = self.fd.as_ref().ok_or(Error::BadHandle)?;
        fd.write_all_at(data, offset)?;
        Ok(data.len())
    }

    /// Close the descriptor and release the file reference.
    pub fn close(mut self) {
        drop(self.fd.take());
    }
}
