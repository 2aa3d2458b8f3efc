//! Keeps a cached file's local stat in step with its remote metadata.

use std::os::unix::fs::{MetadataExt as _, PermissionsExt as _};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::fcache::CachedFile;
use crate::cache::lazy::LazyValue;
use crate::error::Error;
use crate::fs::{AttributeRecord, InodePerms, NodeId};
use crate::remote::{AccountInfo, ObjectKind, RemoteObject};

/// Merges remote metadata into the local stat of one cached file.
///
/// Starts dirty. While clean, [`get`](Self::get) serves attributes from the local stat under a
/// shared guard. When dirty, the first caller takes the exclusive guard and runs one
/// reconciliation pass: remote times and permission bits that differ from the local file are
/// pushed onto it. Callers queued behind that pass find the flag already cleared and do not run a
/// second one.
pub struct AttributeReconciler {
    node: NodeId,
    metadata: Arc<LazyValue<RemoteObject>>,
    account: Arc<LazyValue<AccountInfo>>,
    file: Arc<CachedFile>,
    owner: (u32, u32),
    dirty: AtomicBool,
    guard: RwLock<()>,
    passes: AtomicU64,
}

impl AttributeReconciler {
    /// A dirty reconciler for `file`, which caches the object described by `metadata`.
    #[must_use]
    pub fn new(
        node: NodeId,
        metadata: Arc<LazyValue<RemoteObject>>,
        account: Arc<LazyValue<AccountInfo>>,
        file: Arc<CachedFile>,
        owner: (u32, u32),
    ) -> Self {
        Self {
            node,
            metadata,
            account,
            file,
            owner,
            dirty: AtomicBool::new(true),
            guard: RwLock::new(()),
            passes: AtomicU64::new(0),
        }
    }

    /// Current attributes, reconciling first if the remote side may have changed.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<AttributeRecord, Error> {
        {
            let _shared = self.guard.read().await;
            if !self.dirty.load(Ordering::Acquire) {
                return self.record(cancel).await;
            }
        }

        let _exclusive = self.guard.write().await;
        if self.dirty.swap(false, Ordering::AcqRel)
            && let Err(e) = self.reconcile(cancel).await
        {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        self.record(cancel).await
    }

    /// Force the next [`get`](Self::get) to reconcile.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Whether a reconciliation pass is pending.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Number of reconciliation passes run so far.
    #[doc(hidden)]
    #[must_use]
    pub fn reconcile_passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    async fn reconcile(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let remote = self.metadata.get(cancel).await?;
        let account = self.account.get(cancel).await?;
        let local = self.file.stat()?;

        let atime = remote.atime();
        let mtime = remote.mtime();
        if local.accessed()? != atime || local.modified()? != mtime {
            debug!(node = self.node, "pushing remote times");
            self.file.set_times(atime, mtime)?;
        }

        let mode = u32::from(remote.perms(&account.permission_id).bits());
        if local.permissions().mode() & 0o7777 != mode {
            debug!(node = self.node, mode = format!("{mode:o}"), "pushing remote mode");
            self.file.set_mode(mode)?;
        }

        self.passes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn record(&self, cancel: &CancellationToken) -> Result<AttributeRecord, Error> {
        let remote = self.metadata.get(cancel).await?;
        let local = self.file.stat()?;

        let size = if self.file.is_materialized() {
            local.len()
        } else {
            remote.size
        };
        let ctime = SystemTime::UNIX_EPOCH
            + std::time::Duration::new(
                u64::try_from(local.ctime()).unwrap_or(0),
                u32::try_from(local.ctime_nsec()).unwrap_or(0),
            );

        #[expect(
            clippy::cast_possible_truncation,
            reason = "mode is masked to the 12 permission bits"
        )]
        let perms = InodePerms::from_bits_truncate((local.mode() & 0o7777) as u16);

        Ok(AttributeRecord {
            node: self.node,
            kind: ObjectKind::File,
            size,
            blocks: size.div_ceil(512),
            atime: local.accessed()?,
            mtime: local.modified()?,
            ctime,
            crtime: remote.crtime(),
            perms,
            nlink: 1,
            uid: self.owner.0,
            gid: self.owner.1,
        })
    }
}
