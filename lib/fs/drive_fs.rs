//! The node and handle table behind every filesystem operation.
//!
//! [`DriveFs`] routes kernel-facing operations to the caching layers: directory listings go
//! through each node's listing slot, file bytes through the local content cache, and file
//! attributes through the node's attribute reconciler. Nothing here holds a global lock; the
//! tables are [`scc::HashMap`]s with per-bucket locking.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::cache::attr::AttributeReconciler;
use crate::cache::fcache::{CacheHandle, CacheRoot};
use crate::cache::lazy::LazyValue;
use crate::cache::listing::{DirectoryListingCache, Listing, ListingLease};
use crate::error::Error;
use crate::fs::bridge::IdBridge;
use crate::fs::lookup_ward::LookupWard;
use crate::fs::node::{FileContent, Node};
use crate::fs::{AttributeRecord, DirEntry, FsStats, HandleId, NodeId, ROOT_NODE};
use crate::remote::{AccountInfo, ObjectKind, RemoteObject, RemoteStore};

/// An open session, as tracked by [`DriveFs`].
enum OpenHandle {
    File {
        node: Arc<Node>,
        handle: CacheHandle,
    },
    Directory {
        node: Arc<Node>,
        lease: ListingLease,
    },
}

impl OpenHandle {
    fn node(&self) -> &Arc<Node> {
        match self {
            Self::File { node, .. } | Self::Directory { node, .. } => node,
        }
    }
}

/// A remote object store mounted as a tree of nodes.
pub struct DriveFs<S: RemoteStore> {
    store: S,
    account: Arc<LazyValue<AccountInfo>>,
    cache: Arc<CacheRoot>,

    /// Live nodes. The root is never evicted.
    nodes: scc::HashMap<NodeId, Arc<Node>>,
    ids: IdBridge,
    ward: LookupWard,

    handles: scc::HashMap<HandleId, Arc<OpenHandle>>,

    /// Monotonically increasing node counter. Starts past the root.
    next_node: AtomicU64,
    /// Monotonically increasing handle counter. Starts at 1 (0 is reserved).
    next_handle: AtomicU64,

    owner: (u32, u32),
    shut_down: AtomicBool,
}

impl<S: RemoteStore> DriveFs<S> {
    /// Connect to `store` and seed the root node.
    ///
    /// Fetches the account information and the root folder up front, so a misconfigured store
    /// fails here rather than on the first kernel request.
    pub async fn new(
        store: S,
        cache: Arc<CacheRoot>,
        owner: (u32, u32),
        cancel: &CancellationToken,
    ) -> Result<Self, Error> {
        let account = {
            let store = store.clone();
            Arc::new(LazyValue::new(move |cancel| {
                let store = store.clone();
                async move { store.get_account_info(cancel).await }
            }))
        };
        let info = account.get(cancel).await?;
        let root = store.get_object(&info.root_id, cancel.clone()).await?;
        if root.kind()? != ObjectKind::Directory {
            return Err(Error::NotADirectory);
        }
        debug!(root = %root.id, "seeding root node");

        let fs = Self {
            store,
            account,
            cache,
            nodes: scc::HashMap::new(),
            ids: IdBridge::new(),
            ward: LookupWard::new(),
            handles: scc::HashMap::new(),
            next_node: AtomicU64::new(ROOT_NODE + 1),
            next_handle: AtomicU64::new(1),
            owner,
            shut_down: AtomicBool::new(false),
        };
        fs.ids.insert(ROOT_NODE, &root.id);
        let root_node = Node::new(ROOT_NODE, root, ObjectKind::Directory, fs.store.clone());
        let _ = fs.nodes.insert_sync(ROOT_NODE, Arc::new(root_node));
        Ok(fs)
    }

    /// Number of live nodes, the root included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of open handles.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Number of remote ids currently mapped to a node id.
    #[must_use]
    pub fn mapped_id_count(&self) -> usize {
        self.ids.len()
    }

    /// The kernel lookup count of `node`, if it is tracked.
    #[must_use]
    pub fn lookup_count(&self, node: NodeId) -> Option<u64> {
        self.ward.count(node)
    }

    /// The local content cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<CacheRoot> {
        &self.cache
    }

    fn node(&self, id: NodeId) -> Result<Arc<Node>, Error> {
        self.nodes.read_sync(&id, |_, n| Arc::clone(n)).ok_or_else(|| {
            debug!(node = id, "node not in table");
            Error::NotFound
        })
    }

    fn handle(&self, fh: HandleId) -> Result<Arc<OpenHandle>, Error> {
        self.handles
            .read_sync(&fh, |_, h| Arc::clone(h))
            .ok_or(Error::BadHandle)
    }

    fn alloc_node(&self) -> NodeId {
        self.next_node.fetch_add(1, Ordering::Relaxed)
    }

    fn alloc_handle(&self, handle: OpenHandle) -> HandleId {
        let fh = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let _ = self.handles.insert_sync(fh, Arc::new(handle));
        fh
    }

    fn lease(&self, dir: &Node) -> ListingLease {
        DirectoryListingCache::acquire_for(&dir.listing, || {
            let store = self.store.clone();
            let remote_id = dir.remote_id.clone();
            LazyValue::new(move |cancel| {
                let store = store.clone();
                let remote_id = remote_id.clone();
                async move {
                    let children = store.list_children(&remote_id, cancel).await?;
                    Ok(Listing::from(children))
                }
            })
        })
    }

    /// Build the entries of directory `dir` from a listing. Banned content kinds are skipped;
    /// every other entry is kept, the last one included.
    ///
    /// Entry node ids stay mapped until a newer listing of `dir` supersedes this one.
    fn entries(&self, dir: &Node, listing: &Listing) -> Vec<DirEntry> {
        let mut entries = Vec::with_capacity(listing.len());
        for obj in listing.iter() {
            let kind = match obj.kind() {
                Ok(kind) => kind,
                Err(e) => {
                    debug!(name = %obj.name, error = %e, "skipping entry");
                    continue;
                }
            };
            let node = self.ids.node_or_insert(&obj.id, || self.alloc_node());
            if let Some(existing) = self.nodes.read_sync(&node, |_, n| Arc::clone(n)) {
                existing.observe(obj);
            }
            entries.push(DirEntry {
                name: obj.name.clone(),
                kind,
                node,
            });
        }

        if let Some(prev) = dir.replace_listed(listing) {
            let current: HashSet<&str> = listing.iter().map(|obj| obj.id.as_str()).collect();
            self.release_listed(&prev, &current);
        }
        entries
    }

    /// Unmap the ids of `listed` that are not in `keep` and that the kernel never looked up.
    fn release_listed(&self, listed: &Listing, keep: &HashSet<&str>) {
        let mut released = 0usize;
        for obj in listed.iter().filter(|obj| !keep.contains(obj.id.as_str())) {
            let Some(node) = self.ids.node_id(&obj.id) else {
                continue;
            };
            if node != ROOT_NODE
                && self
                    .ward
                    .release_if_untracked(node, |node| self.ids.remove_node(node))
            {
                released += 1;
            }
        }
        if released > 0 {
            debug!(released, "unmapped ids of a superseded listing");
        }
    }

    /// Hand `obj` out to the kernel: count the lookup and make sure a node exists for it.
    fn track(&self, obj: &RemoteObject, kind: ObjectKind) -> NodeId {
        let node = loop {
            let node = self.ids.node_or_insert(&obj.id, || self.alloc_node());
            // A node evicted between the two calls is no longer mapped; start over.
            if self
                .ward
                .inc_if(node, || self.ids.node_id(&obj.id) == Some(node))
                .is_some()
            {
                break node;
            }
        };

        match self.nodes.entry_sync(node) {
            scc::hash_map::Entry::Occupied(occ) => occ.get().observe(obj),
            scc::hash_map::Entry::Vacant(vac) => {
                vac.insert_entry(Arc::new(Node::new(
                    node,
                    obj.clone(),
                    kind,
                    self.store.clone(),
                )));
            }
        }
        node
    }

    async fn content(&self, node: &Node) -> Result<Arc<FileContent>, Error> {
        if node.kind == ObjectKind::Directory {
            return Err(Error::IsADirectory);
        }

        node.content
            .get_or_try_init(|| async {
                let file = self.cache.file(&node.remote_id)?;
                let attrs = Arc::new(AttributeReconciler::new(
                    node.id,
                    Arc::clone(&node.metadata),
                    Arc::clone(&self.account),
                    Arc::clone(&file),
                    self.owner,
                ));
                Ok::<_, Error>(Arc::new(FileContent::new(
                    self.store.clone(),
                    file,
                    attrs,
                )))
            })
            .await
            .map(Arc::clone)
    }

    /// Resolve `name` inside directory `parent`.
    ///
    /// Counts one kernel lookup on the returned node. If several children share the name, the
    /// first one in listing order wins.
    pub async fn lookup_child(
        &self,
        parent: NodeId,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<NodeId, Error> {
        let parent = self.node(parent)?;
        if parent.kind != ObjectKind::Directory {
            return Err(Error::NotADirectory);
        }

        let listing = self.lease(&parent).list(cancel).await?;
        let (obj, kind) = listing
            .iter()
            .filter(|obj| obj.name == name)
            .find_map(|obj| obj.kind().ok().map(|kind| (obj, kind)))
            .ok_or(Error::NotFound)?;

        Ok(self.track(obj, kind))
    }

    /// The children of directory `node`, in remote order.
    pub async fn list_directory(
        &self,
        node: NodeId,
        cancel: &CancellationToken,
    ) -> Result<Vec<DirEntry>, Error> {
        let dir = self.node(node)?;
        if dir.kind != ObjectKind::Directory {
            return Err(Error::NotADirectory);
        }
        let listing = self.lease(&dir).list(cancel).await?;
        Ok(self.entries(&dir, &listing))
    }

    /// Open directory `node`. The listing is shared by every handle open on the directory.
    pub fn open_directory(&self, node: NodeId) -> Result<HandleId, Error> {
        let dir = self.node(node)?;
        if dir.kind != ObjectKind::Directory {
            return Err(Error::NotADirectory);
        }
        let lease = self.lease(&dir);
        Ok(self.alloc_handle(OpenHandle::Directory { node: dir, lease }))
    }

    /// The entries of an open directory handle.
    pub async fn read_directory(
        &self,
        fh: HandleId,
        cancel: &CancellationToken,
    ) -> Result<Vec<DirEntry>, Error> {
        let handle = self.handle(fh)?;
        let OpenHandle::Directory { node, lease } = &*handle else {
            return Err(Error::NotADirectory);
        };
        let listing = lease.list(cancel).await?;
        Ok(self.entries(node, &listing))
    }

    /// Attributes of `node`.
    pub async fn get_attributes(
        &self,
        node: NodeId,
        cancel: &CancellationToken,
    ) -> Result<AttributeRecord, Error> {
        let n = self.node(node)?;
        match n.kind {
            ObjectKind::File => self.content(&n).await?.attrs.get(cancel).await,
            ObjectKind::Directory => {
                let remote = n.metadata.get(cancel).await?;
                let account = self.account.get(cancel).await?;
                Ok(AttributeRecord {
                    node,
                    kind: ObjectKind::Directory,
                    size: remote.size,
                    blocks: remote.size.div_ceil(512),
                    atime: remote.atime(),
                    mtime: remote.mtime(),
                    ctime: remote.mtime(),
                    crtime: remote.crtime(),
                    perms: remote.perms(&account.permission_id),
                    nlink: 2,
                    uid: self.owner.0,
                    gid: self.owner.1,
                })
            }
        }
    }

    /// The content of file `node`, downloaded into the local cache if it is not there yet.
    async fn materialize(
        &self,
        node: &Node,
        cancel: &CancellationToken,
    ) -> Result<Arc<FileContent>, Error> {
        let content = self.content(node).await?;
        if let Err(e) = content.download.get(cancel).await {
            // Don't pin a failed download; the next attempt retries.
            if !matches!(e, Error::Cancelled | Error::Shutdown) {
                content.download.invalidate();
            }
            return Err(e);
        }
        Ok(content)
    }

    async fn open_file(
        &self,
        node: NodeId,
        writable: bool,
        cancel: &CancellationToken,
    ) -> Result<HandleId, Error> {
        let n = self.node(node)?;
        let content = self.materialize(&n, cancel).await?;
        let handle = content.file.open(writable)?;
        let fh = self.alloc_handle(OpenHandle::File { node: n, handle });
        debug!(node, handle = fh, writable, "opened file");
        Ok(fh)
    }

    /// Open file `node` for reading, downloading its content if it is not cached.
    pub async fn open_for_read(
        &self,
        node: NodeId,
        cancel: &CancellationToken,
    ) -> Result<HandleId, Error> {
        self.open_file(node, false, cancel).await
    }

    /// Open file `node` for writing. Writes land in the local cache only.
    pub async fn open_for_write(
        &self,
        node: NodeId,
        cancel: &CancellationToken,
    ) -> Result<HandleId, Error> {
        self.open_file(node, true, cancel).await
    }

    /// Resize file `node` to `size` bytes and return its new attributes.
    ///
    /// Like writes, the change stays in the local cache. The content is downloaded first, so a
    /// shrink keeps the leading bytes and a growth pads with zeros.
    pub async fn set_size(
        &self,
        node: NodeId,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<AttributeRecord, Error> {
        let n = self.node(node)?;
        let content = self.materialize(&n, cancel).await?;
        content.file.truncate(size)?;
        debug!(node, size, "resized cached file");
        content.attrs.get(cancel).await
    }

    /// Read up to `size` bytes at `offset` from an open file.
    pub fn read(&self, fh: HandleId, offset: u64, size: u32) -> Result<Bytes, Error> {
        match &*self.handle(fh)? {
            OpenHandle::File { handle, .. } => handle.read(offset, size),
            OpenHandle::Directory { .. } => Err(Error::IsADirectory),
        }
    }

    /// Write `data` at `offset` to a file opened for writing.
    pub fn write(&self, fh: HandleId, offset: u64, data: &[u8]) -> Result<usize, Error> {
        match &*self.handle(fh)? {
            OpenHandle::File { handle, .. } => handle.write(offset, data),
            OpenHandle::Directory { .. } => Err(Error::IsADirectory),
        }
    }

    /// Close an open file or directory handle.
    pub fn release(&self, fh: HandleId) -> Result<(), Error> {
        let (_, handle) = self.handles.remove_sync(&fh).ok_or(Error::BadHandle)?;
        debug!(handle = fh, node = handle.node().id, "releasing handle");
        // A concurrent read may still hold the handle; it is closed when that read finishes.
        match Arc::into_inner(handle) {
            Some(OpenHandle::File { handle, .. }) => handle.close(),
            Some(OpenHandle::Directory { lease, .. }) => lease.release(),
            None => {}
        }
        Ok(())
    }

    /// Drop `nlookup` kernel lookups of `node`, evicting it when none remain.
    ///
    /// Eviction shuts down the node's cached values and releases its cached file, which is
    /// unlinked once no open handle references it. The root is never evicted.
    pub fn forget(&self, node: NodeId, nlookup: u64) {
        if node == ROOT_NODE {
            return;
        }

        let mut evicted = None;
        let remaining = self.ward.dec_count(node, nlookup, |node| {
            self.ids.remove_node(node);
            match self.nodes.remove_sync(&node) {
                Some((_, n)) => {
                    n.shutdown();
                    evicted = Some(n);
                }
                None => error!(node, "tracked node missing from table"),
            }
        });
        if remaining.is_none() {
            warn!(node, nlookup, "forget for untracked node");
        }

        // Outside the ward entry lock: releasing takes other entries of the same map.
        if let Some(listed) = evicted.and_then(|n| n.take_listed()) {
            self.release_listed(&listed, &HashSet::new());
        }
    }

    /// Statistics of the filesystem holding the local cache.
    pub fn stat_filesystem(&self) -> Result<FsStats, Error> {
        self.cache.statfs()
    }

    /// Shut down every node and close the cache root. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(nodes = self.nodes.len(), handles = self.handles.len(), "shutting down");
        self.handles.clear_sync();
        let mut nodes = Vec::with_capacity(self.nodes.len());
        self.nodes.retain_sync(|_, n| {
            nodes.push(Arc::clone(n));
            false
        });
        for node in nodes {
            node.shutdown();
        }
        self.account.shutdown();
        self.cache.close();
    }
}
