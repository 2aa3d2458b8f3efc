//! Per-node cached state.

use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt as _;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::attr::AttributeReconciler;
use crate::cache::fcache::CachedFile;
use crate::cache::lazy::LazyValue;
use crate::cache::listing::{Listing, ListingSlot};
use crate::error::Error;
use crate::fs::NodeId;
use crate::remote::{ObjectKind, RemoteObject, RemoteStore};

/// Everything a regular file node keeps once its content has been asked for.
pub(crate) struct FileContent {
    pub(crate) file: Arc<CachedFile>,
    pub(crate) download: LazyValue<()>,
    pub(crate) attrs: Arc<AttributeReconciler>,
}

impl FileContent {
    pub(crate) fn new<S: RemoteStore>(
        store: S,
        file: Arc<CachedFile>,
        attrs: Arc<AttributeReconciler>,
    ) -> Self {
        let download = {
            let file = Arc::clone(&file);
            let attrs = Arc::clone(&attrs);
            LazyValue::new(move |cancel| {
                download_into(
                    store.clone(),
                    Arc::clone(&file),
                    Arc::clone(&attrs),
                    cancel,
                )
            })
        };
        Self {
            file,
            download,
            attrs,
        }
    }
}

/// Stream the remote content into the cached file, replacing what was there.
async fn download_into<S: RemoteStore>(
    store: S,
    file: Arc<CachedFile>,
    attrs: Arc<AttributeReconciler>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let mut stream = store.download_content(file.id(), cancel).await?;
    file.set_materialized(false);
    file.truncate(0)?;

    let mut offset = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all_at(&chunk, offset)?;
        offset += chunk.len() as u64;
    }

    file.set_materialized(true);
    // Writing bumped the local times.
    attrs.mark_dirty();
    debug!(id = file.id(), bytes = offset, "downloaded content");
    Ok(())
}

/// One node of the mounted tree.
pub(crate) struct Node {
    pub(crate) id: NodeId,
    pub(crate) remote_id: String,
    pub(crate) kind: ObjectKind,
    /// Seeded from the snapshot the node was created from. Listings of the parent are the only
    /// refresh path (see [`Node::observe`]); nothing invalidates it, so the `get_object` fetch
    /// behind it only serves as a fallback.
    pub(crate) metadata: Arc<LazyValue<RemoteObject>>,
    pub(crate) listing: Arc<ListingSlot>,
    /// The listing whose entries were last handed out for this directory.
    listed: Mutex<Option<Listing>>,
    pub(crate) content: OnceCell<Arc<FileContent>>,
}

impl Node {
    pub(crate) fn new<S: RemoteStore>(
        id: NodeId,
        snapshot: RemoteObject,
        kind: ObjectKind,
        store: S,
    ) -> Self {
        let remote_id = snapshot.id.clone();
        let metadata = {
            let remote_id = remote_id.clone();
            LazyValue::ready(snapshot, move |cancel| {
                let store = store.clone();
                let remote_id = remote_id.clone();
                async move { store.get_object(&remote_id, cancel).await }
            })
        };

        Self {
            id,
            remote_id,
            kind,
            metadata: Arc::new(metadata),
            listing: Arc::new(ListingSlot::empty()),
            listed: Mutex::new(None),
            content: OnceCell::new(),
        }
    }

    /// Record `listing` as the one whose entries were handed out last.
    ///
    /// Returns the listing it supersedes, or `None` if `listing` was already the current one.
    pub(crate) fn replace_listed(&self, listing: &Listing) -> Option<Listing> {
        let mut listed = self.listed.lock().unwrap_or_else(PoisonError::into_inner);
        if listed.as_ref().is_some_and(|prev| Arc::ptr_eq(prev, listing)) {
            return None;
        }
        listed.replace(Arc::clone(listing))
    }

    /// Forget the last handed-out listing, returning it.
    pub(crate) fn take_listed(&self) -> Option<Listing> {
        self.listed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Take in a newer snapshot of this node's remote object.
    ///
    /// If the remote content changed, cached bytes and attributes are marked stale.
    pub(crate) fn observe(&self, snapshot: &RemoteObject) {
        let current = self.metadata.peek();
        if current.as_ref() == Some(snapshot) {
            return;
        }

        let content_changed = current
            .is_none_or(|c| c.modified != snapshot.modified || c.size != snapshot.size);
        self.metadata.seed(snapshot.clone());

        if let Some(content) = self.content.get() {
            content.attrs.mark_dirty();
            if content_changed {
                debug!(node = self.id, "remote content changed, invalidating local copy");
                content.file.set_materialized(false);
                content.download.invalidate();
            }
        }
    }

    /// Tear down everything this node holds. The node is unusable afterwards.
    pub(crate) fn shutdown(&self) {
        self.metadata.shutdown();
        self.listing.store(None);
        if let Some(content) = self.content.get() {
            content.download.shutdown();
            content.file.forget();
        }
    }
}
