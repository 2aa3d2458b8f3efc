#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures::StreamExt as _;
use tokio_util::sync::CancellationToken;

use drive_fs::Error;
use drive_fs::cache::fcache::CacheRoot;
use drive_fs::fs::DriveFs;
use drive_fs::remote::{
    AccountInfo, ContentStream, FOLDER_MIME, Grantee, Permission, RemoteObject, RemoteStore, Role,
};

pub const ROOT_ID: &str = "root";
pub const ME: &str = "me";

pub fn at(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

fn owned_by_me() -> Vec<Permission> {
    vec![Permission {
        id: ME.to_owned(),
        role: Role::Owner,
        grantee: Grantee::User,
    }]
}

pub fn folder(id: &str, name: &str) -> RemoteObject {
    RemoteObject {
        id: id.to_owned(),
        name: name.to_owned(),
        mime_type: FOLDER_MIME.to_owned(),
        size: 0,
        modified: Some(at(1_600_000_000)),
        viewed: None,
        created: Some(at(1_500_000_000)),
        permissions: owned_by_me(),
    }
}

pub fn file(id: &str, name: &str, size: u64) -> RemoteObject {
    RemoteObject {
        id: id.to_owned(),
        name: name.to_owned(),
        mime_type: "text/plain".to_owned(),
        size,
        modified: Some(at(1_600_000_000)),
        viewed: Some(at(1_650_000_000)),
        created: Some(at(1_500_000_000)),
        permissions: owned_by_me(),
    }
}

pub fn native_doc(id: &str, name: &str) -> RemoteObject {
    RemoteObject {
        mime_type: "application/vnd.google-apps.document".to_owned(),
        ..file(id, name, 0)
    }
}

pub fn account() -> AccountInfo {
    AccountInfo {
        root_id: ROOT_ID.to_owned(),
        permission_id: ME.to_owned(),
        quota_total: 1 << 30,
        quota_used: 1 << 20,
    }
}

#[derive(Default)]
struct MockInner {
    objects: Mutex<HashMap<String, RemoteObject>>,
    children: Mutex<HashMap<String, Vec<String>>>,
    contents: Mutex<HashMap<String, Bytes>>,
    delay: Mutex<Duration>,
    fail_downloads: AtomicBool,

    object_calls: AtomicUsize,
    list_calls: AtomicUsize,
    account_calls: AtomicUsize,
    download_calls: AtomicUsize,
}

/// An in-memory remote store that counts every call it serves.
#[derive(Clone, Default)]
pub struct MockStore {
    inner: Arc<MockInner>,
}

impl MockStore {
    /// A store holding only an empty root folder.
    pub fn new() -> Self {
        let store = Self::default();
        store.put(folder(ROOT_ID, ""));
        store.inner.children.lock().unwrap().insert(ROOT_ID.to_owned(), Vec::new());
        store
    }

    fn put(&self, obj: RemoteObject) {
        self.inner.objects.lock().unwrap().insert(obj.id.clone(), obj);
    }

    /// Add `obj` as the last child of `parent`.
    pub fn add_child(&self, parent: &str, obj: RemoteObject) {
        if obj.mime_type == FOLDER_MIME {
            self.inner
                .children
                .lock()
                .unwrap()
                .entry(obj.id.clone())
                .or_default();
        }
        self.inner
            .children
            .lock()
            .unwrap()
            .entry(parent.to_owned())
            .or_default()
            .push(obj.id.clone());
        self.put(obj);
    }

    /// Remove every child of `parent`, as if they had been deleted remotely.
    pub fn clear_children(&self, parent: &str) {
        let removed = self
            .inner
            .children
            .lock()
            .unwrap()
            .insert(parent.to_owned(), Vec::new())
            .unwrap_or_default();
        let mut objects = self.inner.objects.lock().unwrap();
        for id in removed {
            objects.remove(&id);
        }
    }

    /// Add a file with `content` under `parent`.
    pub fn add_file(&self, parent: &str, id: &str, name: &str, content: &[u8]) {
        self.add_child(parent, file(id, name, content.len() as u64));
        self.inner
            .contents
            .lock()
            .unwrap()
            .insert(id.to_owned(), Bytes::copy_from_slice(content));
    }

    /// Change a file's content remotely, bumping its modification time.
    pub fn modify_file(&self, id: &str, content: &[u8], modified: SystemTime) {
        let mut objects = self.inner.objects.lock().unwrap();
        let obj = objects.get_mut(id).unwrap();
        obj.size = content.len() as u64;
        obj.modified = Some(modified);
        self.inner
            .contents
            .lock()
            .unwrap()
            .insert(id.to_owned(), Bytes::copy_from_slice(content));
    }

    /// Delay every listing by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock().unwrap() = delay;
    }

    pub fn fail_downloads(&self, fail: bool) {
        self.inner.fail_downloads.store(fail, Ordering::SeqCst);
    }

    pub fn object_calls(&self) -> usize {
        self.inner.object_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    pub fn account_calls(&self) -> usize {
        self.inner.account_calls.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.inner.download_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let delay = *self.inner.delay.lock().unwrap();
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

impl RemoteStore for MockStore {
    async fn get_object(&self, id: &str, _cancel: CancellationToken) -> Result<RemoteObject, Error> {
        self.inner.object_calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .objects
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn list_children(
        &self,
        id: &str,
        cancel: CancellationToken,
    ) -> Result<Vec<RemoteObject>, Error> {
        self.inner.list_calls.fetch_add(1, Ordering::SeqCst);
        self.pause(&cancel).await?;
        let ids = self
            .inner
            .children
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(Error::NotFound)?;
        let objects = self.inner.objects.lock().unwrap();
        Ok(ids.iter().filter_map(|id| objects.get(id).cloned()).collect())
    }

    async fn get_account_info(&self, _cancel: CancellationToken) -> Result<AccountInfo, Error> {
        self.inner.account_calls.fetch_add(1, Ordering::SeqCst);
        Ok(account())
    }

    async fn download_content(
        &self,
        id: &str,
        _cancel: CancellationToken,
    ) -> Result<ContentStream, Error> {
        self.inner.download_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_downloads.load(Ordering::SeqCst) {
            return Err(Error::transport(std::io::Error::other("connection reset")));
        }
        let content = self
            .inner
            .contents
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(Error::NotFound)?;

        // Two chunks, so consumers have to stitch them together.
        let mid = content.len() / 2;
        let chunks = vec![Ok(content.slice(..mid)), Ok(content.slice(mid..))];
        Ok(futures::stream::iter(chunks).boxed())
    }
}

/// A [`DriveFs`] over `store`, with its cache in a fresh temporary directory.
pub async fn mount(store: MockStore) -> (tempfile::TempDir, DriveFs<MockStore>) {
    let tmp = tempfile::tempdir().unwrap();
    let cache = CacheRoot::open(&tmp.path().join("cache")).await.unwrap();
    let fs = DriveFs::new(store, cache, (1000, 1000), &CancellationToken::new())
        .await
        .unwrap();
    (tmp, fs)
}
