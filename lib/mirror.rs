//! A [`RemoteStore`] backed by a local directory tree.
//!
//! Object ids are the URL-safe, unpadded base64 encoding of the object's path relative to the
//! mirrored directory. The mirrored directory itself has the id [`MIRROR_ROOT_ID`]. Files whose
//! extension names a native document kind (`.gdoc`, `.gsheet`, ...) are reported with that
//! document's MIME type, so they are hidden exactly like native documents on a real drive.

use std::ffi::OsString;
use std::future::Future;
use std::os::unix::ffi::{OsStrExt as _, OsStringExt as _};
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures::{StreamExt as _, TryStreamExt as _};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::Error;
use crate::remote::{
    AccountInfo, ContentStream, FOLDER_MIME, Grantee, Permission, RemoteObject, RemoteStore, Role,
};

/// Id of the mirrored directory itself.
pub const MIRROR_ROOT_ID: &str = "root";

/// The permission id of the account that owns every mirrored object.
pub const MIRROR_PERMISSION_ID: &str = "mirror-owner";

const GENERIC_MIME: &str = "application/octet-stream";

/// Shortcut extensions and the native document kinds they stand for.
const NATIVE_EXTENSIONS: [(&str, &str); 8] = [
    ("gdoc", "application/vnd.google-apps.document"),
    ("gdraw", "application/vnd.google-apps.drawing"),
    ("gform", "application/vnd.google-apps.form"),
    ("gtable", "application/vnd.google-apps.fusiontable"),
    ("gslides", "application/vnd.google-apps.presentation"),
    ("gsite", "application/vnd.google-apps.sites"),
    ("gscript", "application/vnd.google-apps.script"),
    ("gsheet", "application/vnd.google-apps.spreadsheet"),
];

fn remote_err(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound
    } else {
        Error::transport(e)
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

fn mime_for(path: &Path, is_dir: bool) -> &'static str {
    if is_dir {
        return FOLDER_MIME;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| {
            NATIVE_EXTENSIONS
                .iter()
                .find(|(native, _)| native.eq_ignore_ascii_case(ext))
                .map(|&(_, mime)| mime)
        })
        .unwrap_or(GENERIC_MIME)
}

/// Translate the unix mode into permission entries: the owner bits go to the mirror account,
/// the "other" bits to everybody.
fn permissions_for(mode: u32) -> Vec<Permission> {
    let role = |read: u32, write: u32| {
        if mode & write != 0 {
            Some(Role::Writer)
        } else if mode & read != 0 {
            Some(Role::Reader)
        } else {
            None
        }
    };

    let mut perms = Vec::with_capacity(2);
    if let Some(role) = role(0o400, 0o200) {
        perms.push(Permission {
            id: MIRROR_PERMISSION_ID.to_owned(),
            role,
            grantee: Grantee::User,
        });
    }
    if let Some(role) = role(0o004, 0o002) {
        perms.push(Permission {
            id: "anyone".to_owned(),
            role,
            grantee: Grantee::Anyone,
        });
    }
    perms
}

/// Serves a local directory as a remote object store.
#[derive(Debug, Clone)]
pub struct MirrorStore {
    root: Arc<PathBuf>,
}

impl MirrorStore {
    /// Mirror the directory at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
        }
    }

    /// The mirrored directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The id of the object at `rel`, relative to the mirrored directory.
    #[must_use]
    pub fn id_for(rel: &Path) -> String {
        if rel.as_os_str().is_empty() {
            MIRROR_ROOT_ID.to_owned()
        } else {
            URL_SAFE_NO_PAD.encode(rel.as_os_str().as_bytes())
        }
    }

    /// Decode an id back into a relative path. Ids that would escape the mirror are unknown.
    fn relative(id: &str) -> Result<PathBuf, Error> {
        if id == MIRROR_ROOT_ID {
            return Ok(PathBuf::new());
        }
        let bytes = URL_SAFE_NO_PAD.decode(id).map_err(|_| Error::NotFound)?;
        let rel = PathBuf::from(OsString::from_vec(bytes));
        if rel.as_os_str().is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            debug!(id, "id escapes the mirror");
            return Err(Error::NotFound);
        }
        Ok(rel)
    }

    async fn object_at(&self, rel: &Path) -> Result<RemoteObject, Error> {
        let meta = tokio::fs::metadata(self.root.join(rel))
            .await
            .map_err(remote_err)?;
        let is_dir = meta.is_dir();
        Ok(RemoteObject {
            id: Self::id_for(rel),
            name: rel
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            mime_type: mime_for(rel, is_dir).to_owned(),
            size: if is_dir { 0 } else { meta.len() },
            modified: meta.modified().ok(),
            viewed: meta.accessed().ok(),
            created: meta.created().ok(),
            permissions: permissions_for(meta.permissions().mode()),
        })
    }
}

impl RemoteStore for MirrorStore {
    #[instrument(name = "MirrorStore::get_object", skip(self, cancel))]
    async fn get_object(&self, id: &str, cancel: CancellationToken) -> Result<RemoteObject, Error> {
        let rel = Self::relative(id)?;
        cancellable(&cancel, self.object_at(&rel)).await
    }

    #[instrument(name = "MirrorStore::list_children", skip(self, cancel))]
    async fn list_children(
        &self,
        id: &str,
        cancel: CancellationToken,
    ) -> Result<Vec<RemoteObject>, Error> {
        let rel = Self::relative(id)?;
        cancellable(&cancel, async {
            let dir = self.root.join(&rel);
            if !tokio::fs::metadata(&dir).await.map_err(remote_err)?.is_dir() {
                return Err(Error::NotADirectory);
            }

            let mut children = Vec::new();
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(remote_err)?;
            while let Some(entry) = entries.next_entry().await.map_err(remote_err)? {
                let child = rel.join(entry.file_name());
                match self.object_at(&child).await {
                    Ok(obj) => children.push(obj),
                    // Dangling symlinks and entries removed mid-listing.
                    Err(e) => debug!(path = %child.display(), error = %e, "skipping entry"),
                }
            }
            children.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(children)
        })
        .await
    }

    #[instrument(name = "MirrorStore::get_account_info", skip(self, cancel))]
    async fn get_account_info(&self, cancel: CancellationToken) -> Result<AccountInfo, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let st = nix::sys::statvfs::statvfs(self.root.as_path())
            .map_err(|e| Error::transport(std::io::Error::from(e)))?;
        let fragment = u64::from(st.fragment_size());
        let total = u64::from(st.blocks()).saturating_mul(fragment);
        let free = u64::from(st.blocks_free()).saturating_mul(fragment);
        Ok(AccountInfo {
            root_id: MIRROR_ROOT_ID.to_owned(),
            permission_id: MIRROR_PERMISSION_ID.to_owned(),
            quota_total: total,
            quota_used: total.saturating_sub(free),
        })
    }

    #[instrument(name = "MirrorStore::download_content", skip(self, cancel))]
    async fn download_content(
        &self,
        id: &str,
        cancel: CancellationToken,
    ) -> Result<ContentStream, Error> {
        let path = self.root.join(Self::relative(id)?);
        let file = cancellable(&cancel, async {
            let file = tokio::fs::File::open(&path).await.map_err(remote_err)?;
            if file.metadata().await.map_err(remote_err)?.is_dir() {
                return Err(Error::IsADirectory);
            }
            Ok(file)
        })
        .await?;

        Ok(ReaderStream::new(file).map_err(Error::transport).boxed())
    }
}
