//! The remote object store, as seen by the filesystem.
//!
//! [`RemoteStore`] is the only way the filesystem reaches the network. Every call takes a
//! [`CancellationToken`] that fires when nobody is waiting for the answer anymore.

use std::future::Future;
use std::time::SystemTime;

use bytes::Bytes;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::fs::InodePerms;

/// MIME type the remote uses for folders.
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Native document kinds that have no byte representation and are never exposed.
pub const BANNED_MIMES: [&str; 8] = [
    "application/vnd.google-apps.document",
    "application/vnd.google-apps.drawing",
    "application/vnd.google-apps.form",
    "application/vnd.google-apps.fusiontable",
    "application/vnd.google-apps.presentation",
    "application/vnd.google-apps.sites",
    "application/vnd.google-apps.script",
    "application/vnd.google-apps.spreadsheet",
];

/// What a remote object is exposed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// A regular file with downloadable content.
    File,
    /// A folder.
    Directory,
}

/// Access level granted by a permission entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Full control.
    Owner,
    /// May modify content.
    Writer,
    /// May read content.
    Reader,
}

/// Who a permission entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Grantee {
    /// One account, identified by the entry's id.
    User,
    /// Everybody, including anonymous readers.
    Anyone,
    /// Every account of a domain.
    Domain,
    /// A group of accounts.
    Group,
}

/// One access-control entry on a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Permission {
    /// Permission id. For [`Grantee::User`] entries this matches [`AccountInfo::permission_id`].
    pub id: String,
    /// Granted access level.
    pub role: Role,
    /// Who the entry applies to.
    pub grantee: Grantee,
}

impl Permission {
    fn bits(&self) -> InodePerms {
        let rwx = match self.role {
            Role::Owner | Role::Writer => {
                InodePerms::OWNER_READ | InodePerms::OWNER_WRITE | InodePerms::OWNER_EXECUTE
            }
            Role::Reader => InodePerms::OWNER_READ | InodePerms::OWNER_EXECUTE,
        };
        match self.grantee {
            Grantee::User => rwx,
            Grantee::Anyone => {
                InodePerms::from_bits_truncate(rwx.bits() >> 3)
                    | InodePerms::from_bits_truncate(rwx.bits() >> 6)
            }
            // No ACL mapping for shared principals.
            Grantee::Domain | Grantee::Group => InodePerms::empty(),
        }
    }
}

/// An immutable snapshot of one remote entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Opaque remote id. Also the name of the object's file in the local content cache.
    pub id: String,
    /// Display name, used as the directory entry name.
    pub name: String,
    /// MIME type, from which the [`ObjectKind`] is derived.
    pub mime_type: String,
    /// Content size in bytes. Zero for folders.
    pub size: u64,
    /// Last content modification.
    pub modified: Option<SystemTime>,
    /// Last time the account viewed the object.
    pub viewed: Option<SystemTime>,
    /// Creation time.
    pub created: Option<SystemTime>,
    /// Access-control entries.
    pub permissions: Vec<Permission>,
}

impl RemoteObject {
    /// Classify the object, failing with [`Error::BannedContentKind`] for native documents.
    pub fn kind(&self) -> Result<ObjectKind, Error> {
        if self.mime_type == FOLDER_MIME {
            Ok(ObjectKind::Directory)
        } else if BANNED_MIMES.contains(&self.mime_type.as_str()) {
            Err(Error::BannedContentKind(self.mime_type.clone()))
        } else {
            Ok(ObjectKind::File)
        }
    }

    /// The later of "viewed" and "modified", or the creation time if neither is known.
    #[must_use]
    pub fn atime(&self) -> SystemTime {
        match (self.viewed, self.modified) {
            (None, None) => self.crtime(),
            (Some(v), Some(m)) => v.max(m),
            (Some(t), None) | (None, Some(t)) => t,
        }
    }

    /// Content modification time.
    #[must_use]
    pub fn mtime(&self) -> SystemTime {
        self.modified.unwrap_or(SystemTime::UNIX_EPOCH)
    }

    /// Creation time.
    #[must_use]
    pub fn crtime(&self) -> SystemTime {
        self.created.unwrap_or(SystemTime::UNIX_EPOCH)
    }

    /// Permission bits as seen by the account owning `permission_id`.
    ///
    /// User entries only count when they belong to this account. "Anyone" entries grant group
    /// and other access. Files never get execute bits.
    #[must_use]
    pub fn perms(&self, permission_id: &str) -> InodePerms {
        let mut perms = self
            .permissions
            .iter()
            .filter(|p| p.grantee != Grantee::User || p.id == permission_id)
            .fold(InodePerms::empty(), |acc, p| acc | p.bits());

        if self.mime_type != FOLDER_MIME {
            perms.remove(
                InodePerms::OWNER_EXECUTE | InodePerms::GROUP_EXECUTE | InodePerms::OTHER_EXECUTE,
            );
        }
        perms
    }
}

/// Account-wide information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    /// Id of the account's root folder.
    pub root_id: String,
    /// The account's own permission id, matched against [`Permission::id`].
    pub permission_id: String,
    /// Total quota in bytes.
    pub quota_total: u64,
    /// Used quota in bytes.
    pub quota_used: u64,
}

/// Streamed object content.
pub type ContentStream = BoxStream<'static, Result<Bytes, Error>>;

/// A remote hierarchical object store.
///
/// Implementations are cheap to clone; every clone talks to the same store.
pub trait RemoteStore: Clone + Send + Sync + 'static {
    /// Fetch the current snapshot of one object.
    fn get_object(
        &self,
        id: &str,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<RemoteObject, Error>> + Send;

    /// List the children of a folder, in the order they should be presented.
    fn list_children(
        &self,
        id: &str,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Vec<RemoteObject>, Error>> + Send;

    /// Fetch account-wide information.
    fn get_account_info(
        &self,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<AccountInfo, Error>> + Send;

    /// Start downloading the content of a file.
    fn download_content(
        &self,
        id: &str,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<ContentStream, Error>> + Send;
}
