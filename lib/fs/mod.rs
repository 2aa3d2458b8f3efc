//! The filesystem proper: nodes, handles, and the kernel adapter.
/// Bidirectional remote id to node id mapping.
pub mod bridge;
/// The node and handle table that routes every filesystem operation.
pub mod drive_fs;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`drive_fs::DriveFs`].
pub mod fuser;
/// Kernel lookup counts.
pub mod lookup_ward;
mod node;

pub use drive_fs::DriveFs;

use std::time::SystemTime;

use bitflags::bitflags;

use crate::remote::ObjectKind;

/// Identifier the kernel uses for a node.
pub type NodeId = u64;

/// The node id of the mount root. Fixed by the kernel protocol.
pub const ROOT_NODE: NodeId = 1;

/// Identifier of an open file or directory session.
pub type HandleId = u64;

bitflags! {
    /// Permission bits for a node, similar to Unix file permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InodePerms: u16 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 1 << 0;
        /// Other: write permission.
        const OTHER_WRITE   = 1 << 1;
        /// Other: read permission.
        const OTHER_READ    = 1 << 2;

        /// Group: execute permission.
        const GROUP_EXECUTE = 1 << 3;
        /// Group: write permission.
        const GROUP_WRITE   = 1 << 4;
        /// Group: read permission.
        const GROUP_READ    = 1 << 5;

        /// Owner: execute permission.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner: write permission.
        const OWNER_WRITE   = 1 << 7;
        /// Owner: read permission.
        const OWNER_READ    = 1 << 8;

        /// Sticky bit.
        const STICKY        = 1 << 9;
        /// Set-group-ID bit.
        const SETGID        = 1 << 10;
        /// Set-user-ID bit.
        const SETUID        = 1 << 11;
    }
}

/// Attributes of one node, as reported to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeRecord {
    /// The node these attributes describe.
    pub node: NodeId,
    /// File or directory.
    pub kind: ObjectKind,
    /// Size in bytes.
    pub size: u64,
    /// Size in 512-byte blocks.
    pub blocks: u64,
    /// Last access.
    pub atime: SystemTime,
    /// Last content modification.
    pub mtime: SystemTime,
    /// Last status change.
    pub ctime: SystemTime,
    /// Creation.
    pub crtime: SystemTime,
    /// Permission bits.
    pub perms: InodePerms,
    /// Hard link count.
    pub nlink: u32,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// The name of this entry within its parent directory.
    pub name: String,
    /// File or directory.
    pub kind: ObjectKind,
    /// The node id assigned to the entry.
    pub node: NodeId,
}

/// Filesystem statistics returned by [`DriveFs::stat_filesystem`].
///
/// Block-related sizes are in units of `block_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsStats {
    /// Filesystem block size (bytes).
    pub block_size: u32,
    /// Total number of data blocks.
    pub total_blocks: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Number of blocks available to unprivileged users.
    pub available_blocks: u64,
    /// Total number of file nodes (inodes).
    pub total_inodes: u64,
    /// Number of free file nodes.
    pub free_inodes: u64,
    /// Maximum filename length (bytes).
    pub max_filename_length: u32,
}
