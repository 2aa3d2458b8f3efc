//! The error type shared by every layer of the filesystem core.

use std::sync::Arc;


/// Errors produced by the lazy-fetch and caching layers.
///
/// The type is `Clone` because a memoized fetch outcome is handed to every waiter of that fetch,
/// errors included. I/O errors are therefore held behind an [`Arc`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The remote store has no object with the requested id, or the directory has no child with
    /// the requested name.
    #[error("no such object")]
    NotFound,

    /// A directory operation was issued against a regular file.
    #[error("not a directory")]
    NotADirectory,

    /// A file operation was issued against a directory.
    #[error("is a directory")]
    IsADirectory,

    /// The remote object has a content kind this filesystem does not expose.
    #[error("banned content kind: {0}")]
    BannedContentKind(String),

    /// The caller's cancellation token fired before a result was available.
    #[error("operation cancelled")]
    Cancelled,

    /// The value (or the whole filesystem) was shut down.
    #[error("shut down")]
    Shutdown,

    /// The remote store failed to answer.
    #[error("remote transport error: {0}")]
    Transport(Arc<std::io::Error>),

    /// The local content cache failed.
    #[error("local cache I/O error: {0}")]
    LocalIo(Arc<std::io::Error>),

    /// A remote id that cannot name a file in the local content cache.
    #[error("invalid object id: {0:?}")]
    InvalidId(String),

    /// The handle is not open, or was opened without the requested access.
    #[error("bad file handle")]
    BadHandle,

    /// An internal consistency check failed. This is always a bug.
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),
}

impl Error {
    /// Wrap an I/O error raised by a remote store.
    #[must_use]
    pub fn transport(e: std::io::Error) -> Self {
        Self::Transport(Arc::new(e))
    }

    /// The errno reported to the kernel for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound | Self::BannedContentKind(_) => libc::ENOENT,
            Self::NotADirectory => libc::ENOTDIR,
            Self::IsADirectory => libc::EISDIR,
            Self::Cancelled => libc::EINTR,
            Self::Shutdown => libc::ESTALE,
            Self::LocalIo(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::BadHandle => libc::EBADF,
            Self::InvalidId(_) => libc::EINVAL,
            Self::Transport(_) | Self::InvariantViolation(_) => libc::EIO,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::LocalIo(Arc::new(e))
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Self::LocalIo(Arc::new(std::io::Error::from(e)))
    }
}
