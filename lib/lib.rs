//! drive-fs shared library.
//!
//! A remote object store mounted as a local filesystem, with lazily fetched metadata, shared
//! directory listings, and a reference-counted on-disk content cache.

/// Caching primitives for drive-fs.
pub mod cache;
pub mod error;
/// Filesystem nodes, handles and the kernel adapter.
pub mod fs;
pub mod io;
pub mod mirror;
pub mod remote;
pub mod sync;

pub use error::Error;
