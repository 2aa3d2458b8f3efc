/// Attribute reconciliation between remote metadata and the local stat.
pub mod attr;
/// File-backed content cache.
pub mod fcache;
/// Single-flight memoized fetch.
pub mod lazy;
/// Shared per-directory listings.
pub mod listing;
