//! Synchronization primitives.
//!
//! Shims between loom and std atomics, plus the reference counter every cached object is built
//! on.
pub mod atomic;
mod refcount;

pub use refcount::ReferenceCounter;
