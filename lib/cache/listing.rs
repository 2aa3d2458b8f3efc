//! Per-directory listing cache.
//!
//! A directory node owns a [`ListingSlot`]. While at least one [`ListingLease`] for the node is
//! alive, the slot holds exactly one [`DirectoryListingCache`], and every lease holder shares its
//! single remote listing fetch. When the last lease is released, the cached listing is dropped and
//! the cache detaches itself from the slot, so the next open starts from scratch.
//!
//! Installation is lock-free: a joiner bumps the installed cache's count, and an installer swaps a
//! fresh cache in with a single compare-and-swap. A cache whose count already reached zero can no
//! longer be joined, so a racing opener installs a replacement instead of resurrecting it.

use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::lazy::LazyValue;
use crate::error::Error;
use crate::remote::RemoteObject;
use crate::sync::ReferenceCounter;

/// An ordered, immutable directory listing.
pub type Listing = Arc<[RemoteObject]>;

/// The per-node slot a [`DirectoryListingCache`] is installed into.
pub type ListingSlot = ArcSwapOption<DirectoryListingCache>;

/// One shared listing plus the count of leases on it.
pub struct DirectoryListingCache {
    listing: LazyValue<Listing>,
    leases: ReferenceCounter,
    slot: Weak<ListingSlot>,
}

impl DirectoryListingCache {
    /// Join the cache installed in `slot`, or install a new one built from `make_listing`.
    ///
    /// `make_listing` may be called more than once under contention; candidates that lose the
    /// installation race are dropped without ever fetching.
    pub fn acquire_for(
        slot: &Arc<ListingSlot>,
        make_listing: impl Fn() -> LazyValue<Listing>,
    ) -> ListingLease {
        loop {
            let current = slot.load_full();
            if let Some(cache) = &current
                && cache.leases.try_inc()
            {
                return ListingLease {
                    cache: Arc::clone(cache),
                };
            }

            let candidate = Arc::new(Self {
                listing: make_listing(),
                leases: ReferenceCounter::new(),
                slot: Arc::downgrade(slot),
            });
            let prev = slot.compare_and_swap(&current, Some(Arc::clone(&candidate)));
            if same_cache((*prev).as_ref(), current.as_ref()) {
                debug!("installed directory listing cache");
                return ListingLease { cache: candidate };
            }
        }
    }

    /// The listing, fetched at most once per installation.
    pub async fn list(&self, cancel: &CancellationToken) -> Result<Listing, Error> {
        self.listing.get(cancel).await
    }

    /// Number of live leases.
    #[must_use]
    pub fn lease_count(&self) -> usize {
        self.leases.count()
    }

    fn release(self: &Arc<Self>) {
        if !self.leases.dec() {
            return;
        }

        self.listing.invalidate();
        if let Some(slot) = self.slot.upgrade() {
            let me = Some(Arc::clone(self));
            let prev = slot.compare_and_swap(&me, None::<Arc<Self>>);
            if same_cache((*prev).as_ref(), me.as_ref()) {
                debug!("detached directory listing cache");
            }
        }
    }
}

fn same_cache(
    a: Option<&Arc<DirectoryListingCache>>,
    b: Option<&Arc<DirectoryListingCache>>,
) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        (Some(_), None) | (None, Some(_)) => false,
    }
}

/// A scoped reference on a [`DirectoryListingCache`]. Released on drop.
pub struct ListingLease {
    cache: Arc<DirectoryListingCache>,
}

impl ListingLease {
    /// The shared listing.
    pub async fn list(&self, cancel: &CancellationToken) -> Result<Listing, Error> {
        self.cache.list(cancel).await
    }

    /// The cache this lease holds.
    #[must_use]
    pub fn cache(&self) -> &Arc<DirectoryListingCache> {
        &self.cache
    }

    /// Release the lease now rather than at end of scope.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ListingLease {
    fn drop(&mut self) {
        self.cache.release();
    }
}
