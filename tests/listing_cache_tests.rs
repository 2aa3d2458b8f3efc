#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;

use drive_fs::cache::lazy::LazyValue;
use drive_fs::cache::listing::{DirectoryListingCache, Listing, ListingLease, ListingSlot};

use common::file;

fn acquire(slot: &Arc<ListingSlot>, fetches: &Arc<AtomicUsize>) -> ListingLease {
    DirectoryListingCache::acquire_for(slot, || {
        let fetches = Arc::clone(fetches);
        LazyValue::new(move |_cancel| {
            let n = fetches.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(Listing::from(vec![
                    file("a", "a.txt", 1),
                    file("b", &format!("b-{n}.txt"), 2),
                ]))
            }
        })
    })
}

#[tokio::test]
async fn leases_share_one_listing_fetch() {
    let slot = Arc::new(ListingSlot::empty());
    let fetches = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationToken::new();

    let leases: Vec<_> = (0..3).map(|_| acquire(&slot, &fetches)).collect();
    assert_eq!(leases[0].cache().lease_count(), 3);
    assert!(Arc::ptr_eq(leases[0].cache(), leases[2].cache()));

    for lease in &leases {
        let listing = lease.list(&cancel).await.unwrap();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[1].name, "b-0.txt");
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cache_stays_installed_while_any_lease_lives() {
    let slot = Arc::new(ListingSlot::empty());
    let fetches = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationToken::new();

    let first = acquire(&slot, &fetches);
    let second = acquire(&slot, &fetches);
    first.list(&cancel).await.unwrap();

    first.release();
    assert!(slot.load().is_some());
    assert_eq!(second.cache().lease_count(), 1);

    let third = acquire(&slot, &fetches);
    assert!(Arc::ptr_eq(second.cache(), third.cache()));
    third.list(&cancel).await.unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn releasing_the_last_lease_detaches_and_forgets() {
    let slot = Arc::new(ListingSlot::empty());
    let fetches = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationToken::new();

    let lease = acquire(&slot, &fetches);
    lease.list(&cancel).await.unwrap();
    let old = Arc::clone(lease.cache());
    drop(lease);

    assert!(slot.load().is_none(), "slot should be emptied");
    assert_eq!(old.lease_count(), 0);

    let lease = acquire(&slot, &fetches);
    assert!(!Arc::ptr_eq(&old, lease.cache()), "a dead cache is never rejoined");
    let listing = lease.list(&cancel).await.unwrap();
    assert_eq!(listing[1].name, "b-1.txt");
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_acquirers_install_exactly_one_cache() {
    const TASKS: usize = 16;

    let slot = Arc::new(ListingSlot::empty());
    let fetches = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(tokio::sync::Barrier::new(TASKS));

    let tasks: Vec<_> = (0..TASKS)
        .map(|_| {
            let slot = Arc::clone(&slot);
            let fetches = Arc::clone(&fetches);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                let lease = acquire(&slot, &fetches);
                barrier.wait().await;
                let listing = lease.list(&CancellationToken::new()).await.unwrap();
                (Arc::as_ptr(lease.cache()) as usize, listing.len())
            })
        })
        .collect();

    let mut caches = Vec::with_capacity(TASKS);
    for t in tasks {
        let (cache, len) = t.await.unwrap();
        assert_eq!(len, 2);
        caches.push(cache);
    }
    caches.dedup();
    assert_eq!(caches.len(), 1, "every lease should share one cache");
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert!(slot.load().is_none(), "all leases are gone");
}

#[tokio::test]
async fn cancelled_list_leaves_the_lease_usable() {
    let slot = Arc::new(ListingSlot::empty());
    let fetches = Arc::new(AtomicUsize::new(0));

    let lease = acquire(&slot, &fetches);
    let cancelled = CancellationToken::new();
    cancelled.cancel();
    assert!(lease.list(&cancelled).await.is_err());

    let listing = lease.list(&CancellationToken::new()).await.unwrap();
    assert_eq!(listing.len(), 2);
}
