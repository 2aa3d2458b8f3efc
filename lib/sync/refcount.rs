//! Atomic shared-ownership counter.

use super::atomic::{AtomicUsize, Ordering, fence};

/// A reference count that reports the transition to zero exactly once.
///
/// The counter starts at 1, representing the creator's reference. Every [`inc`](Self::inc) must
/// be balanced by exactly one [`dec`](Self::dec); whichever `dec` brings the count to zero gets
/// `true` back and is responsible for tearing down the shared object.
#[derive(Debug)]
pub struct ReferenceCounter {
    count: AtomicUsize,
}

impl ReferenceCounter {
    /// A fresh counter holding the creator's reference.
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
        }
    }

    /// Take another reference.
    ///
    /// # Panics
    ///
    /// Panics if the count was already zero. Reviving a torn-down object is a bug; callers that
    /// may race with teardown must use [`try_inc`](Self::try_inc).
    pub fn inc(&self) {
        let prev = self.count.fetch_add(1, Ordering::Relaxed);
        assert!(prev != 0, "ReferenceCounter revived after reaching zero");
    }

    /// Take another reference unless the count already reached zero.
    ///
    /// Returns `false` if the object is being (or has been) torn down.
    #[must_use]
    pub fn try_inc(&self) -> bool {
        let mut cur = self.count.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Drop one reference. Returns `true` iff this call brought the count to zero.
    ///
    /// # Panics
    ///
    /// Panics on underflow. An unbalanced `dec` means some teardown already ran while a holder
    /// still believed it owned a reference, and continuing would risk a double teardown.
    #[must_use = "the caller that observes zero must tear the object down"]
    pub fn dec(&self) -> bool {
        let prev = self.count.fetch_sub(1, Ordering::Release);
        assert!(prev != 0, "ReferenceCounter underflow");
        if prev == 1 {
            // Pairs with the Release above so teardown sees every prior holder's writes.
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    /// The current count. Only meaningful for diagnostics and tests.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for ReferenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
