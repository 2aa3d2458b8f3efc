//! Kernel lookup counts, with eviction when a node's count reaches zero.
//!
//! The kernel remembers how many times each node was handed out by `lookup` and later returns
//! them in bulk through `forget`. [`LookupWard`] mirrors those counts. Eviction runs under the
//! node's entry lock, so a racing lookup either sees the node alive and bumps its count, or sees
//! it gone and starts over with a fresh node.

use tracing::trace;

use crate::fs::NodeId;

/// Lookup counts per node.
pub struct LookupWard {
    counts: scc::HashMap<NodeId, u64>,
}

impl LookupWard {
    /// An empty ward.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counts: scc::HashMap::new(),
        }
    }

    /// Increment the count for `node`.
    ///
    /// An untracked node is only admitted if `admit` agrees, evaluated under the entry lock.
    /// Returns the count after incrementing, or `None` if the node was refused.
    pub fn inc_if(&self, node: NodeId, admit: impl FnOnce() -> bool) -> Option<u64> {
        match self.counts.entry_sync(node) {
            scc::hash_map::Entry::Occupied(mut occ) => {
                *occ.get_mut() += 1;
                Some(*occ.get())
            }
            scc::hash_map::Entry::Vacant(vac) => {
                if !admit() {
                    return None;
                }
                vac.insert_entry(1);
                Some(1)
            }
        }
    }

    /// Decrement the count for `node` by `by`.
    ///
    /// If the count reaches zero, `evict` runs with the entry still locked and the node stops
    /// being tracked. Returns `None` if `node` was not tracked.
    pub fn dec_count(&self, node: NodeId, by: u64, evict: impl FnOnce(NodeId)) -> Option<u64> {
        match self.counts.entry_sync(node) {
            scc::hash_map::Entry::Occupied(mut occ) => {
                let remaining = occ.get().saturating_sub(by);
                if remaining == 0 {
                    trace!(node, "evicting node");
                    evict(node);
                    let _ = occ.remove();
                } else {
                    *occ.get_mut() = remaining;
                }
                Some(remaining)
            }
            scc::hash_map::Entry::Vacant(_) => None,
        }
    }

    /// Run `release` for `node` unless the kernel holds lookups on it.
    ///
    /// `release` runs under the entry lock, so a concurrent [`inc_if`](Self::inc_if) on the same
    /// node waits for it and re-evaluates its admission afterwards. Returns whether `release` ran.
    pub fn release_if_untracked(&self, node: NodeId, release: impl FnOnce(NodeId)) -> bool {
        match self.counts.entry_sync(node) {
            scc::hash_map::Entry::Occupied(_) => false,
            scc::hash_map::Entry::Vacant(_) => {
                release(node);
                true
            }
        }
    }

    /// Current count for `node`.
    #[must_use]
    pub fn count(&self, node: NodeId) -> Option<u64> {
        self.counts.read_sync(&node, |_, &c| c)
    }
}

impl Default for LookupWard {
    fn default() -> Self {
        Self::new()
    }
}
