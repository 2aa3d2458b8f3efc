//! Bidirectional mapping between remote object ids and node ids.
//!
//! [`IdBridge`] keeps two [`scc::HashMap`]s guarded by a coordination lock for cross-map
//! atomicity. Reads go straight to the maps.

use std::sync::{Mutex, PoisonError};

use crate::fs::NodeId;

/// Remote id to node id mapping, in both directions.
pub struct IdBridge {
    /// node -> remote
    by_node: scc::HashMap<NodeId, String>,
    /// remote -> node
    by_remote: scc::HashMap<String, NodeId>,
    /// Serializes mutations that touch both maps.
    mu: Mutex<()>,
}

impl IdBridge {
    /// Creates an empty bridge.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_node: scc::HashMap::new(),
            by_remote: scc::HashMap::new(),
            mu: Mutex::new(()),
        }
    }

    /// Map `node` to `remote`, replacing any previous mapping of `node`.
    pub fn insert(&self, node: NodeId, remote: &str) {
        let _guard = self.mu.lock().unwrap_or_else(PoisonError::into_inner);
        match self.by_node.entry_sync(node) {
            scc::hash_map::Entry::Occupied(mut occ) => {
                let old = std::mem::replace(occ.get_mut(), remote.to_owned());
                self.by_remote.remove_sync(&old);
            }
            scc::hash_map::Entry::Vacant(vac) => {
                vac.insert_entry(remote.to_owned());
            }
        }
        match self.by_remote.entry_sync(remote.to_owned()) {
            scc::hash_map::Entry::Occupied(mut occ) => *occ.get_mut() = node,
            scc::hash_map::Entry::Vacant(vac) => {
                vac.insert_entry(node);
            }
        }
    }

    /// Resolve node -> remote id.
    #[must_use]
    pub fn remote_id(&self, node: NodeId) -> Option<String> {
        self.by_node.read_sync(&node, |_, v| v.clone())
    }

    /// Resolve remote id -> node.
    #[must_use]
    pub fn node_id(&self, remote: &str) -> Option<NodeId> {
        self.by_remote.read_sync(remote, |_, &v| v)
    }

    /// Look up the node for `remote`, or allocate one if unmapped.
    #[must_use]
    pub fn node_or_insert(&self, remote: &str, allocate: impl FnOnce() -> NodeId) -> NodeId {
        if let Some(node) = self.node_id(remote) {
            return node;
        }

        let _guard = self.mu.lock().unwrap_or_else(PoisonError::into_inner);
        match self.by_remote.entry_sync(remote.to_owned()) {
            scc::hash_map::Entry::Occupied(occ) => *occ.get(),
            scc::hash_map::Entry::Vacant(vac) => {
                let node = allocate();
                vac.insert_entry(node);
                let _ = self.by_node.insert_sync(node, remote.to_owned());
                node
            }
        }
    }

    /// Remove the mapping for `node`.
    pub fn remove_node(&self, node: NodeId) {
        let _guard = self.mu.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, remote)) = self.by_node.remove_sync(&node) {
            self.by_remote.remove_if_sync(&remote, |mapped| *mapped == node);
        }
    }

    /// Number of mapped nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    /// Whether no node is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }
}

impl Default for IdBridge {
    fn default() -> Self {
        Self::new()
    }
}
