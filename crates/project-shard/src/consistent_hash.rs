//! Consistent hash ring placing shards on cluster nodes
//!
//! Uses virtual nodes to spread shards evenly and to move as few shards as
//! possible when nodes join or leave the cluster.

use fnv::FnvHasher;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::Hasher;

use crate::{NodeId, ShardId};

/// Number of virtual nodes per physical node for better distribution
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

/// Consistent hash ring of cluster nodes
#[derive(Debug)]
pub struct NodeRing {
    /// Ring mapping hash values to node IDs
    ring: RwLock<BTreeMap<u64, NodeId>>,

    /// Number of virtual nodes per physical node
    virtual_nodes: usize,

    /// Physical nodes, in join order
    nodes: RwLock<Vec<NodeId>>,
}

impl Default for NodeRing {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRing {
    /// Create a ring with default virtual nodes
    pub fn new() -> Self {
        Self::with_virtual_nodes(DEFAULT_VIRTUAL_NODES)
    }

    /// Create a ring with the given number of virtual nodes per node
    pub fn with_virtual_nodes(virtual_nodes: usize) -> Self {
        Self {
            ring: RwLock::new(BTreeMap::new()),
            virtual_nodes: virtual_nodes.max(1),
            nodes: RwLock::new(Vec::new()),
        }
    }

    /// Add a node, returns false if it was already a member
    pub fn add_node(&self, node_id: &str) -> bool {
        let mut ring = self.ring.write();
        let mut nodes = self.nodes.write();

        if nodes.iter().any(|n| n == node_id) {
            return false;
        }

        for i in 0..self.virtual_nodes {
            ring.insert(hash_key(&format!("{}#{}", node_id, i)), node_id.to_string());
        }
        nodes.push(node_id.to_string());

        tracing::debug!(node = node_id, virtual_nodes = self.virtual_nodes, "Node joined ring");
        true
    }

    /// Remove a node, returns false if it was not a member
    pub fn remove_node(&self, node_id: &str) -> bool {
        let mut ring = self.ring.write();
        let mut nodes = self.nodes.write();

        let before = nodes.len();
        nodes.retain(|n| n != node_id);
        if nodes.len() == before {
            return false;
        }

        ring.retain(|_, owner| owner != node_id);

        tracing::debug!(node = node_id, "Node left ring");
        true
    }

    /// Node owning the given shard, `None` when the ring is empty
    pub fn owner_of(&self, shard: ShardId) -> Option<NodeId> {
        let ring = self.ring.read();
        let hash = hash_key(&format!("shard-{}", shard));

        // Clockwise search, wrapping around to the start of the ring
        ring.range(hash..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, node)| node.clone())
    }

    /// All shards in `0..shard_count` owned by a node
    pub fn shards_owned_by(&self, node_id: &str, shard_count: u32) -> Vec<ShardId> {
        (0..shard_count)
            .filter(|&shard| self.owner_of(shard).as_deref() == Some(node_id))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.nodes.read().clone()
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.nodes.read().iter().any(|n| n == node_id)
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }
}

/// FNV-1a over the raw bytes, stable across processes and platforms.
///
/// Keys differing only in a trailing counter (`node#1`, `shard-7`) land close
/// together under plain FNV, so the result goes through the murmur3 64-bit
/// finalizer before being placed on the ring.
pub(crate) fn hash_key(key: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(key.as_bytes());
    fmix64(hasher.finish())
}

fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// Snapshot of ring membership for serialization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRingState {
    pub nodes: Vec<NodeId>,
    pub virtual_nodes: usize,
}

impl From<&NodeRing> for NodeRingState {
    fn from(ring: &NodeRing) -> Self {
        Self {
            nodes: ring.nodes(),
            virtual_nodes: ring.virtual_nodes,
        }
    }
}

impl From<NodeRingState> for NodeRing {
    fn from(state: NodeRingState) -> Self {
        let ring = NodeRing::with_virtual_nodes(state.virtual_nodes);
        for node in state.nodes {
            ring.add_node(&node);
        }
        ring
    }
}
