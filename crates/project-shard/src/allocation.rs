//! Shard ownership table
//!
//! Records which node owns every shard and recomputes ownership through the
//! node ring when membership changes. Each change bumps the allocation epoch
//! and reports the shards whose owner moved, so callers can hand them off.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{NodeId, NodeRing, ShardId};

/// A shard whose owner changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMove {
    pub shard: ShardId,
    pub from: Option<NodeId>,
    pub to: Option<NodeId>,
}

/// Outcome of a membership change
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rebalance {
    /// Allocation epoch after the change
    pub epoch: u64,

    /// Shards that changed owner
    pub moves: Vec<ShardMove>,
}

impl Rebalance {
    /// Shards the given node has to give up
    pub fn released_by(&self, node_id: &str) -> Vec<ShardId> {
        self.moves
            .iter()
            .filter(|m| m.from.as_deref() == Some(node_id))
            .map(|m| m.shard)
            .collect()
    }

    /// Shards the given node takes over
    pub fn acquired_by(&self, node_id: &str) -> Vec<ShardId> {
        self.moves
            .iter()
            .filter(|m| m.to.as_deref() == Some(node_id))
            .map(|m| m.shard)
            .collect()
    }
}

#[derive(Debug)]
struct Table {
    epoch: u64,
    owners: Vec<Option<NodeId>>,
}

/// Cluster wide shard ownership
#[derive(Debug)]
pub struct ShardAllocation {
    shard_count: u32,
    ring: NodeRing,
    table: RwLock<Table>,
}

impl ShardAllocation {
    pub fn new(shard_count: u32, virtual_nodes: usize) -> Self {
        Self {
            shard_count,
            ring: NodeRing::with_virtual_nodes(virtual_nodes),
            table: RwLock::new(Table {
                epoch: 0,
                owners: vec![None; shard_count as usize],
            }),
        }
    }

    /// Add a member; no-op (empty rebalance) if it already is one
    pub fn join(&self, node_id: &str) -> Rebalance {
        if !self.ring.add_node(node_id) {
            return self.unchanged();
        }
        let rebalance = self.recompute();
        tracing::info!(
            node = node_id,
            epoch = rebalance.epoch,
            moved = rebalance.moves.len(),
            "Node joined shard allocation"
        );
        rebalance
    }

    /// Remove a member; no-op (empty rebalance) if it is not one
    pub fn leave(&self, node_id: &str) -> Rebalance {
        if !self.ring.remove_node(node_id) {
            return self.unchanged();
        }
        let rebalance = self.recompute();
        tracing::info!(
            node = node_id,
            epoch = rebalance.epoch,
            moved = rebalance.moves.len(),
            "Node left shard allocation"
        );
        rebalance
    }

    /// Current owner of a shard
    pub fn owner(&self, shard: ShardId) -> Option<NodeId> {
        self.table
            .read()
            .owners
            .get(shard as usize)
            .cloned()
            .flatten()
    }

    /// Shards currently owned by a node
    pub fn shards_of(&self, node_id: &str) -> Vec<ShardId> {
        self.table
            .read()
            .owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| owner.as_deref() == Some(node_id))
            .map(|(shard, _)| shard as ShardId)
            .collect()
    }

    pub fn epoch(&self) -> u64 {
        self.table.read().epoch
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.ring.nodes()
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    fn unchanged(&self) -> Rebalance {
        Rebalance {
            epoch: self.epoch(),
            moves: Vec::new(),
        }
    }

    fn recompute(&self) -> Rebalance {
        let mut table = self.table.write();
        let mut moves = Vec::new();

        for shard in 0..self.shard_count {
            let next = self.ring.owner_of(shard);
            let slot = &mut table.owners[shard as usize];
            if *slot != next {
                moves.push(ShardMove {
                    shard,
                    from: slot.take(),
                    to: next.clone(),
                });
                *slot = next;
            }
        }

        table.epoch += 1;
        Rebalance {
            epoch: table.epoch,
            moves,
        }
    }
}

/// Serializable view of the ownership table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationState {
    pub epoch: u64,
    pub owners: Vec<Option<NodeId>>,
}

impl From<&ShardAllocation> for AllocationState {
    fn from(allocation: &ShardAllocation) -> Self {
        let table = allocation.table.read();
        Self {
            epoch: table.epoch,
            owners: table.owners.clone(),
        }
    }
}
