//! Project sharding for view coordination
//!
//! This crate provides:
//! - **Shard extraction**: a stable `hash(project) mod N` mapping
//! - **Consistent hashing**: placing shards on cluster nodes with virtual nodes
//! - **Shard allocation**: an epoch-versioned ownership table reporting the
//!   shards that move when nodes join or leave
//!
//! # Example
//!
//! ```rust
//! use project_shard::{ShardAllocation, ShardExtractor};
//! use view_core::ProjectRef;
//!
//! let extractor = ShardExtractor::new(100).unwrap();
//! let allocation = ShardAllocation::new(100, 150);
//! allocation.join("node-0");
//!
//! let shard = extractor.shard_for(&ProjectRef::new("org", "proj"));
//! assert_eq!(allocation.owner(shard).as_deref(), Some("node-0"));
//! ```

mod allocation;
mod consistent_hash;
mod extractor;

pub use allocation::{AllocationState, Rebalance, ShardAllocation, ShardMove};
pub use consistent_hash::{NodeRing, NodeRingState, DEFAULT_VIRTUAL_NODES};
pub use extractor::ShardExtractor;

/// Shard identifier in `0..shard_count`
pub type ShardId = u32;

/// Cluster node identifier
pub type NodeId = String;
