//! Project to shard mapping

use view_core::{Error, ProjectRef, Result};

use crate::consistent_hash::hash_key;
use crate::ShardId;

/// Maps project references onto a fixed number of shards.
///
/// The mapping only depends on the project reference and the shard count, so
/// every node of a cluster configured with the same count agrees on it.
#[derive(Debug, Clone, Copy)]
pub struct ShardExtractor {
    shard_count: u32,
}

impl ShardExtractor {
    pub fn new(shard_count: u32) -> Result<Self> {
        if shard_count == 0 {
            return Err(Error::InvalidConfig {
                message: "shard count must be positive".to_string(),
            });
        }
        Ok(Self { shard_count })
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// `hash(project) mod shard_count`
    pub fn shard_for(&self, project: &ProjectRef) -> ShardId {
        (hash_key(&project.to_string()) % self.shard_count as u64) as ShardId
    }
}
