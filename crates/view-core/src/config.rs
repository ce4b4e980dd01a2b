//! Runtime configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Local node settings
    pub node: NodeConfig,

    /// Sharding settings
    pub sharding: ShardingConfig,

    /// Project coordinator settings
    pub coordinator: CoordinatorConfig,

    /// Backing store cleanup retry settings
    pub cleanup: RetryConfig,

    /// View directory settings
    pub directory: DirectoryConfig,
}

impl RuntimeConfig {
    /// Load configuration from a JSON file and validate it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: RuntimeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the coordinator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.is_empty() {
            return Err(invalid("node.node_id must not be empty"));
        }
        if self.sharding.shard_count == 0 {
            return Err(invalid("sharding.shard_count must be positive"));
        }
        if self.sharding.virtual_nodes == 0 {
            return Err(invalid("sharding.virtual_nodes must be positive"));
        }
        if self.coordinator.mailbox_capacity == 0 {
            return Err(invalid("coordinator.mailbox_capacity must be positive"));
        }
        if self.coordinator.stash_capacity == 0 {
            return Err(invalid("coordinator.stash_capacity must be positive"));
        }
        if self.cleanup.max_attempts == 0 {
            return Err(invalid("cleanup.max_attempts must be positive"));
        }
        if self.cleanup.random_factor.is_nan() || self.cleanup.random_factor < 0.0 {
            return Err(invalid("cleanup.random_factor must be a non-negative number"));
        }
        if self.cleanup.backoff_multiplier < 1.0 {
            return Err(invalid("cleanup.backoff_multiplier must be at least 1.0"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidConfig {
        message: message.to_string(),
    }
}

/// Local node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identifier of this node in the cluster
    pub node_id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-0".to_string(),
        }
    }
}

/// Sharding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Fixed number of shards the project space is split into
    pub shard_count: u32,

    /// Virtual nodes per cluster member on the allocation ring
    pub virtual_nodes: usize,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shard_count: 100,
            virtual_nodes: 150,
        }
    }
}

/// Project coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Capacity of each coordinator's mailbox
    pub mailbox_capacity: usize,

    /// Messages buffered while waiting for `Start`.
    ///
    /// Past this size the oldest views change, then the oldest project change,
    /// that a later command of the same kind replaces is discarded. Commands
    /// without such a successor are kept, so the stash never grows past the
    /// larger of this bound and two.
    pub stash_capacity: usize,

    /// Upper bound on waiting for workers to stop
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            stash_capacity: 1000,
            stop_timeout: Duration::from_secs(30),
        }
    }
}

/// Retry configuration with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, the first one included
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Each delay is stretched by a random amount in `[0, random_factor)`
    pub random_factor: f64,

    /// Finished cleanup records kept for status queries, oldest evicted first
    pub retain_finished: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            backoff_multiplier: 2.0,
            random_factor: 0.2,
            retain_finished: 1000,
        }
    }
}

/// View directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Buffer of change notifications kept per subscription
    pub notification_buffer: usize,

    /// Optional JSON file with projects and views loaded at startup
    pub seed_path: Option<PathBuf>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            notification_buffer: 64,
            seed_path: None,
        }
    }
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
