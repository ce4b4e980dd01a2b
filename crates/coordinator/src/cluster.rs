//! Cluster membership and shard hand-off
//!
//! A [`Cluster`] tracks the nodes hosting coordinators, the shard allocation
//! between them and the starts remembered for every project. Nodes live in
//! one process and reach each other directly through their routers.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use lifecycle::WorkerLifecycle;
use tokio::sync::watch;
use project_shard::{NodeId, Rebalance, ShardAllocation, ShardExtractor, ShardId};
use tracing::info;
use view_core::config::{CoordinatorConfig, ShardingConfig};
use view_core::{Project, ProjectRef, Result, ViewSet};

use crate::directory::ViewDirectory;
use crate::router::{RouterInner, ShardRouter};

/// Last known `Start` of a project, re-delivered when its coordinator is
/// re-created
#[derive(Debug, Clone)]
pub struct RememberedStart {
    pub project: Project,
    pub views: ViewSet,
}

pub(crate) struct ClusterShared {
    pub(crate) extractor: ShardExtractor,
    pub(crate) allocation: ShardAllocation,
    pub(crate) nodes: DashMap<NodeId, Weak<RouterInner>>,
    pub(crate) remembered: DashMap<ProjectRef, RememberedStart>,

    /// Detached incarnations still stopping their workers, by project
    pub(crate) terminating: DashMap<ProjectRef, (u64, watch::Receiver<bool>)>,

    /// Incarnation counter shared by every node
    pub(crate) incarnations: AtomicU64,
}

impl ClusterShared {
    pub(crate) fn router(&self, node_id: &str) -> Option<ShardRouter> {
        self.nodes
            .get(node_id)
            .and_then(|node| node.upgrade())
            .map(ShardRouter::from_inner)
    }

    pub(crate) fn shard_for(&self, project: &ProjectRef) -> ShardId {
        self.extractor.shard_for(project)
    }

    /// Termination signal of the project's detached incarnation, if one is
    /// still stopping
    pub(crate) fn predecessor(&self, project: &ProjectRef) -> Option<watch::Receiver<bool>> {
        self.terminating
            .get(project)
            .map(|entry| entry.value().1.clone())
    }

    /// Remembered starts of projects living in `shards`
    pub(crate) fn remembered_in(&self, shards: &[ShardId]) -> Vec<RememberedStart> {
        self.remembered
            .iter()
            .filter(|entry| shards.contains(&self.shard_for(entry.key())))
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// Coordinator nodes sharing one shard allocation
#[derive(Clone)]
pub struct Cluster {
    shared: Arc<ClusterShared>,
}

impl Cluster {
    pub fn new(config: &ShardingConfig) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(ClusterShared {
                extractor: ShardExtractor::new(config.shard_count)?,
                allocation: ShardAllocation::new(config.shard_count, config.virtual_nodes),
                nodes: DashMap::new(),
                remembered: DashMap::new(),
                terminating: DashMap::new(),
                incarnations: AtomicU64::new(0),
            }),
        })
    }

    /// Add a node and hand it the shards it now owns
    pub async fn join(
        &self,
        node_id: &str,
        lifecycle: WorkerLifecycle,
        directory: Arc<dyn ViewDirectory>,
        config: &CoordinatorConfig,
    ) -> ShardRouter {
        let router = ShardRouter::new(
            node_id.to_string(),
            Arc::clone(&self.shared),
            lifecycle,
            directory,
            config.clone(),
        );
        self.shared
            .nodes
            .insert(node_id.to_string(), router.downgrade());

        let rebalance = self.shared.allocation.join(node_id);
        self.hand_off(&rebalance).await;
        info!(
            node = node_id,
            epoch = rebalance.epoch,
            shards = self.shared.allocation.shards_of(node_id).len(),
            "Node joined cluster"
        );
        router
    }

    /// Remove a node; its coordinators stop and restart on the new owners
    pub async fn leave(&self, node_id: &str) {
        let rebalance = self.shared.allocation.leave(node_id);
        self.hand_off(&rebalance).await;
        if let Some((_, node)) = self.shared.nodes.remove(node_id) {
            if let Some(inner) = node.upgrade() {
                ShardRouter::from_inner(inner).shutdown().await;
            }
        }
        info!(node = node_id, epoch = rebalance.epoch, "Node left cluster");
    }

    /// Stop coordinators of released shards, then restart them on their new owners
    async fn hand_off(&self, rebalance: &Rebalance) {
        if rebalance.moves.is_empty() {
            return;
        }

        let routers = self.routers();
        for router in &routers {
            let released = rebalance.released_by(router.node_id());
            if !released.is_empty() {
                router.release_shards(&released).await;
            }
        }
        for router in &routers {
            let acquired = rebalance.acquired_by(router.node_id());
            if !acquired.is_empty() {
                router.acquire_shards(&acquired).await;
            }
        }
    }

    pub fn router(&self, node_id: &str) -> Option<ShardRouter> {
        self.shared.router(node_id)
    }

    pub fn routers(&self) -> Vec<ShardRouter> {
        let mut routers: Vec<_> = self
            .shared
            .nodes
            .iter()
            .filter_map(|node| node.value().upgrade())
            .map(ShardRouter::from_inner)
            .collect();
        routers.sort_by(|a, b| a.node_id().cmp(b.node_id()));
        routers
    }

    pub fn allocation(&self) -> &ShardAllocation {
        &self.shared.allocation
    }

    pub fn shard_for(&self, project: &ProjectRef) -> ShardId {
        self.shared.shard_for(project)
    }

    /// Node currently owning a project's shard
    pub fn owner_of(&self, project: &ProjectRef) -> Option<NodeId> {
        self.shared.allocation.owner(self.shard_for(project))
    }

    pub fn remembered(&self, project: &ProjectRef) -> Option<RememberedStart> {
        self.shared
            .remembered
            .get(project)
            .map(|entry| entry.value().clone())
    }

    /// Stop every node's coordinators
    pub async fn shutdown(&self) {
        for router in self.routers() {
            router.shutdown().await;
        }
    }
}
