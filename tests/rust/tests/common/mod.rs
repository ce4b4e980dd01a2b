//! Shared harness for coordination tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use backends::InMemoryBackend;
use coordinator::{Cluster, CoordinatorSnapshot, Envelope, InMemoryDirectory, ShardRouter};
use lifecycle::WorkerLifecycle;
use view_core::logging::init_tracing;
use view_core::{GraphView, IndexView, Project, ProjectRef, RuntimeConfig, View, ViewSet};

/// One node with in-memory backends
pub struct Node {
    pub router: ShardRouter,
    pub lifecycle: WorkerLifecycle,
    pub index: InMemoryBackend,
    pub graph: InMemoryBackend,
}

impl Node {
    pub fn running_workers(&self) -> usize {
        self.index.running_worker_count() + self.graph.running_worker_count()
    }

    pub fn delete_calls(&self) -> u32 {
        self.index.total_delete_calls() + self.graph.total_delete_calls()
    }
}

/// A cluster sharing one directory
pub struct Harness {
    pub config: RuntimeConfig,
    pub cluster: Cluster,
    pub directory: Arc<InMemoryDirectory>,
    pub project: Project,
    pub node: Node,
}

impl Harness {
    pub async fn new() -> Result<Self> {
        Self::with_config(RuntimeConfig::default()).await
    }

    pub async fn with_config(config: RuntimeConfig) -> Result<Self> {
        init_tracing("warn");
        config.validate()?;

        let cluster = Cluster::new(&config.sharding)?;
        let directory = Arc::new(InMemoryDirectory::new(config.directory.notification_buffer));
        let node = join(&cluster, &config, &directory, "node-0").await;

        Ok(Self {
            config,
            cluster,
            directory,
            project: Project::new(ProjectRef::new("acme", "catalog")),
            node,
        })
    }

    pub async fn join(&self, node_id: &str) -> Node {
        join(&self.cluster, &self.config, &self.directory, node_id).await
    }

    pub fn index(&self, id: &str, revision: u64) -> View {
        View::from(IndexView::new(id, revision, self.project.reference.clone()))
    }

    pub fn graph(&self, id: &str, revision: u64) -> View {
        View::from(GraphView::new(id, revision, self.project.reference.clone()))
    }

    pub async fn route(&self, envelope: Envelope) -> Result<()> {
        Ok(self.node.router.route(envelope).await?)
    }

    pub async fn start(&self, views: impl IntoIterator<Item = View>) -> Result<()> {
        self.route(Envelope::start(self.project.clone(), ViewSet::new(1, views)))
            .await
    }

    pub async fn change_views(&self, revision: u64, views: impl IntoIterator<Item = View>) -> Result<()> {
        self.route(Envelope::views_changes(
            self.project.reference.clone(),
            ViewSet::new(revision, views),
        ))
        .await
    }

    /// Snapshot of the project's coordinator, which must be running
    pub async fn snapshot(&self) -> Result<CoordinatorSnapshot> {
        self.node
            .router
            .snapshot(&self.project.reference)
            .await?
            .ok_or_else(|| anyhow!("no coordinator for {}", self.project.reference))
    }

    /// Poll the coordinator until `check` holds
    pub async fn snapshot_until(
        &self,
        what: &str,
        mut check: impl FnMut(&CoordinatorSnapshot) -> bool,
    ) -> Result<CoordinatorSnapshot> {
        for _ in 0..500 {
            if let Some(snapshot) = self.node.router.snapshot(&self.project.reference).await? {
                if check(&snapshot) {
                    return Ok(snapshot);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        bail!("timed out waiting for {}", what)
    }
}

async fn join(
    cluster: &Cluster,
    config: &RuntimeConfig,
    directory: &Arc<InMemoryDirectory>,
    node_id: &str,
) -> Node {
    let (lifecycle, index, graph) =
        WorkerLifecycle::in_memory(&config.cleanup, config.coordinator.stop_timeout);
    let router = cluster
        .join(node_id, lifecycle.clone(), directory.clone(), &config.coordinator)
        .await;
    Node {
        router,
        lifecycle,
        index,
        graph,
    }
}

/// Poll until `check` holds
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..500 {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for {}", what)
}
