//! End-to-end view lifecycle
//!
//! Desired views flow from the directory through the translator into the
//! owning coordinator. Also covers crash recovery, shard hand-off between
//! nodes and routing failures.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use backends::{BackendRegistry, InMemoryBackend, ViewBackend, WorkerHandle};
use common::{eventually, Harness};
use coordinator::{Cluster, Envelope, InMemoryDirectory, ProjectEvent, ProjectSupervisor};
use lifecycle::{CleanupEvent, WorkerLifecycle};
use serde_json::json;
use view_core::{Error, Project, ProjectRef, RuntimeConfig, View, ViewKind, ViewSet};

#[tokio::test(start_paused = true)]
async fn test_directory_driven_lifecycle() -> Result<()> {
    let h = Harness::new().await?;
    let supervisor = ProjectSupervisor::new(h.node.router.clone(), h.directory.clone());
    let mut cleanups = h.node.lifecycle.cleanup_executor().subscribe();

    // 1. Project created with a single index view
    h.directory
        .put(&h.project.reference, &ViewSet::new(1, [h.index("A", 1)]))?;
    supervisor
        .handle(ProjectEvent::Created {
            project: h.project.clone(),
        })
        .await?;
    let first = h.snapshot().await?;
    let a1 = first.worker("A").unwrap().worker;
    let a1_store = h.index("A", 1).backing_store_name(&h.project);

    // 2. A revised, B added
    h.directory.put(
        &h.project.reference,
        &ViewSet::new(2, [h.index("A", 2), h.graph("B", 1)]),
    )?;
    let second = h
        .snapshot_until("A revised and B added", |s| {
            s.workers.len() == 2 && s.worker("A").map(|w| w.view.revision()) == Some(2)
        })
        .await?;
    let a2 = second.worker("A").unwrap().worker;
    assert_ne!(a1, a2);
    eventually("A@1 worker to stop", || !h.node.index.is_running(a1)).await?;
    assert_eq!(h.node.graph.running_worker_count(), 1);
    assert_eq!(h.node.delete_calls(), 0);

    // 3. A removed
    h.directory
        .put(&h.project.reference, &ViewSet::new(3, [h.graph("B", 1)]))?;
    let event = cleanups.recv().await?;
    assert!(matches!(&event, CleanupEvent::Completed { view_id, .. } if view_id == "A"));

    let third = h.snapshot().await?;
    assert_eq!(third.workers.len(), 1);
    assert_eq!(
        third.worker("B").unwrap().worker,
        second.worker("B").unwrap().worker
    );
    assert_eq!(h.node.index.running_worker_count(), 0);
    assert!(!h.node.index.has_store(&h.index("A", 2).backing_store_name(&h.project)));
    // Revised away, never removed: the first revision's store is left alone
    assert!(h.node.index.has_store(&a1_store));
    assert_eq!(h.node.index.total_delete_calls(), 1);

    // 4. Project deprecated
    supervisor
        .handle(ProjectEvent::Deprecated {
            project: h.project.clone(),
        })
        .await?;
    eventually("all workers to stop", || h.node.running_workers() == 0).await?;
    assert_eq!(h.node.graph.total_delete_calls(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_malformed_and_removed_entries_are_ignored() -> Result<()> {
    let h = Harness::new().await?;
    h.start([h.index("a", 1)]).await?;
    let before = h.snapshot().await?;

    h.directory.put_raw(
        h.project.reference.to_string(),
        json!({"revision": 9, "views": "nope"}),
    );
    h.directory.remove(&h.project.reference);
    h.directory.put(&h.project.reference, &ViewSet::new(10, []))?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let after = h.snapshot().await?;
    assert_eq!(after.workers, before.workers);
    assert_eq!(h.node.delete_calls(), 0);
    Ok(())
}

/// Index backend panicking the first time it starts a given view
struct CrashOnce {
    inner: InMemoryBackend,
    view_id: String,
    armed: AtomicBool,
}

#[async_trait]
impl ViewBackend for CrashOnce {
    fn kind(&self) -> ViewKind {
        self.inner.kind()
    }

    fn spawn_worker(&self, view: &View, project: &Project) -> WorkerHandle {
        if view.id() == &self.view_id && self.armed.swap(false, Ordering::SeqCst) {
            panic!("index backend crashed starting {}", view.id());
        }
        self.inner.spawn_worker(view, project)
    }

    async fn delete_backing_store(&self, view: &View, project: &Project) -> view_core::Result<()> {
        self.inner.delete_backing_store(view, project).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_crashed_coordinator_recovers_with_remembered_start() -> Result<()> {
    let config = RuntimeConfig::default();
    let index = InMemoryBackend::new(ViewKind::Index);
    let graph = InMemoryBackend::new(ViewKind::Graph);
    let registry = BackendRegistry::new(
        Arc::new(CrashOnce {
            inner: index.clone(),
            view_id: "b".to_string(),
            armed: AtomicBool::new(true),
        }),
        Arc::new(graph.clone()),
    );
    let lifecycle = WorkerLifecycle::new(registry, &config.cleanup, config.coordinator.stop_timeout);
    let directory = Arc::new(InMemoryDirectory::default());
    let cluster = Cluster::new(&config.sharding)?;
    let router = cluster
        .join("node-0", lifecycle, directory, &config.coordinator)
        .await;

    let project = Project::new(ProjectRef::new("acme", "flaky"));
    let views = ViewSet::new(
        1,
        [
            View::from(view_core::IndexView::new("a", 1, project.reference.clone())),
            View::from(view_core::IndexView::new("b", 1, project.reference.clone())),
        ],
    );
    router.route(Envelope::start(project.clone(), views)).await?;

    let mut recovered = None;
    for _ in 0..500 {
        if let Some(snapshot) = router.snapshot(&project.reference).await? {
            if snapshot.workers.len() == 2 {
                recovered = Some(snapshot);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let recovered = recovered.expect("coordinator was not recovered");
    assert!(recovered.is_initialized());
    eventually("crashed incarnation workers to stop", || {
        index.running_worker_count() == 2
    })
    .await?;
    assert_eq!(index.total_delete_calls(), 0);

    router.shutdown().await;
    assert_eq!(index.running_worker_count(), 0);
    Ok(())
}

fn projects(count: usize) -> Vec<Project> {
    (0..count)
        .map(|i| Project::new(ProjectRef::new("acme", format!("project-{}", i))))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_shards_hand_off_on_join_and_leave() -> Result<()> {
    let mut config = RuntimeConfig::default();
    config.sharding.shard_count = 16;
    let h = Harness::with_config(config).await?;
    let projects = projects(24);

    for project in &projects {
        let views = ViewSet::new(
            1,
            [View::from(view_core::IndexView::new("main", 1, project.reference.clone()))],
        );
        h.route(Envelope::start(project.clone(), views)).await?;
    }
    eventually("every project to run on node-0", || {
        h.node.index.running_worker_count() == projects.len()
    })
    .await?;

    // Second node takes over part of the shards
    let second = h.join("node-1").await;
    let moved: Vec<_> = projects
        .iter()
        .filter(|p| h.cluster.owner_of(&p.reference).as_deref() == Some("node-1"))
        .collect();
    assert!(!moved.is_empty());
    assert!(moved.len() < projects.len());

    eventually("moved projects to run on node-1", || {
        second.index.running_worker_count() == moved.len()
    })
    .await?;
    eventually("node-0 to keep the rest", || {
        h.node.index.running_worker_count() == projects.len() - moved.len()
    })
    .await?;

    // Routing through either node reaches the owner
    for project in &moved {
        let snapshot = h
            .node
            .router
            .snapshot(&project.reference)
            .await?
            .expect("moved coordinator running");
        assert!(snapshot.is_initialized());
        assert!(second
            .router
            .local_projects()
            .contains(&project.reference));
    }

    // Second node leaves, its shards come back
    h.cluster.leave("node-1").await;
    assert_eq!(second.index.running_worker_count(), 0);
    eventually("all projects back on node-0", || {
        h.node.index.running_worker_count() == projects.len()
    })
    .await?;
    assert_eq!(h.node.delete_calls() + second.delete_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_routing_failures_are_returned() -> Result<()> {
    let h = Harness::new().await?;
    let second = h.join("node-1").await;
    let remote = projects(64)
        .into_iter()
        .find(|p| h.cluster.owner_of(&p.reference).as_deref() == Some("node-1"))
        .expect("some project owned by node-1");

    // The owning node is gone without leaving the allocation
    drop(second);
    let err = h
        .node
        .router
        .route(Envelope::start(remote.clone(), ViewSet::empty()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NodeUnreachable { ref node_id } if node_id == "node-1"));
    assert!(err.is_retryable());

    // Nobody owns any shard once the last node left
    h.cluster.leave("node-1").await;
    h.cluster.leave("node-0").await;
    let err = h
        .node
        .router
        .route(Envelope::stop(remote.reference.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShardUnavailable { .. }));
    Ok(())
}
