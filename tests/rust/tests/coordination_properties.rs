//! Coordinator behavior through the shard router
//!
//! Each test drives one project through a single node cluster backed by
//! in-memory index and graph backends.

mod common;

use anyhow::Result;
use async_trait::async_trait;
use backends::{BackendEvent, BackendRegistry, InMemoryBackend, ViewBackend, WorkerHandle};
use common::{eventually, Harness};
use coordinator::{Cluster, Envelope, InMemoryDirectory};
use lifecycle::{CleanupEvent, WorkerLifecycle};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use view_core::{IndexView, Project, ProjectRef, RuntimeConfig, View, ViewKind, ViewSet};

fn ids(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

#[tokio::test]
async fn test_start_runs_initial_views() -> Result<()> {
    let h = Harness::new().await?;
    h.start([h.index("a", 1), h.graph("b", 1), h.index("c", 3)]).await?;

    let snapshot = h.snapshot().await?;
    assert!(snapshot.is_initialized());
    assert_eq!(snapshot.view_ids(), ids(&["a", "b", "c"]));
    assert_eq!(h.node.index.running_worker_count(), 2);
    assert_eq!(h.node.graph.running_worker_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_unchanged_views_keep_workers() -> Result<()> {
    let h = Harness::new().await?;
    h.start([h.index("a", 1), h.graph("b", 1)]).await?;
    let before = h.snapshot().await?;

    h.change_views(2, [h.index("a", 1), h.graph("b", 1)]).await?;
    let after = h.snapshot().await?;

    assert_eq!(after.workers, before.workers);
    assert_eq!(h.node.index.started_count(), 1);
    assert_eq!(h.node.graph.started_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_index_revision_restarts_without_cleanup() -> Result<()> {
    let h = Harness::new().await?;
    h.start([h.index("a", 1)]).await?;
    let old = h.snapshot().await?.worker("a").unwrap().worker;

    h.change_views(2, [h.index("a", 2)]).await?;
    let snapshot = h.snapshot().await?;
    let new = snapshot.worker("a").unwrap();

    assert_ne!(new.worker, old);
    assert_eq!(new.view.revision(), 2);
    assert_eq!(h.node.index.started_count(), 2);
    eventually("old worker to stop", || !h.node.index.is_running(old)).await?;
    assert!(h.node.index.is_running(new.worker));

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.node.delete_calls(), 0);
    assert!(h.node.lifecycle.cleanup_executor().records().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_graph_revision_keeps_worker() -> Result<()> {
    let h = Harness::new().await?;
    h.start([h.graph("g", 1)]).await?;
    let before = h.snapshot().await?;

    h.change_views(2, [h.graph("g", 2)]).await?;
    let after = h.snapshot().await?;

    assert_eq!(after.workers, before.workers);
    assert_eq!(h.node.graph.started_count(), 1);
    assert_eq!(h.node.graph.stopped_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_removed_view_is_cleaned_up_once() -> Result<()> {
    let h = Harness::new().await?;
    let mut events = h.node.lifecycle.cleanup_executor().subscribe();
    h.start([h.index("a", 1), h.graph("b", 1)]).await?;
    let store = h.index("a", 1).backing_store_name(&h.project);
    let worker = h.snapshot().await?.worker("a").unwrap().worker;

    h.change_views(2, [h.graph("b", 1)]).await?;
    assert_eq!(h.snapshot().await?.view_ids(), ids(&["b"]));

    let event = events.recv().await?;
    assert!(matches!(event, CleanupEvent::Completed { attempts: 1, .. }));
    assert_eq!(event.view_id(), "a");
    assert!(!h.node.index.is_running(worker));
    assert!(!h.node.index.has_store(&store));

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(h.node.index.delete_calls(&store), 1);
    assert_eq!(h.node.graph.total_delete_calls(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_retries_until_success() -> Result<()> {
    let h = Harness::new().await?;
    let mut events = h.node.lifecycle.cleanup_executor().subscribe();
    h.start([h.index("a", 1), h.index("b", 1)]).await?;
    let store = h.index("a", 1).backing_store_name(&h.project);

    h.node.index.fail_next_deletes(3);
    h.change_views(2, [h.index("b", 1)]).await?;

    match events.recv().await? {
        CleanupEvent::Completed { attempts, store: deleted, .. } => {
            assert_eq!(attempts, 4);
            assert_eq!(deleted, store);
        }
        other => panic!("unexpected cleanup outcome: {:?}", other),
    }
    assert_eq!(h.node.index.delete_calls(&store), 4);
    assert!(!h.node.index.has_store(&store));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_budget_is_bounded() -> Result<()> {
    let h = Harness::new().await?;
    let executor = h.node.lifecycle.cleanup_executor().clone();
    let mut events = executor.subscribe();
    h.start([h.index("a", 1)]).await?;
    let store = h.index("a", 1).backing_store_name(&h.project);

    h.node.index.fail_next_deletes(u32::MAX);
    h.change_views(2, [h.graph("b", 1)]).await?;

    let event = events.recv().await?;
    assert!(matches!(event, CleanupEvent::Exhausted { attempts: 10, .. }));
    assert_eq!(h.node.index.delete_calls(&store), 10);
    assert_eq!(executor.dead_letters().len(), 1);

    h.node.index.fail_next_deletes(0);
    executor.retry_dead_letters();
    assert!(matches!(events.recv().await?, CleanupEvent::Completed { .. }));
    assert!(!h.node.index.has_store(&store));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_project_change_rebinds_workers() -> Result<()> {
    let h = Harness::new().await?;
    h.start([h.index("a", 1), h.graph("b", 1)]).await?;
    let before = h.snapshot().await?;

    let renamed = h.project.relabel("Catalog");
    h.route(Envelope::project_changes(renamed.clone())).await?;
    let after = h.snapshot().await?;

    assert_eq!(after.view_ids(), before.view_ids());
    assert_eq!(after.bound.as_ref().map(|p| p.revision), Some(renamed.revision));
    for (id, summary) in &after.workers {
        assert_eq!(summary.project_revision, renamed.revision);
        assert_ne!(summary.worker, before.worker(id).unwrap().worker);
    }

    let running: Vec<_> = h
        .node
        .index
        .running_workers()
        .into_iter()
        .chain(h.node.graph.running_workers())
        .collect();
    assert_eq!(running.len(), 2);
    assert!(running.iter().all(|w| w.project_revision == renamed.revision));

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.node.delete_calls(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stop_terminates_without_cleanup() -> Result<()> {
    let h = Harness::new().await?;
    h.start([h.index("a", 1), h.graph("b", 1)]).await?;
    h.snapshot().await?;
    assert_eq!(h.node.running_workers(), 2);

    h.route(Envelope::stop(h.project.reference.clone())).await?;
    eventually("workers to stop", || h.node.running_workers() == 0).await?;
    eventually("coordinator to terminate", || h.node.router.coordinator_count() == 0).await?;

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.node.delete_calls(), 0);
    assert!(h.node.lifecycle.cleanup_executor().records().is_empty());
    assert!(h.cluster.remembered(&h.project.reference).is_none());
    Ok(())
}

#[tokio::test]
async fn test_commands_before_start_are_replayed() -> Result<()> {
    let h = Harness::new().await?;
    h.change_views(2, [h.index("a", 1), h.graph("b", 1)]).await?;

    let waiting = h.snapshot().await?;
    assert!(!waiting.is_initialized());
    assert_eq!(waiting.stashed, 1);
    assert_eq!(h.node.running_workers(), 0);

    h.start([h.index("a", 1)]).await?;
    let snapshot = h.snapshot().await?;
    assert_eq!(snapshot.view_ids(), ids(&["a", "b"]));
    assert_eq!(snapshot.stashed, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop_uses_fresh_coordinator() -> Result<()> {
    let h = Harness::new().await?;
    h.start([h.index("a", 1)]).await?;
    h.route(Envelope::stop(h.project.reference.clone())).await?;
    h.start([h.index("a", 1), h.graph("b", 1)]).await?;

    let snapshot = h
        .snapshot_until("restarted coordinator", |s| s.workers.len() == 2)
        .await?;
    assert_eq!(snapshot.view_ids(), ids(&["a", "b"]));
    assert_eq!(h.node.running_workers(), 2);

    // The first incarnation's worker is gone before the second one starts any
    let lifecycle: Vec<_> = h
        .node
        .index
        .events()
        .into_iter()
        .filter_map(|event| match event {
            BackendEvent::WorkerStarted { worker, view_id, .. } if view_id == "a" => Some((true, worker)),
            BackendEvent::WorkerStopped { worker, view_id, .. } if view_id == "a" => Some((false, worker)),
            _ => None,
        })
        .collect();
    assert_eq!(lifecycle.len(), 3, "unexpected worker events {:?}", lifecycle);
    let (first, restarted) = (lifecycle[0].1, lifecycle[2].1);
    assert_eq!(lifecycle, vec![(true, first), (false, first), (true, restarted)]);
    assert_ne!(first, restarted);
    assert_eq!(snapshot.worker("a").map(|w| w.worker), Some(restarted));
    Ok(())
}

/// Index backend whose workers linger after being asked to stop
#[derive(Clone, Default)]
struct LingeringBackend {
    live: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl ViewBackend for LingeringBackend {
    fn kind(&self) -> ViewKind {
        ViewKind::Index
    }

    fn spawn_worker(&self, view: &View, project: &Project) -> WorkerHandle {
        let live = Arc::clone(&self.live);
        let peak = Arc::clone(&self.peak);
        WorkerHandle::spawn(view, project, move |mut ctx| {
            let now = live.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            async move {
                ctx.shutdown.wait().await;
                tokio::time::sleep(Duration::from_millis(200)).await;
                live.fetch_sub(1, Ordering::SeqCst);
            }
        })
    }

    async fn delete_backing_store(&self, _view: &View, _project: &Project) -> view_core::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_next_incarnation_waits_for_slow_stop() -> Result<()> {
    let config = RuntimeConfig::default();
    let backend = LingeringBackend::default();
    let registry = BackendRegistry::new(
        Arc::new(backend.clone()),
        Arc::new(InMemoryBackend::new(ViewKind::Graph)),
    );
    let lifecycle = WorkerLifecycle::new(registry, &config.cleanup, config.coordinator.stop_timeout);
    let cluster = Cluster::new(&config.sharding)?;
    let directory = Arc::new(InMemoryDirectory::new(config.directory.notification_buffer));
    let router = cluster
        .join("node-0", lifecycle, directory, &config.coordinator)
        .await;

    let project = Project::new(ProjectRef::new("acme", "catalog"));
    let views = || ViewSet::new(1, [View::from(IndexView::new("a", 1, project.reference.clone()))]);
    router.route(Envelope::start(project.clone(), views())).await?;
    router.route(Envelope::stop(project.reference.clone())).await?;
    router.route(Envelope::start(project.clone(), views())).await?;

    let mut restarted = false;
    for _ in 0..500 {
        let snapshot = router.snapshot(&project.reference).await?;
        if snapshot.map_or(false, |s| s.workers.len() == 1) && backend.live.load(Ordering::SeqCst) == 1 {
            restarted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(restarted, "second incarnation never started its worker");
    assert_eq!(backend.peak.load(Ordering::SeqCst), 1);
    Ok(())
}
