//! In-memory backend
//!
//! Keeps named stores and running workers in memory. Used by the binary when
//! no real backend is wired in, and by tests to observe what the coordinator
//! started, stopped and deleted.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use view_core::{Error, Project, ProjectRef, Result, Revision, View, ViewId, ViewKind};

use crate::{ViewBackend, WorkerHandle};

/// A store created by a worker
#[derive(Debug, Clone)]
pub struct StoreInfo {
    pub name: String,
    pub view_id: ViewId,
    pub revision: Revision,
    pub project: ProjectRef,
    pub created_at: DateTime<Utc>,
}

/// A worker currently running
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub worker: Uuid,
    pub view_id: ViewId,
    pub revision: Revision,
    pub project: ProjectRef,
    pub project_revision: Revision,
    pub store: String,
}

/// Everything the backend was asked to do, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    WorkerStarted { worker: Uuid, view_id: ViewId, revision: Revision },
    WorkerStopped { worker: Uuid, view_id: ViewId, revision: Revision },
    StoreDeleted { store: String },
    DeleteFailed { store: String },
}

#[derive(Debug, Default)]
struct Inner {
    stores: DashMap<String, StoreInfo>,
    workers: DashMap<Uuid, WorkerRecord>,
    delete_calls: DashMap<String, u32>,
    failing_deletes: AtomicU32,
    started: AtomicU64,
    stopped: AtomicU64,
    events: Mutex<Vec<BackendEvent>>,
}

impl Inner {
    fn record(&self, event: BackendEvent) {
        self.events.lock().push(event);
    }
}

/// In-memory backend for one view kind
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    kind: ViewKind,
    inner: Arc<Inner>,
}

impl InMemoryBackend {
    pub fn new(kind: ViewKind) -> Self {
        Self {
            kind,
            inner: Arc::new(Inner::default()),
        }
    }

    /// Make the next `count` deletions fail
    pub fn fail_next_deletes(&self, count: u32) {
        self.inner.failing_deletes.store(count, Ordering::SeqCst);
    }

    pub fn running_workers(&self) -> Vec<WorkerRecord> {
        self.inner
            .workers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn running_worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    pub fn is_running(&self, worker: Uuid) -> bool {
        self.inner.workers.contains_key(&worker)
    }

    pub fn stores(&self) -> Vec<StoreInfo> {
        self.inner
            .stores
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn has_store(&self, name: &str) -> bool {
        self.inner.stores.contains_key(name)
    }

    /// Number of deletion attempts for a store
    pub fn delete_calls(&self, store: &str) -> u32 {
        self.inner.delete_calls.get(store).map_or(0, |c| *c)
    }

    /// Number of deletion attempts across all stores
    pub fn total_delete_calls(&self) -> u32 {
        self.inner.delete_calls.iter().map(|c| *c.value()).sum()
    }

    pub fn started_count(&self) -> u64 {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn stopped_count(&self) -> u64 {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<BackendEvent> {
        self.inner.events.lock().clone()
    }
}

#[async_trait]
impl ViewBackend for InMemoryBackend {
    fn kind(&self) -> ViewKind {
        self.kind
    }

    fn spawn_worker(&self, view: &View, project: &Project) -> WorkerHandle {
        let store = view.backing_store_name(project);
        let inner = Arc::clone(&self.inner);
        let view_id = view.id().clone();
        let revision = view.revision();

        WorkerHandle::spawn(view, project, |mut ctx| {
            inner.stores.entry(store.clone()).or_insert_with(|| StoreInfo {
                name: store.clone(),
                view_id: view_id.clone(),
                revision,
                project: project.reference.clone(),
                created_at: Utc::now(),
            });
            inner.workers.insert(
                ctx.worker,
                WorkerRecord {
                    worker: ctx.worker,
                    view_id: view_id.clone(),
                    revision,
                    project: project.reference.clone(),
                    project_revision: project.revision,
                    store: store.clone(),
                },
            );
            inner.started.fetch_add(1, Ordering::SeqCst);
            inner.record(BackendEvent::WorkerStarted {
                worker: ctx.worker,
                view_id: view_id.clone(),
                revision,
            });
            debug!(worker = %ctx.worker, store = %store, "Worker started");

            async move {
                ctx.shutdown.wait().await;
                inner.workers.remove(&ctx.worker);
                inner.stopped.fetch_add(1, Ordering::SeqCst);
                inner.record(BackendEvent::WorkerStopped {
                    worker: ctx.worker,
                    view_id,
                    revision,
                });
                debug!(worker = %ctx.worker, store = %store, "Worker stopped");
            }
        })
    }

    #[instrument(skip(self, view, project), fields(backend = %self.kind, view = %view.id()))]
    async fn delete_backing_store(&self, view: &View, project: &Project) -> Result<()> {
        let store = view.backing_store_name(project);
        *self.inner.delete_calls.entry(store.clone()).or_insert(0) += 1;

        let failing = self
            .inner
            .failing_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.inner.record(BackendEvent::DeleteFailed { store: store.clone() });
            return Err(Error::backend(
                self.kind.to_string(),
                format!("failed to delete {}", store),
            ));
        }

        self.inner.stores.remove(&store);
        self.inner.record(BackendEvent::StoreDeleted { store: store.clone() });
        info!(store = %store, "Backing store deleted");
        Ok(())
    }
}
