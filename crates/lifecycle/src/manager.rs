//! Worker lifecycle manager
//!
//! Starts and stops view workers on the backend matching the view kind, and
//! hands backing store deletion to the cleanup executor.

use std::sync::Arc;
use std::time::Duration;

use backends::{BackendRegistry, InMemoryBackend, StopCompletion, WorkerHandle};
use tracing::info;
use view_core::config::RetryConfig;
use view_core::{Project, View, ViewKind};

use crate::cleanup::{CleanupExecutor, CleanupTicket};
use crate::retry::RetryStrategy;

/// Starts, stops and cleans up view workers
#[derive(Clone)]
pub struct WorkerLifecycle {
    backends: BackendRegistry,
    cleanup: CleanupExecutor,
}

impl WorkerLifecycle {
    /// Create a lifecycle manager with a cleanup executor built from `retry`
    pub fn new(backends: BackendRegistry, retry: &RetryConfig, stop_timeout: Duration) -> Self {
        let cleanup = CleanupExecutor::new(
            backends.clone(),
            RetryStrategy::from(retry),
            stop_timeout,
            retry.retain_finished,
        );
        Self { backends, cleanup }
    }

    /// Lifecycle manager over fresh in-memory backends, returned alongside it
    pub fn in_memory(
        retry: &RetryConfig,
        stop_timeout: Duration,
    ) -> (Self, InMemoryBackend, InMemoryBackend) {
        let index = InMemoryBackend::new(ViewKind::Index);
        let graph = InMemoryBackend::new(ViewKind::Graph);
        let registry = BackendRegistry::new(Arc::new(index.clone()), Arc::new(graph.clone()));
        (Self::new(registry, retry, stop_timeout), index, graph)
    }

    /// Spawn a worker for `view` under `project`
    pub fn start_worker(&self, view: &View, project: &Project) -> WorkerHandle {
        let handle = self.backends.for_view(view).spawn_worker(view, project);
        info!(
            project = %project.reference,
            view = %view.id(),
            revision = view.revision(),
            kind = %view.kind(),
            worker = %handle.id(),
            "Started view worker"
        );
        handle
    }

    /// Signal a worker to stop; the completion may be awaited or dropped
    pub fn stop_worker(&self, handle: WorkerHandle) -> StopCompletion {
        info!(
            project = %handle.project(),
            view = %handle.view_id(),
            revision = handle.revision(),
            worker = %handle.id(),
            "Stopping view worker"
        );
        handle.stop()
    }

    /// Delete the view's backing store in the background
    pub fn cleanup(&self, view: View, project: Project, after: Option<StopCompletion>) -> CleanupTicket {
        self.cleanup.submit(view, project, after)
    }

    pub fn cleanup_executor(&self) -> &CleanupExecutor {
        &self.cleanup
    }
}
