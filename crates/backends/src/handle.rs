//! Handles to running view workers

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;
use view_core::{Project, ProjectRef, Revision, View, ViewId, ViewKind};

/// Passed to a worker body when it is spawned
pub struct WorkerContext {
    /// Identifier of the worker being spawned
    pub worker: Uuid,

    /// Resolves once the worker is asked to stop
    pub shutdown: ShutdownSignal,
}

/// Stop signal observed by a running worker
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait until stop is requested or the handle is gone
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Owned reference to a running worker bound to one view revision and one
/// project revision.
///
/// Not `Clone`: exactly one owner decides when the worker stops. Dropping the
/// handle asks the worker to stop as well.
#[derive(Debug)]
pub struct WorkerHandle {
    id: Uuid,
    kind: ViewKind,
    view_id: ViewId,
    revision: Revision,
    project: ProjectRef,
    project_revision: Revision,
    started_at: DateTime<Utc>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn a worker body on the current tokio runtime.
    ///
    /// `body` runs synchronously to build the worker future, which is then spawned.
    pub fn spawn<F, Fut>(view: &View, project: &Project, body: F) -> Self
    where
        F: FnOnce(WorkerContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (shutdown, rx) = watch::channel(false);
        let worker = body(WorkerContext {
            worker: id,
            shutdown: ShutdownSignal { rx },
        });

        Self {
            id,
            kind: view.kind(),
            view_id: view.id().clone(),
            revision: view.revision(),
            project: project.reference.clone(),
            project_revision: project.revision,
            started_at: Utc::now(),
            shutdown,
            task: Some(tokio::spawn(worker)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn view_id(&self) -> &ViewId {
        &self.view_id
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn project(&self) -> &ProjectRef {
        &self.project
    }

    pub fn project_revision(&self) -> Revision {
        self.project_revision
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// True once the worker task has returned
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Ask the worker to stop and release the handle without waiting.
    pub fn stop(mut self) -> StopCompletion {
        self.shutdown.send_replace(true);
        StopCompletion {
            worker: self.id,
            task: self.task.take(),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Completion of a stop request; may be awaited or dropped.
#[derive(Debug)]
pub struct StopCompletion {
    worker: Uuid,
    task: Option<JoinHandle<()>>,
}

impl StopCompletion {
    pub fn worker(&self) -> Uuid {
        self.worker
    }

    /// Wait for the worker task to return
    pub async fn wait(self) {
        if let Some(task) = self.task {
            if let Err(e) = task.await {
                warn!(worker = %self.worker, error = %e, "Worker ended abnormally");
            }
        }
    }

    /// Wait at most `timeout`; returns false if the worker was still running
    pub async fn wait_timeout(self, timeout: Duration) -> bool {
        let worker = self.worker;
        let finished = tokio::time::timeout(timeout, self.wait()).await.is_ok();
        if !finished {
            warn!(worker = %worker, timeout_ms = timeout.as_millis() as u64, "Worker did not stop in time");
        }
        finished
    }
}
