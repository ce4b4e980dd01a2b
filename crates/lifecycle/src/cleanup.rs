//! Background deletion of backing stores
//!
//! Cleanup requests never block the caller: each one is tracked by a ticket
//! and executed on its own task with the configured retry strategy. Outcomes
//! are published on a broadcast channel; requests that exhaust their retry
//! budget are logged and kept as dead letters until re-submitted.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use backends::{BackendRegistry, StopCompletion};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use uuid::Uuid;
use view_core::{Project, ProjectRef, View, ViewId};

use crate::retry::RetryStrategy;

/// Identifies one cleanup request
pub type CleanupTicket = Uuid;

/// Capacity of the outcome broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Cleanup status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStatus {
    /// Waiting for the stopped worker to finish
    Pending,

    /// Deletion attempts under way
    InProgress,

    /// Store deleted
    Completed,

    /// Retry budget exhausted
    Failed,
}

impl CleanupStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, CleanupStatus::Completed | CleanupStatus::Failed)
    }
}

/// Tracked state of a cleanup request
#[derive(Debug, Clone)]
pub struct CleanupRecord {
    pub ticket: CleanupTicket,
    pub project: ProjectRef,
    pub view_id: ViewId,
    pub store: String,
    pub status: CleanupStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Outcome published for every finished cleanup
#[derive(Debug, Clone)]
pub enum CleanupEvent {
    Completed {
        ticket: CleanupTicket,
        project: ProjectRef,
        view_id: ViewId,
        store: String,
        attempts: u32,
    },
    Exhausted {
        ticket: CleanupTicket,
        project: ProjectRef,
        view_id: ViewId,
        store: String,
        attempts: u32,
        error: String,
    },
}

impl CleanupEvent {
    pub fn ticket(&self) -> CleanupTicket {
        match self {
            CleanupEvent::Completed { ticket, .. } | CleanupEvent::Exhausted { ticket, .. } => {
                *ticket
            }
        }
    }

    pub fn view_id(&self) -> &ViewId {
        match self {
            CleanupEvent::Completed { view_id, .. } | CleanupEvent::Exhausted { view_id, .. } => {
                view_id
            }
        }
    }
}

/// A cleanup whose retry budget ran out
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub ticket: CleanupTicket,
    pub view: View,
    pub project: Project,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

struct ExecutorInner {
    backends: BackendRegistry,
    strategy: RetryStrategy,
    stop_timeout: Duration,
    records: DashMap<CleanupTicket, CleanupRecord>,
    retain_finished: usize,
    /// Finished tickets, oldest first
    finished: Mutex<VecDeque<CleanupTicket>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    events: broadcast::Sender<CleanupEvent>,
}

/// Executes cleanup requests in the background
#[derive(Clone)]
pub struct CleanupExecutor {
    inner: Arc<ExecutorInner>,
}

impl CleanupExecutor {
    /// Create an executor
    ///
    /// # Arguments
    /// * `backends` - Backends owning the stores to delete
    /// * `strategy` - Retry policy applied to every deletion
    /// * `stop_timeout` - How long to wait for a stopped worker before deleting
    /// * `retain_finished` - Finished records kept for status queries
    pub fn new(
        backends: BackendRegistry,
        strategy: RetryStrategy,
        stop_timeout: Duration,
        retain_finished: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ExecutorInner {
                backends,
                strategy,
                stop_timeout,
                records: DashMap::new(),
                retain_finished,
                finished: Mutex::new(VecDeque::new()),
                dead_letters: Mutex::new(Vec::new()),
                events,
            }),
        }
    }

    /// Queue deletion of a view's backing store and return immediately.
    ///
    /// When `after` is given, deletion starts once that worker stopped (or the
    /// stop timeout elapsed).
    pub fn submit(&self, view: View, project: Project, after: Option<StopCompletion>) -> CleanupTicket {
        let ticket = Uuid::new_v4();
        let store = view.backing_store_name(&project);

        self.inner.records.insert(
            ticket,
            CleanupRecord {
                ticket,
                project: project.reference.clone(),
                view_id: view.id().clone(),
                store: store.clone(),
                status: CleanupStatus::Pending,
                attempts: 0,
                error: None,
                submitted_at: Utc::now(),
                finished_at: None,
            },
        );

        debug!(
            ticket = %ticket,
            project = %project.reference,
            view = %view.id(),
            store = %store,
            "Queued backing store cleanup"
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Some(stop) = after {
                stop.wait_timeout(inner.stop_timeout).await;
            }
            inner.run(ticket, view, project, store).await;
        });

        ticket
    }

    /// Subscribe to cleanup outcomes
    pub fn subscribe(&self) -> broadcast::Receiver<CleanupEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self, ticket: CleanupTicket) -> Option<CleanupRecord> {
        self.inner.records.get(&ticket).map(|r| r.clone())
    }

    /// All tracked requests
    pub fn records(&self) -> Vec<CleanupRecord> {
        self.inner
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Requests not finished yet
    pub fn in_flight(&self) -> usize {
        self.inner
            .records
            .iter()
            .filter(|entry| !entry.value().status.is_finished())
            .count()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().clone()
    }

    /// Re-submit every dead letter with a fresh retry budget
    pub fn retry_dead_letters(&self) -> Vec<CleanupTicket> {
        let letters = std::mem::take(&mut *self.inner.dead_letters.lock());
        if !letters.is_empty() {
            info!(count = letters.len(), "Re-submitting exhausted cleanups");
        }
        letters
            .into_iter()
            .map(|letter| self.submit(letter.view, letter.project, None))
            .collect()
    }

    /// Forget finished requests, returns how many were removed
    pub fn prune_finished(&self) -> usize {
        self.inner.finished.lock().clear();
        let before = self.inner.records.len();
        self.inner
            .records
            .retain(|_, record| !record.status.is_finished());
        before - self.inner.records.len()
    }
}

impl ExecutorInner {
    async fn run(&self, ticket: CleanupTicket, view: View, project: Project, store: String) {
        self.update(ticket, |r| r.status = CleanupStatus::InProgress);

        let backend = self.backends.for_view(&view);
        let result = self
            .strategy
            .retry("delete backing store", |attempt| {
                self.update(ticket, |r| r.attempts = attempt);
                backend.delete_backing_store(&view, &project)
            })
            .await;

        match result {
            Ok(done) => {
                self.update(ticket, |r| {
                    r.status = CleanupStatus::Completed;
                    r.finished_at = Some(Utc::now());
                });
                self.finish(ticket);
                info!(
                    ticket = %ticket,
                    project = %project.reference,
                    view = %view.id(),
                    store = %store,
                    attempts = done.attempts,
                    "Backing store cleanup completed"
                );
                let _ = self.events.send(CleanupEvent::Completed {
                    ticket,
                    project: project.reference.clone(),
                    view_id: view.id().clone(),
                    store,
                    attempts: done.attempts,
                });
            }
            Err(exhausted) => {
                let message = exhausted.last_error.to_string();
                self.update(ticket, |r| {
                    r.status = CleanupStatus::Failed;
                    r.error = Some(message.clone());
                    r.finished_at = Some(Utc::now());
                });
                self.finish(ticket);
                error!(
                    ticket = %ticket,
                    project = %project.reference,
                    view = %view.id(),
                    store = %store,
                    attempts = exhausted.attempts,
                    error = %message,
                    "Backing store cleanup exhausted its retry budget"
                );
                let event = CleanupEvent::Exhausted {
                    ticket,
                    project: project.reference.clone(),
                    view_id: view.id().clone(),
                    store,
                    attempts: exhausted.attempts,
                    error: message.clone(),
                };
                self.dead_letters.lock().push(DeadLetter {
                    ticket,
                    view,
                    project,
                    attempts: exhausted.attempts,
                    error: message,
                    failed_at: Utc::now(),
                });
                let _ = self.events.send(event);
            }
        }
    }

    /// Track a finished ticket, evicting the oldest finished records past the
    /// retention bound
    fn finish(&self, ticket: CleanupTicket) {
        let mut finished = self.finished.lock();
        finished.push_back(ticket);
        while finished.len() > self.retain_finished {
            if let Some(evicted) = finished.pop_front() {
                self.records.remove(&evicted);
            }
        }
    }

    fn update(&self, ticket: CleanupTicket, f: impl FnOnce(&mut CleanupRecord)) {
        if let Some(mut record) = self.records.get_mut(&ticket) {
            f(record.value_mut());
        }
    }
}
