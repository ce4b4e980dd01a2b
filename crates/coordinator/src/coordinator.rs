//! Per project coordinator
//!
//! One tokio task per project owns the project's running workers and applies
//! its mailbox in arrival order. Until `Start` binds it to a project every
//! other command is stashed and replayed afterwards.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use backends::{StopCompletion, WorkerHandle};
use lifecycle::WorkerLifecycle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use view_core::config::CoordinatorConfig;
use view_core::{Project, ProjectRef, View, ViewId, ViewSet};

use crate::directory::ViewDirectory;
use crate::messages::{CoordinatorCommand, CoordinatorSnapshot, Message, WorkerSummary};
use crate::reconcile::reconcile;
use crate::translator::ViewChanges;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Terminate,
}

/// A worker and the view it runs
struct Running {
    view: View,
    handle: WorkerHandle,
}

/// A coordinator bound to its project
struct Active {
    project: Project,
    workers: HashMap<ViewId, Running>,
}

enum State {
    Uninitialized,
    Initialized(Active),
}

pub(crate) struct ProjectCoordinator {
    reference: ProjectRef,
    state: State,
    stash: VecDeque<CoordinatorCommand>,
    stash_capacity: usize,
    stop_timeout: Duration,
    lifecycle: WorkerLifecycle,
    directory: Arc<dyn ViewDirectory>,
    mailbox: mpsc::WeakSender<Message>,
    subscription: Option<JoinHandle<()>>,
}

impl ProjectCoordinator {
    /// Spawn a coordinator task for `reference`, returning its mailbox.
    ///
    /// With a `predecessor`, nothing is applied until that incarnation of the
    /// project reports termination.
    pub(crate) fn spawn(
        reference: ProjectRef,
        lifecycle: WorkerLifecycle,
        directory: Arc<dyn ViewDirectory>,
        config: &CoordinatorConfig,
        predecessor: Option<watch::Receiver<bool>>,
    ) -> (mpsc::Sender<Message>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let coordinator = Self {
            reference,
            state: State::Uninitialized,
            stash: VecDeque::new(),
            stash_capacity: config.stash_capacity.max(1),
            stop_timeout: config.stop_timeout,
            lifecycle,
            directory,
            mailbox: tx.downgrade(),
            subscription: None,
        };
        (tx, tokio::spawn(coordinator.run(rx, predecessor)))
    }

    async fn run(
        mut self,
        mut mailbox: mpsc::Receiver<Message>,
        predecessor: Option<watch::Receiver<bool>>,
    ) {
        if let Some(mut previous) = predecessor {
            if !*previous.borrow() {
                debug!(project = %self.reference, "Waiting for previous incarnation to terminate");
            }
            // Closed means the previous supervisor is gone, which happens after termination
            let _ = previous.wait_for(|done| *done).await;
        }
        debug!(project = %self.reference, "Coordinator started");

        while let Some(message) = mailbox.recv().await {
            let flow = match message {
                Message::Command(command) => self.handle(command).await,
                Message::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                    Flow::Continue
                }
                Message::Passivate => {
                    debug!(project = %self.reference, "Coordinator passivating");
                    Flow::Terminate
                }
            };
            if flow == Flow::Terminate || self.replay().await == Flow::Terminate {
                break;
            }
        }

        // Senders racing with termination get an error and reach a new incarnation
        mailbox.close();
        self.terminate().await;
        debug!(project = %self.reference, "Coordinator terminated");
    }

    async fn handle(&mut self, command: CoordinatorCommand) -> Flow {
        let initialized = matches!(self.state, State::Initialized(_));
        match (initialized, command) {
            (false, CoordinatorCommand::Start { project, views }) => {
                self.initialize(project, views);
                Flow::Continue
            }
            (false, CoordinatorCommand::Stop) => {
                debug!(project = %self.reference, "Stopped before start");
                Flow::Terminate
            }
            (false, command) => {
                self.stash_command(command);
                Flow::Continue
            }
            (true, CoordinatorCommand::Start { .. }) => {
                warn!(project = %self.reference, "Coordinator already started, start ignored");
                Flow::Continue
            }
            (true, CoordinatorCommand::ViewsChanges { views }) => {
                self.apply_views(views);
                Flow::Continue
            }
            (true, CoordinatorCommand::ProjectChanges { project }) => {
                self.apply_project(project).await;
                Flow::Continue
            }
            (true, CoordinatorCommand::Stop) => {
                info!(project = %self.reference, "Stopping project coordinator");
                Flow::Terminate
            }
        }
    }

    /// Apply stashed commands once started
    async fn replay(&mut self) -> Flow {
        while matches!(self.state, State::Initialized(_)) {
            let Some(command) = self.stash.pop_front() else {
                break;
            };
            debug!(project = %self.reference, command = command.name(), "Replaying stashed command");
            if self.handle(command).await == Flow::Terminate {
                return Flow::Terminate;
            }
        }
        Flow::Continue
    }

    fn stash_command(&mut self, command: CoordinatorCommand) {
        if self.stash.len() >= self.stash_capacity {
            let obsolete = oldest_superseded(&self.stash, &command, is_views_changes)
                .or_else(|| oldest_superseded(&self.stash, &command, is_project_changes));
            match obsolete.and_then(|index| self.stash.remove(index)) {
                Some(discarded) => warn!(
                    project = %self.reference,
                    capacity = self.stash_capacity,
                    discarded = discarded.name(),
                    "Stash full, superseded command discarded"
                ),
                None => warn!(
                    project = %self.reference,
                    capacity = self.stash_capacity,
                    "Stash full without superseded commands, keeping command"
                ),
            }
        }
        debug!(project = %self.reference, command = command.name(), "Stashing command until start");
        self.stash.push_back(command);
    }

    fn initialize(&mut self, project: Project, views: ViewSet) {
        if project.reference != self.reference {
            warn!(
                project = %self.reference,
                received = %project.reference,
                "Start for another project ignored"
            );
            return;
        }

        self.subscription = Some(self.subscribe());

        let mut workers = HashMap::with_capacity(views.len());
        for view in views {
            let handle = self.lifecycle.start_worker(&view, &project);
            workers.insert(view.id().clone(), Running { view, handle });
        }

        info!(
            project = %self.reference,
            revision = project.revision,
            workers = workers.len(),
            "Project coordinator started"
        );
        self.state = State::Initialized(Active { project, workers });
    }

    /// Forward desired view sets from the directory into this mailbox
    fn subscribe(&self) -> JoinHandle<()> {
        let mut changes = ViewChanges::subscribe(self.directory.as_ref(), self.reference.clone());
        let mailbox = self.mailbox.clone();
        let project = self.reference.clone();

        tokio::spawn(async move {
            while let Some(views) = changes.next().await {
                let Some(tx) = mailbox.upgrade() else {
                    break;
                };
                let command = CoordinatorCommand::ViewsChanges { views };
                if tx.send(Message::Command(command)).await.is_err() {
                    break;
                }
            }
            debug!(project = %project, "Directory subscription ended");
        })
    }

    fn apply_views(&mut self, desired: ViewSet) {
        let State::Initialized(active) = &mut self.state else {
            return;
        };

        let plan = reconcile(active.workers.values().map(|r| &r.view), &desired);
        if plan.is_empty() {
            debug!(project = %self.reference, revision = desired.revision(), "Views unchanged");
            return;
        }
        info!(
            project = %self.reference,
            revision = desired.revision(),
            start = plan.start.len(),
            restart = plan.restart.len(),
            stop = plan.stop.len(),
            "Reconciling views"
        );

        for view in plan.start {
            let handle = self.lifecycle.start_worker(&view, &active.project);
            active.workers.insert(view.id().clone(), Running { view, handle });
        }

        for (old, new) in plan.restart {
            let handle = self.lifecycle.start_worker(&new, &active.project);
            if let Some(previous) = active
                .workers
                .insert(new.id().clone(), Running { view: new, handle })
            {
                debug!(
                    project = %self.reference,
                    view = %old.id(),
                    from = old.revision(),
                    "Replacing revised view worker"
                );
                let _ = self.lifecycle.stop_worker(previous.handle);
            }
        }

        for view in plan.stop {
            if let Some(removed) = active.workers.remove(view.id()) {
                let stopped = self.lifecycle.stop_worker(removed.handle);
                self.lifecycle
                    .cleanup(removed.view, active.project.clone(), Some(stopped));
            }
        }
    }

    async fn apply_project(&mut self, project: Project) {
        let State::Initialized(active) = &mut self.state else {
            return;
        };
        if project.reference != active.project.reference {
            warn!(
                project = %self.reference,
                received = %project.reference,
                "Project change for another project ignored"
            );
            return;
        }

        info!(
            project = %self.reference,
            from = active.project.revision,
            to = project.revision,
            workers = active.workers.len(),
            "Project changed, restarting workers"
        );

        let mut views = Vec::with_capacity(active.workers.len());
        let mut completions = Vec::with_capacity(active.workers.len());
        for (_, running) in active.workers.drain() {
            completions.push(self.lifecycle.stop_worker(running.handle));
            views.push(running.view);
        }
        await_stops(completions, self.stop_timeout, &self.reference).await;

        active.project = project;
        for view in views {
            let handle = self.lifecycle.start_worker(&view, &active.project);
            active.workers.insert(view.id().clone(), Running { view, handle });
        }
    }

    /// Stop every worker without cleanup and drop the directory subscription
    async fn terminate(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.abort();
        }
        if !self.stash.is_empty() {
            debug!(project = %self.reference, dropped = self.stash.len(), "Dropping stashed commands");
            self.stash.clear();
        }

        let state = std::mem::replace(&mut self.state, State::Uninitialized);
        if let State::Initialized(active) = state {
            let completions: Vec<_> = active
                .workers
                .into_values()
                .map(|running| self.lifecycle.stop_worker(running.handle))
                .collect();
            await_stops(completions, self.stop_timeout, &self.reference).await;
        }
    }

    fn snapshot(&self) -> CoordinatorSnapshot {
        let (bound, workers) = match &self.state {
            State::Uninitialized => (None, Default::default()),
            State::Initialized(active) => (
                Some(active.project.clone()),
                active
                    .workers
                    .iter()
                    .map(|(id, running)| {
                        (
                            id.clone(),
                            WorkerSummary {
                                worker: running.handle.id(),
                                view: running.view.clone(),
                                project_revision: running.handle.project_revision(),
                            },
                        )
                    })
                    .collect(),
            ),
        };
        CoordinatorSnapshot {
            project: self.reference.clone(),
            bound,
            workers,
            stashed: self.stash.len(),
        }
    }
}

impl Drop for ProjectCoordinator {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.abort();
        }
    }
}

fn is_views_changes(command: &CoordinatorCommand) -> bool {
    matches!(command, CoordinatorCommand::ViewsChanges { .. })
}

fn is_project_changes(command: &CoordinatorCommand) -> bool {
    matches!(command, CoordinatorCommand::ProjectChanges { .. })
}

/// Position of the oldest stashed command of a kind when a later one of the
/// same kind, stashed or `incoming`, replaces it
fn oldest_superseded(
    stash: &VecDeque<CoordinatorCommand>,
    incoming: &CoordinatorCommand,
    kind: fn(&CoordinatorCommand) -> bool,
) -> Option<usize> {
    let oldest = stash.iter().position(kind)?;
    let replaced = kind(incoming) || stash.iter().skip(oldest + 1).any(kind);
    replaced.then_some(oldest)
}

/// Wait for stopped workers, all of them within one `timeout`
async fn await_stops(completions: Vec<StopCompletion>, timeout: Duration, project: &ProjectRef) {
    let count = completions.len();
    let all = async {
        for completion in completions {
            completion.wait().await;
        }
    };
    if tokio::time::timeout(timeout, all).await.is_err() {
        warn!(
            project = %project,
            workers = count,
            timeout_ms = timeout.as_millis() as u64,
            "Workers did not stop in time"
        );
    }
}
