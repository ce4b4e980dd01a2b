//! Shard router
//!
//! Routes envelopes to the single coordinator of their project. Projects map
//! to shards, shards to nodes; the owning node creates coordinators lazily and
//! re-creates them with their remembered start when they crash.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use lifecycle::WorkerLifecycle;
use project_shard::{NodeId, ShardId};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use view_core::config::CoordinatorConfig;
use view_core::{Error, ProjectRef, Result};

use crate::cluster::{ClusterShared, RememberedStart};
use crate::coordinator::ProjectCoordinator;
use crate::directory::ViewDirectory;
use crate::messages::{CoordinatorCommand, CoordinatorSnapshot, Envelope, Message};

/// Pause before re-creating a crashed coordinator
const RECOVERY_DELAY: Duration = Duration::from_millis(100);

struct CoordinatorEntry {
    shard: ShardId,
    incarnation: u64,
    mailbox: mpsc::Sender<Message>,
    terminated: watch::Receiver<bool>,
}

pub(crate) struct RouterInner {
    node_id: NodeId,
    cluster: Arc<ClusterShared>,
    lifecycle: WorkerLifecycle,
    directory: Arc<dyn ViewDirectory>,
    config: CoordinatorConfig,
    coordinators: DashMap<ProjectRef, CoordinatorEntry>,
    shutting_down: AtomicBool,
}

/// Routes coordinator commands of one node
#[derive(Clone)]
pub struct ShardRouter {
    inner: Arc<RouterInner>,
}

impl ShardRouter {
    pub(crate) fn new(
        node_id: NodeId,
        cluster: Arc<ClusterShared>,
        lifecycle: WorkerLifecycle,
        directory: Arc<dyn ViewDirectory>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                node_id,
                cluster,
                lifecycle,
                directory,
                config,
                coordinators: DashMap::new(),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<RouterInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<RouterInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn lifecycle(&self) -> &WorkerLifecycle {
        &self.inner.lifecycle
    }

    /// Deliver an envelope to the coordinator of its project, wherever it lives
    #[instrument(skip(self, envelope), fields(node = %self.inner.node_id, project = %envelope.project, command = envelope.command.name()))]
    pub async fn route(&self, envelope: Envelope) -> Result<()> {
        let (shard, target) = self.owner_of(&envelope.project)?;
        self.remember(&envelope);
        if target.node_id() != self.node_id() {
            debug!(owner = %target.node_id(), shard, "Forwarding to owning node");
        }
        target.deliver(shard, envelope.project, envelope.command).await
    }

    /// State of a project's coordinator; `None` if it is not running
    pub async fn snapshot(&self, project: &ProjectRef) -> Result<Option<CoordinatorSnapshot>> {
        let (_, target) = self.owner_of(project)?;
        Ok(target.local_snapshot(project).await)
    }

    /// Projects with a coordinator on this node
    pub fn local_projects(&self) -> Vec<ProjectRef> {
        let mut projects: Vec<_> = self
            .inner
            .coordinators
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        projects.sort();
        projects
    }

    pub fn coordinator_count(&self) -> usize {
        self.inner.coordinators.len()
    }

    /// Stop every local coordinator without cleanup and wait for them
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let projects = self.local_projects();
        info!(node = %self.inner.node_id, coordinators = projects.len(), "Shutting down coordinators");
        self.passivate(|_| true).await;
    }

    fn owner_of(&self, project: &ProjectRef) -> Result<(ShardId, ShardRouter)> {
        let shard = self.inner.cluster.shard_for(project);
        let owner = self
            .inner
            .cluster
            .allocation
            .owner(shard)
            .ok_or(Error::ShardUnavailable { shard })?;
        if owner == self.inner.node_id {
            return Ok((shard, self.clone()));
        }
        let target = self
            .inner
            .cluster
            .router(&owner)
            .ok_or(Error::NodeUnreachable { node_id: owner })?;
        Ok((shard, target))
    }

    fn remember(&self, envelope: &Envelope) {
        let remembered = &self.inner.cluster.remembered;
        match &envelope.command {
            CoordinatorCommand::Start { project, views } => {
                remembered.insert(
                    envelope.project.clone(),
                    RememberedStart {
                        project: project.clone(),
                        views: views.clone(),
                    },
                );
            }
            CoordinatorCommand::Stop => {
                remembered.remove(&envelope.project);
            }
            CoordinatorCommand::ViewsChanges { views } => {
                if let Some(mut start) = remembered.get_mut(&envelope.project) {
                    start.views = views.clone();
                }
            }
            CoordinatorCommand::ProjectChanges { project } => {
                if let Some(mut start) = remembered.get_mut(&envelope.project) {
                    if start.project.reference == project.reference {
                        start.project = project.clone();
                    }
                }
            }
        }
    }

    /// Put a command into the local coordinator's mailbox, creating it if needed
    async fn deliver(&self, shard: ShardId, project: ProjectRef, command: CoordinatorCommand) -> Result<()> {
        if matches!(command, CoordinatorCommand::Stop) {
            self.stop_local(&project).await;
            return Ok(());
        }

        let mut message = Message::Command(command);
        // A coordinator may terminate between lookup and send; retry once with a new one
        for _ in 0..2 {
            let (incarnation, mailbox) = self.coordinator(shard, &project)?;
            match mailbox.send(message).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    self.detach(&project, Some(incarnation));
                    message = returned;
                }
            }
        }
        Err(Error::CoordinatorUnavailable {
            project: project.to_string(),
        })
    }

    /// Detach the project's coordinator and tell it to stop; later commands
    /// go to a fresh incarnation, which waits for this one to terminate
    async fn stop_local(&self, project: &ProjectRef) {
        match self.detach(project, None) {
            Some(entry) => {
                // A closed mailbox means the coordinator already terminated
                let _ = entry
                    .mailbox
                    .send(Message::Command(CoordinatorCommand::Stop))
                    .await;
            }
            None => debug!(node = %self.inner.node_id, project = %project, "No coordinator to stop"),
        }
    }

    /// Remove the project's coordinator (only `incarnation`, when given) and
    /// publish its termination signal for the next incarnation to wait on
    fn detach(&self, project: &ProjectRef, incarnation: Option<u64>) -> Option<CoordinatorEntry> {
        let terminating = &self.inner.cluster.terminating;
        self.inner
            .coordinators
            .remove_if(project, |_, entry| {
                let selected = incarnation.map_or(true, |i| i == entry.incarnation);
                if selected {
                    terminating.insert(
                        project.clone(),
                        (entry.incarnation, entry.terminated.clone()),
                    );
                }
                selected
            })
            .map(|(_, entry)| entry)
    }

    /// Mailbox of the local coordinator of `project`
    fn coordinator(&self, shard: ShardId, project: &ProjectRef) -> Result<(u64, mpsc::Sender<Message>)> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::CoordinatorUnavailable {
                project: project.to_string(),
            });
        }
        let entry = self
            .inner
            .coordinators
            .entry(project.clone())
            .or_insert_with(|| self.spawn_coordinator(shard, project.clone()));
        Ok((entry.incarnation, entry.mailbox.clone()))
    }

    fn spawn_coordinator(&self, shard: ShardId, project: ProjectRef) -> CoordinatorEntry {
        let cluster = &self.inner.cluster;
        let incarnation = cluster.incarnations.fetch_add(1, Ordering::SeqCst) + 1;
        let (mailbox, task) = ProjectCoordinator::spawn(
            project.clone(),
            self.inner.lifecycle.clone(),
            Arc::clone(&self.inner.directory),
            &self.inner.config,
            cluster.predecessor(&project),
        );
        let (terminated_tx, terminated) = watch::channel(false);
        tokio::spawn(supervise(
            self.downgrade(),
            Arc::clone(cluster),
            project.clone(),
            incarnation,
            task,
            terminated_tx,
        ));
        debug!(node = %self.inner.node_id, project = %project, shard, incarnation, "Coordinator created");

        CoordinatorEntry {
            shard,
            incarnation,
            mailbox,
            terminated,
        }
    }

    async fn local_snapshot(&self, project: &ProjectRef) -> Option<CoordinatorSnapshot> {
        let mailbox = self
            .inner
            .coordinators
            .get(project)
            .map(|entry| entry.mailbox.clone())?;
        let (reply, rx) = oneshot::channel();
        mailbox.send(Message::Snapshot(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Stop the coordinators of shards this node no longer owns
    pub(crate) async fn release_shards(&self, shards: &[ShardId]) {
        info!(node = %self.inner.node_id, shards = shards.len(), "Releasing shards");
        self.passivate(|shard| shards.contains(&shard)).await;
    }

    /// Re-deliver remembered starts for shards this node took over
    pub(crate) async fn acquire_shards(&self, shards: &[ShardId]) {
        let starts = self.inner.cluster.remembered_in(shards);
        info!(
            node = %self.inner.node_id,
            shards = shards.len(),
            projects = starts.len(),
            "Acquiring shards"
        );
        for start in starts {
            self.redeliver(start).await;
        }
    }

    async fn redeliver(&self, start: RememberedStart) {
        let project = start.project.reference.clone();
        let shard = self.inner.cluster.shard_for(&project);
        let command = CoordinatorCommand::Start {
            project: start.project,
            views: start.views,
        };
        if let Err(e) = self.deliver(shard, project.clone(), command).await {
            warn!(node = %self.inner.node_id, project = %project, error = %e, "Failed to re-deliver start");
        }
    }

    /// Passivate local coordinators of matching shards and wait for them
    async fn passivate(&self, selected: impl Fn(ShardId) -> bool) {
        let projects: Vec<ProjectRef> = self
            .inner
            .coordinators
            .iter()
            .filter(|entry| selected(entry.value().shard))
            .map(|entry| entry.key().clone())
            .collect();

        let mut pending = Vec::with_capacity(projects.len());
        for project in projects {
            if let Some(entry) = self.detach(&project, None) {
                // A closed mailbox means the coordinator already terminated
                let _ = entry.mailbox.send(Message::Passivate).await;
                pending.push(entry.terminated);
            }
        }
        for mut terminated in pending {
            // The sender is dropped once the supervisor is done
            let _ = terminated.wait_for(|done| *done).await;
        }
    }

    /// Re-create a crashed coordinator if this node still owns its project
    async fn recover(&self, project: ProjectRef) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let shard = self.inner.cluster.shard_for(&project);
        if self.inner.cluster.allocation.owner(shard).as_deref() != Some(self.node_id()) {
            debug!(project = %project, shard, "Shard moved away, not recovering coordinator");
            return;
        }
        let Some(start) = self
            .inner
            .cluster
            .remembered
            .get(&project)
            .map(|entry| entry.value().clone())
        else {
            debug!(project = %project, "No remembered start, coordinator recreated on next message");
            return;
        };

        info!(node = %self.inner.node_id, project = %project, "Recovering coordinator with remembered start");
        self.redeliver(start).await;
    }
}

/// Watch one coordinator incarnation and recover it if it panics
async fn supervise(
    router: Weak<RouterInner>,
    cluster: Arc<ClusterShared>,
    project: ProjectRef,
    incarnation: u64,
    task: JoinHandle<()>,
    terminated: watch::Sender<bool>,
) {
    let result = task.await;

    let router = router.upgrade().map(ShardRouter::from_inner);
    if let Some(router) = &router {
        router
            .inner
            .coordinators
            .remove_if(&project, |_, entry| entry.incarnation == incarnation);
    }
    terminated.send_replace(true);
    cluster
        .terminating
        .remove_if(&project, |_, (detached, _)| *detached == incarnation);

    match result {
        Ok(()) => debug!(project = %project, incarnation, "Coordinator incarnation ended"),
        Err(e) if e.is_panic() => {
            error!(project = %project, incarnation, "Coordinator crashed");
            if let Some(router) = router {
                tokio::time::sleep(RECOVERY_DELAY).await;
                router.recover(project).await;
            }
        }
        Err(e) => warn!(project = %project, incarnation, error = %e, "Coordinator task cancelled"),
    }
}
