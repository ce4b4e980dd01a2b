//! Messages consumed by project coordinators

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;
use view_core::{Project, ProjectRef, Revision, View, ViewId, ViewSet};

/// Commands a project coordinator applies in arrival order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CoordinatorCommand {
    /// Bind the coordinator to a project and start its initial views
    Start { project: Project, views: ViewSet },

    /// Stop every worker and terminate the coordinator
    Stop,

    /// New desired view set for the project
    ViewsChanges { views: ViewSet },

    /// The project metadata changed; restart every worker under it
    ProjectChanges { project: Project },
}

impl CoordinatorCommand {
    pub fn name(&self) -> &'static str {
        match self {
            CoordinatorCommand::Start { .. } => "start",
            CoordinatorCommand::Stop => "stop",
            CoordinatorCommand::ViewsChanges { .. } => "views_changes",
            CoordinatorCommand::ProjectChanges { .. } => "project_changes",
        }
    }
}

/// A command addressed to the coordinator of one project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub project: ProjectRef,
    pub command: CoordinatorCommand,
}

impl Envelope {
    pub fn start(project: Project, views: ViewSet) -> Self {
        Self {
            project: project.reference.clone(),
            command: CoordinatorCommand::Start { project, views },
        }
    }

    pub fn stop(project: ProjectRef) -> Self {
        Self {
            project,
            command: CoordinatorCommand::Stop,
        }
    }

    pub fn views_changes(project: ProjectRef, views: ViewSet) -> Self {
        Self {
            project,
            command: CoordinatorCommand::ViewsChanges { views },
        }
    }

    pub fn project_changes(project: Project) -> Self {
        Self {
            project: project.reference.clone(),
            command: CoordinatorCommand::ProjectChanges { project },
        }
    }
}

/// Everything a coordinator mailbox carries
#[derive(Debug)]
pub(crate) enum Message {
    Command(CoordinatorCommand),

    /// Report the coordinator state once every earlier message is applied
    Snapshot(oneshot::Sender<CoordinatorSnapshot>),

    /// Stop every worker and terminate, whatever the state
    Passivate,
}

/// A running worker as seen by its coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub worker: Uuid,
    pub view: View,
    pub project_revision: Revision,
}

/// Point in time state of a project coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorSnapshot {
    pub project: ProjectRef,

    /// Project the coordinator is bound to, `None` before `Start`
    pub bound: Option<Project>,

    pub workers: BTreeMap<ViewId, WorkerSummary>,

    /// Messages buffered while waiting for `Start`
    pub stashed: usize,
}

impl CoordinatorSnapshot {
    pub fn is_initialized(&self) -> bool {
        self.bound.is_some()
    }

    pub fn view_ids(&self) -> BTreeSet<ViewId> {
        self.workers.keys().cloned().collect()
    }

    pub fn worker(&self, view_id: &str) -> Option<&WorkerSummary> {
        self.workers.get(view_id)
    }
}
