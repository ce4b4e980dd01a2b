//! Project lifecycle events to coordinator commands

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use view_core::{Project, Result};

use crate::directory::ViewDirectory;
use crate::messages::Envelope;
use crate::router::ShardRouter;

/// Change in a project's lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProjectEvent {
    Created { project: Project },
    Updated { project: Project },
    Deprecated { project: Project },
}

impl ProjectEvent {
    pub fn project(&self) -> &Project {
        match self {
            ProjectEvent::Created { project }
            | ProjectEvent::Updated { project }
            | ProjectEvent::Deprecated { project } => project,
        }
    }
}

/// Starts, updates and stops project coordinators as projects change
#[derive(Clone)]
pub struct ProjectSupervisor {
    router: ShardRouter,
    directory: Arc<dyn ViewDirectory>,
}

impl ProjectSupervisor {
    pub fn new(router: ShardRouter, directory: Arc<dyn ViewDirectory>) -> Self {
        Self { router, directory }
    }

    /// Route the command matching `event`
    pub async fn handle(&self, event: ProjectEvent) -> Result<()> {
        let envelope = match event {
            ProjectEvent::Created { project } => {
                let views = self.directory.current(&project.reference).unwrap_or_default();
                debug!(project = %project.reference, views = views.len(), "Project created");
                Envelope::start(project, views)
            }
            ProjectEvent::Updated { project } => Envelope::project_changes(project),
            ProjectEvent::Deprecated { project } => Envelope::stop(project.reference),
        };
        self.router.route(envelope).await
    }

    /// Handle events until the channel closes
    pub fn spawn(self, mut events: mpsc::Receiver<ProjectEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let project = event.project().reference.clone();
                if let Err(e) = self.handle(event).await {
                    warn!(project = %project, error = %e, "Failed to route project event");
                }
            }
            debug!("Project event stream closed");
        })
    }
}
