//! Initial projects and views loaded at startup

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;
use view_core::{Project, ProjectRef, Result, ViewSet};

use crate::directory::InMemoryDirectory;
use crate::supervisor::{ProjectEvent, ProjectSupervisor};

/// One project and its views
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedProject {
    pub project: ProjectRef,

    #[serde(default)]
    pub views: ViewSet,
}

/// Read a JSON array of [`SeedProject`]
pub fn load_seed<P: AsRef<Path>>(path: P) -> Result<Vec<SeedProject>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Publish seeded views and create their projects
pub async fn apply_seed(
    seed: Vec<SeedProject>,
    directory: &InMemoryDirectory,
    supervisor: &ProjectSupervisor,
) -> Result<usize> {
    let count = seed.len();
    for entry in seed {
        directory.put(&entry.project, &entry.views)?;
        supervisor
            .handle(ProjectEvent::Created {
                project: Project::new(entry.project),
            })
            .await?;
    }
    info!(projects = count, "Seeded projects");
    Ok(count)
}
