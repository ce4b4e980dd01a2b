//! Directory notifications to desired view sets
//!
//! Narrows change sets down to one project and decodes its view set. Anything
//! that does not yield a non-empty view set is dropped.

use tokio_stream::StreamExt;
use tracing::debug;
use view_core::{ProjectRef, ViewSet};

use crate::directory::{Change, ChangeSet, Subscription, ViewDirectory};

/// Desired view set carried by a change set for `project`, if any
pub fn translate(project: &ProjectRef, changes: &ChangeSet) -> Option<ViewSet> {
    let key = project.to_string();
    let value = match changes.get(&key) {
        Some(Change::Added(value)) | Some(Change::Modified(value)) => value,
        Some(Change::Removed) => {
            debug!(project = %project, "Directory entry removed, nothing to translate");
            return None;
        }
        None => {
            debug!(project = %project, keys = changes.changes.len(), "Change set for other keys dropped");
            return None;
        }
    };

    match serde_json::from_value::<ViewSet>(value.clone()) {
        Ok(views) if views.is_empty() => {
            debug!(project = %project, "Empty view set dropped");
            None
        }
        Ok(views) => Some(views),
        Err(e) => {
            debug!(project = %project, error = %e, "Malformed view set dropped");
            None
        }
    }
}

/// Desired view sets of one project, in directory order
pub struct ViewChanges {
    project: ProjectRef,
    subscription: Subscription,
}

impl ViewChanges {
    pub fn subscribe(directory: &dyn ViewDirectory, project: ProjectRef) -> Self {
        let subscription = directory.subscribe(&project);
        Self {
            project,
            subscription,
        }
    }

    /// Next desired view set; `None` once the directory closed the stream
    pub async fn next(&mut self) -> Option<ViewSet> {
        while let Some(changes) = self.subscription.next().await {
            if let Some(views) = translate(&self.project, &changes) {
                return Some(views);
            }
        }
        None
    }
}
