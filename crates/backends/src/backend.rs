//! Backend trait definition
//!
//! Defines the interface each backend kind (index, graph) implements to run
//! view workers and to delete what they wrote.

use std::sync::Arc;

use async_trait::async_trait;
use view_core::{Project, Result, View, ViewKind};

use crate::WorkerHandle;

/// Runs workers for one kind of view and owns their backing stores.
#[async_trait]
pub trait ViewBackend: Send + Sync {
    /// Kind of views this backend accepts
    fn kind(&self) -> ViewKind;

    /// Spawn a worker streaming the project's resources into the view's store.
    ///
    /// Never fails synchronously; a worker that cannot make progress deals
    /// with it on its own.
    ///
    /// # Arguments
    /// * `view` - View definition the worker is bound to
    /// * `project` - Project context the worker runs under
    fn spawn_worker(&self, view: &View, project: &Project) -> WorkerHandle;

    /// Delete the index or namespace backing a view
    ///
    /// Deleting a store that does not exist succeeds.
    ///
    /// # Errors
    /// Returns error if the backend rejects or fails the deletion
    async fn delete_backing_store(&self, view: &View, project: &Project) -> Result<()>;
}

/// Backends for both view kinds
#[derive(Clone)]
pub struct BackendRegistry {
    index: Arc<dyn ViewBackend>,
    graph: Arc<dyn ViewBackend>,
}

impl BackendRegistry {
    pub fn new(index: Arc<dyn ViewBackend>, graph: Arc<dyn ViewBackend>) -> Self {
        debug_assert_eq!(index.kind(), ViewKind::Index);
        debug_assert_eq!(graph.kind(), ViewKind::Graph);
        Self { index, graph }
    }

    pub fn for_kind(&self, kind: ViewKind) -> &Arc<dyn ViewBackend> {
        match kind {
            ViewKind::Index => &self.index,
            ViewKind::Graph => &self.graph,
        }
    }

    pub fn for_view(&self, view: &View) -> &Arc<dyn ViewBackend> {
        self.for_kind(view.kind())
    }
}
