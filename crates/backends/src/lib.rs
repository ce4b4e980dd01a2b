//! Backends - pluggable index and graph backends for view workers
//!
//! Provides:
//! - The [`ViewBackend`] trait implemented by each backend kind
//! - [`WorkerHandle`], the owned reference to a running worker
//! - [`InMemoryBackend`], keeping stores and workers in memory
//!
//! # Example
//!
//! ```no_run
//! use backends::{InMemoryBackend, ViewBackend};
//! use view_core::{IndexView, Project, ProjectRef, View, ViewKind};
//!
//! # async fn example() -> view_core::Result<()> {
//! let backend = InMemoryBackend::new(ViewKind::Index);
//! let project = Project::new(ProjectRef::new("org", "proj"));
//! let view = View::from(IndexView::new("v1", 1, project.reference.clone()));
//!
//! let handle = backend.spawn_worker(&view, &project);
//! handle.stop().wait().await;
//! backend.delete_backing_store(&view, &project).await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod handle;
mod memory;

pub use backend::{BackendRegistry, ViewBackend};
pub use handle::{ShutdownSignal, StopCompletion, WorkerContext, WorkerHandle};
pub use memory::{BackendEvent, InMemoryBackend, StoreInfo, WorkerRecord};
