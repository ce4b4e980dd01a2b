//! Project view coordination
//!
//! This crate keeps the workers of every project in line with the views the
//! directory holds for it:
//! - **Directory**: revisioned project to view set entries with change
//!   notifications
//! - **Translator**: narrows notifications down to a project's desired views
//! - **Reconciler**: diffs running workers against desired views
//! - **Coordinator**: one task per project applying commands in order
//! - **Router**: places coordinators on cluster nodes by shard, recovers
//!   crashed ones and hands shards off when membership changes
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use coordinator::{Cluster, Envelope, InMemoryDirectory};
//! use lifecycle::WorkerLifecycle;
//! use view_core::{IndexView, Project, ProjectRef, RuntimeConfig, View, ViewSet};
//!
//! # async fn example() -> view_core::Result<()> {
//! let config = RuntimeConfig::default();
//! let directory = Arc::new(InMemoryDirectory::default());
//! let (lifecycle, _index, _graph) =
//!     WorkerLifecycle::in_memory(&config.cleanup, Duration::from_secs(30));
//!
//! let cluster = Cluster::new(&config.sharding)?;
//! let router = cluster
//!     .join("node-0", lifecycle, directory, &config.coordinator)
//!     .await;
//!
//! let project = Project::new(ProjectRef::new("org", "proj"));
//! let views = ViewSet::new(1, [View::from(IndexView::new("v1", 1, project.reference.clone()))]);
//! router.route(Envelope::start(project, views)).await?;
//!
//! router.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod cluster;
mod coordinator;
pub mod directory;
mod messages;
pub mod reconcile;
mod router;
pub mod seed;
mod supervisor;
pub mod translator;

pub use cluster::{Cluster, RememberedStart};
pub use directory::{Change, ChangeSet, InMemoryDirectory, Subscription, ViewDirectory};
pub use messages::{CoordinatorCommand, CoordinatorSnapshot, Envelope, WorkerSummary};
pub use reconcile::{reconcile, Reconciliation};
pub use router::ShardRouter;
pub use supervisor::{ProjectEvent, ProjectSupervisor};
pub use translator::{translate, ViewChanges};
