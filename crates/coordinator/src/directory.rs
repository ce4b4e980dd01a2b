//! View directory client
//!
//! The directory maps every project to its revisioned view set and notifies
//! subscribers of changes per key. [`InMemoryDirectory`] is a single process
//! stand-in with last-writer-wins semantics on the view set revision.

use std::collections::BTreeMap;
use std::pin::Pin;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};
use view_core::{ProjectRef, Result, Revision, ViewSet};

/// Change of one directory key
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Added(Value),
    Modified(Value),
    Removed,
}

/// Changes keyed by directory key (`{organization}/{project}`)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub changes: BTreeMap<String, Change>,
}

impl ChangeSet {
    pub fn single(key: impl Into<String>, change: Change) -> Self {
        let mut changes = BTreeMap::new();
        changes.insert(key.into(), change);
        Self { changes }
    }

    pub fn get(&self, key: &str) -> Option<&Change> {
        self.changes.get(key)
    }
}

/// Stream of change sets for one key
pub type Subscription = Pin<Box<dyn Stream<Item = ChangeSet> + Send>>;

/// Replicated project to view set directory
pub trait ViewDirectory: Send + Sync {
    /// Subscribe to changes of a project's entry.
    ///
    /// The stream starts with the current value, if any, as [`Change::Added`].
    fn subscribe(&self, project: &ProjectRef) -> Subscription;

    /// Current view set of a project
    fn current(&self, project: &ProjectRef) -> Option<ViewSet>;
}

#[derive(Debug, Clone)]
struct Stored {
    revision: Revision,
    value: Value,
}

/// In-process directory
#[derive(Debug)]
pub struct InMemoryDirectory {
    entries: DashMap<String, Stored>,
    channels: DashMap<String, broadcast::Sender<ChangeSet>>,
    buffer: usize,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new(64)
    }
}

impl InMemoryDirectory {
    /// Create a directory buffering `buffer` notifications per subscriber
    pub fn new(buffer: usize) -> Self {
        Self {
            entries: DashMap::new(),
            channels: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Store a project's view set.
    ///
    /// Ignored, returning false, unless its revision is greater than the
    /// stored one.
    pub fn put(&self, project: &ProjectRef, views: &ViewSet) -> Result<bool> {
        let value = serde_json::to_value(views)?;
        let key = project.to_string();

        // Notify under the entry lock so subscribers see writes in order
        match self.entries.entry(key.clone()) {
            MapEntry::Occupied(mut existing) => {
                if existing.get().revision >= views.revision() {
                    debug!(
                        project = %project,
                        stored = existing.get().revision,
                        revision = views.revision(),
                        "Stale directory write ignored"
                    );
                    return Ok(false);
                }
                existing.insert(Stored {
                    revision: views.revision(),
                    value: value.clone(),
                });
                self.notify(key, Change::Modified(value));
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Stored {
                    revision: views.revision(),
                    value: value.clone(),
                });
                self.notify(key, Change::Added(value));
            }
        }
        Ok(true)
    }

    /// Store an arbitrary value under a key, bypassing revision checks
    pub fn put_raw(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let revision = value.get("revision").and_then(Value::as_u64).unwrap_or(0);
        let previous = self.entries.insert(
            key.clone(),
            Stored {
                revision,
                value: value.clone(),
            },
        );
        let change = match previous {
            Some(_) => Change::Modified(value),
            None => Change::Added(value),
        };
        self.notify(key, change);
    }

    /// Remove a project's entry; false if there was none
    pub fn remove(&self, project: &ProjectRef) -> bool {
        let key = project.to_string();
        if self.entries.remove(&key).is_none() {
            return false;
        }
        self.notify(key, Change::Removed);
        true
    }

    /// Decoded view set of a project; `None` if absent or malformed
    pub fn get(&self, project: &ProjectRef) -> Option<ViewSet> {
        let entry = self.entries.get(&project.to_string())?;
        match serde_json::from_value(entry.value.clone()) {
            Ok(views) => Some(views),
            Err(e) => {
                debug!(project = %project, error = %e, "Malformed directory entry");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn channel(&self, key: &str) -> broadcast::Sender<ChangeSet> {
        self.channels
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer).0)
            .clone()
    }

    fn notify(&self, key: String, change: Change) {
        // No receivers is fine: nobody subscribed to this key yet
        let _ = self.channel(&key).send(ChangeSet::single(key, change));
    }
}

impl ViewDirectory for InMemoryDirectory {
    fn subscribe(&self, project: &ProjectRef) -> Subscription {
        let key = project.to_string();
        // Subscribe before reading so no write falls in between
        let rx = self.channel(&key).subscribe();
        let initial = self
            .entries
            .get(&key)
            .map(|entry| ChangeSet::single(key.clone(), Change::Added(entry.value.clone())));

        let updates = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(changes) => Some(changes),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(key = %key, skipped, "Directory subscriber lagged, notifications dropped");
                None
            }
        });

        Box::pin(tokio_stream::iter(initial).chain(updates))
    }

    fn current(&self, project: &ProjectRef) -> Option<ViewSet> {
        self.get(project)
    }
}
