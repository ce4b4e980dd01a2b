//! Diff between running views and the desired view set

use std::collections::HashMap;

use view_core::{View, ViewSet};

/// Actions turning the running views into the desired ones
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Views with no running worker
    pub start: Vec<View>,

    /// `(running, desired)` pairs whose worker must be replaced
    pub restart: Vec<(View, View)>,

    /// Running views absent from the desired set; their stores are deleted
    pub stop: Vec<View>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.start.is_empty() && self.restart.is_empty() && self.stop.is_empty()
    }
}

/// Compute the actions needed to go from `current` to `desired`.
///
/// An index view restarts when its revision changes since its store name
/// embeds the revision. A graph view keeps its worker across revisions.
/// A view whose kind changed under the same id keeps its running worker.
pub fn reconcile<'a>(current: impl IntoIterator<Item = &'a View>, desired: &ViewSet) -> Reconciliation {
    let current: HashMap<&str, &View> = current.into_iter().map(|v| (v.id().as_str(), v)).collect();
    let mut plan = Reconciliation::default();

    for view in desired.iter() {
        match current.get(view.id().as_str()) {
            None => plan.start.push(view.clone()),
            Some(running) => {
                let same_index = matches!((*running, view), (View::Index(_), View::Index(_)));
                if same_index && running.revision() != view.revision() {
                    plan.restart.push(((*running).clone(), view.clone()));
                }
            }
        }
    }

    let mut removed: Vec<View> = current
        .values()
        .filter(|running| !desired.contains(running.id()))
        .map(|running| (*running).clone())
        .collect();
    removed.sort_by(|a, b| a.id().cmp(b.id()));
    plan.stop = removed;

    plan
}
