//! Core type definitions for project view coordination

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::Error;

/// Identifier of a view, unique within its project
pub type ViewId = String;

/// Monotonically increasing revision counter
pub type Revision = u64;

/// Default prefix for index backed views
pub const DEFAULT_INDEX_PREFIX: &str = "views";

/// Default prefix for graph backed views
pub const DEFAULT_GRAPH_PREFIX: &str = "graph";

/// Reference to a project: `{organization}/{project}`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectRef {
    /// Organization label
    pub organization: String,

    /// Project label
    pub project: String,
}

impl ProjectRef {
    /// Create a new project reference
    pub fn new(organization: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            project: project.into(),
        }
    }
}

impl fmt::Display for ProjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.organization, self.project)
    }
}

impl FromStr for ProjectRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((org, proj)) if !org.is_empty() && !proj.is_empty() && !proj.contains('/') => {
                Ok(ProjectRef::new(org, proj))
            }
            _ => Err(Error::InvalidProjectRef {
                value: s.to_string(),
            }),
        }
    }
}

/// Project metadata, replaced wholesale on every project update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Project reference
    pub reference: ProjectRef,

    /// Stable project identifier, used when naming backing stores
    pub uuid: Uuid,

    /// Organization identifier
    pub organization_uuid: Uuid,

    /// Project revision
    pub revision: Revision,

    /// Human readable label
    pub label: String,

    /// Base IRI for resources of this project
    pub base: String,

    /// Vocabulary IRI for resources of this project
    pub vocab: String,

    /// Whether the project is deprecated
    pub deprecated: bool,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Create a project at revision 1 with generated identifiers
    pub fn new(reference: ProjectRef) -> Self {
        let base = format!("https://views.local/{}/", reference);
        Self {
            label: reference.project.clone(),
            vocab: format!("{}vocab/", base),
            base,
            reference,
            uuid: Uuid::new_v4(),
            organization_uuid: Uuid::new_v4(),
            revision: 1,
            deprecated: false,
            updated_at: Utc::now(),
        }
    }

    /// Produce the next revision of this project with a new label
    pub fn relabel(&self, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            revision: self.revision + 1,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// Backend kind a view is indexed into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewKind {
    /// Full text / document index
    Index,

    /// RDF graph namespace
    Graph,
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewKind::Index => write!(f, "index"),
            ViewKind::Graph => write!(f, "graph"),
        }
    }
}

/// View indexing resources into a document index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexView {
    pub id: ViewId,
    pub revision: Revision,
    pub project: ProjectRef,

    /// Prefix of the backing index name
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,

    /// Only index resources validated against these schemas (all when empty)
    #[serde(default)]
    pub resource_schemas: BTreeSet<String>,

    /// Only index resources of these types (all when empty)
    #[serde(default)]
    pub resource_types: BTreeSet<String>,

    #[serde(default)]
    pub include_metadata: bool,

    #[serde(default)]
    pub include_deprecated: bool,

    /// Store the original payload as a string field
    #[serde(default)]
    pub source_as_text: bool,

    /// Index mapping handed to the backend untouched
    #[serde(default)]
    pub mapping: serde_json::Value,
}

impl IndexView {
    pub fn new(id: impl Into<ViewId>, revision: Revision, project: ProjectRef) -> Self {
        Self {
            id: id.into(),
            revision,
            project,
            index_prefix: default_index_prefix(),
            resource_schemas: BTreeSet::new(),
            resource_types: BTreeSet::new(),
            include_metadata: false,
            include_deprecated: false,
            source_as_text: false,
            mapping: serde_json::Value::Null,
        }
    }
}

/// View indexing resources into a graph namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphView {
    pub id: ViewId,
    pub revision: Revision,
    pub project: ProjectRef,

    /// Prefix of the backing namespace name
    #[serde(default = "default_graph_prefix")]
    pub namespace_prefix: String,

    #[serde(default)]
    pub resource_schemas: BTreeSet<String>,

    #[serde(default)]
    pub resource_types: BTreeSet<String>,

    #[serde(default)]
    pub include_metadata: bool,

    #[serde(default)]
    pub include_deprecated: bool,
}

impl GraphView {
    pub fn new(id: impl Into<ViewId>, revision: Revision, project: ProjectRef) -> Self {
        Self {
            id: id.into(),
            revision,
            project,
            namespace_prefix: default_graph_prefix(),
            resource_schemas: BTreeSet::new(),
            resource_types: BTreeSet::new(),
            include_metadata: false,
            include_deprecated: false,
        }
    }
}

fn default_index_prefix() -> String {
    DEFAULT_INDEX_PREFIX.to_string()
}

fn default_graph_prefix() -> String {
    DEFAULT_GRAPH_PREFIX.to_string()
}

/// A view definition. Identity is the `id`; the revision marks its configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum View {
    #[serde(rename = "IndexView")]
    Index(IndexView),

    #[serde(rename = "GraphView")]
    Graph(GraphView),
}

impl View {
    pub fn id(&self) -> &ViewId {
        match self {
            View::Index(v) => &v.id,
            View::Graph(v) => &v.id,
        }
    }

    pub fn revision(&self) -> Revision {
        match self {
            View::Index(v) => v.revision,
            View::Graph(v) => v.revision,
        }
    }

    pub fn project(&self) -> &ProjectRef {
        match self {
            View::Index(v) => &v.project,
            View::Graph(v) => &v.project,
        }
    }

    pub fn kind(&self) -> ViewKind {
        match self {
            View::Index(_) => ViewKind::Index,
            View::Graph(_) => ViewKind::Graph,
        }
    }

    /// Same view at another revision
    pub fn at_revision(&self, revision: Revision) -> View {
        let mut view = self.clone();
        match &mut view {
            View::Index(v) => v.revision = revision,
            View::Graph(v) => v.revision = revision,
        }
        view
    }

    /// Name of the index or namespace this view writes into.
    ///
    /// Index names embed the revision, graph namespaces do not.
    pub fn backing_store_name(&self, project: &Project) -> String {
        match self {
            View::Index(v) => format!(
                "{}_{}_{}_{}",
                v.index_prefix, project.uuid, v.id, v.revision
            ),
            View::Graph(v) => format!("{}_{}_{}", v.namespace_prefix, project.uuid, v.id),
        }
    }
}

impl From<IndexView> for View {
    fn from(view: IndexView) -> Self {
        View::Index(view)
    }
}

impl From<GraphView> for View {
    fn from(view: GraphView) -> Self {
        View::Graph(view)
    }
}

/// The set of views of a project at one directory revision.
///
/// View ids are unique; a later view with an already present id replaces the earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ViewSetRepr", into = "ViewSetRepr")]
pub struct ViewSet {
    revision: Revision,
    views: BTreeMap<ViewId, View>,
}

#[derive(Serialize, Deserialize)]
struct ViewSetRepr {
    #[serde(default)]
    revision: Revision,
    views: Vec<View>,
}

impl From<ViewSetRepr> for ViewSet {
    fn from(repr: ViewSetRepr) -> Self {
        ViewSet::new(repr.revision, repr.views)
    }
}

impl From<ViewSet> for ViewSetRepr {
    fn from(set: ViewSet) -> Self {
        Self {
            revision: set.revision,
            views: set.views.into_values().collect(),
        }
    }
}

impl ViewSet {
    pub fn new(revision: Revision, views: impl IntoIterator<Item = View>) -> Self {
        let views = views
            .into_iter()
            .map(|view| (view.id().clone(), view))
            .collect();
        Self { revision, views }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn get(&self, id: &str) -> Option<&View> {
        self.views.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.views.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &View> {
        self.views.values()
    }

    pub fn ids(&self) -> BTreeSet<ViewId> {
        self.views.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

impl FromIterator<View> for ViewSet {
    fn from_iter<I: IntoIterator<Item = View>>(iter: I) -> Self {
        ViewSet::new(0, iter)
    }
}

impl IntoIterator for ViewSet {
    type Item = View;
    type IntoIter = std::collections::btree_map::IntoValues<ViewId, View>;

    fn into_iter(self) -> Self::IntoIter {
        self.views.into_values()
    }
}
