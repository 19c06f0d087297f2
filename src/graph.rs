//! The authoritative in-memory knowledge graph.
//!
//! [`GraphStore`] holds Event nodes (one per captured occurrence, QUICK
//! layer) and Entity nodes (durable real-world referents, CORE layer) plus
//! typed directed edges. Persistence is a full JSON snapshot overwritten on
//! every save; a missing or corrupt snapshot loads as an empty graph.
//!
//! Only the Linking stage writes to the graph; the retrieval engine and the
//! query service read it. All writes are monotone additions — nodes and
//! edges are added, never removed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::event::Event;

#[derive(Debug, Error)]
pub enum GraphError {
    /// An edge referenced a node that does not exist in the graph.
    #[error("edge endpoint not found: {0}")]
    MissingEndpoint(String),
}

/// Knowledge durability tag. Purely descriptive — both layers live in the
/// same store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Layer {
    /// Recent, low-durability knowledge (event nodes).
    Quick,
    /// Durable entity-level knowledge.
    Core,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "QUICK",
            Self::Core => "CORE",
        }
    }
}

/// Category label for entity nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityLabel {
    Person,
    Organization,
    Project,
    Location,
    Technology,
    Document,
    Date,
    Amount,
    Url,
    Entity,
}

impl EntityLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "PERSON",
            Self::Organization => "ORGANIZATION",
            Self::Project => "PROJECT",
            Self::Location => "LOCATION",
            Self::Technology => "TECHNOLOGY",
            Self::Document => "DOCUMENT",
            Self::Date => "DATE",
            Self::Amount => "AMOUNT",
            Self::Url => "URL",
            Self::Entity => "ENTITY",
        }
    }
}

impl std::fmt::Display for EntityLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A graph node — either a captured event or a durable entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Node {
    #[serde(rename = "EVENT")]
    Event(EventNode),
    #[serde(rename = "ENTITY")]
    Entity(EntityNode),
}

/// Node for one captured occurrence, keyed by the originating event id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventNode {
    pub event_type: String,
    /// RFC 3339 creation time of the originating event. Stored as text so a
    /// malformed value degrades to "skipped in temporal queries" rather
    /// than poisoning the snapshot.
    pub timestamp: String,
    pub source: String,
    pub layer: Layer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Irregular Oracle-derived extras, bounded to string-to-string.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Node for a durable real-world referent, keyed by `"{LABEL}:{name}"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityNode {
    pub label: EntityLabel,
    pub name: String,
    pub layer: Layer,
}

impl Node {
    pub fn is_event(&self) -> bool {
        matches!(self, Node::Event(_))
    }

    pub fn summary(&self) -> Option<&str> {
        match self {
            Node::Event(n) => n.summary.as_deref(),
            Node::Entity(_) => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Node::Event(_) => None,
            Node::Entity(n) => Some(&n.name),
        }
    }

    pub fn timestamp(&self) -> Option<&str> {
        match self {
            Node::Event(n) => Some(&n.timestamp),
            Node::Entity(_) => None,
        }
    }

    /// Exact-match attribute lookup, used by [`GraphStore::find_nodes_by_attribute`].
    pub fn attribute(&self, attr: &str) -> Option<String> {
        match self {
            Node::Event(n) => match attr {
                "type" => Some("EVENT".into()),
                "event_type" => Some(n.event_type.clone()),
                "source" => Some(n.source.clone()),
                "timestamp" => Some(n.timestamp.clone()),
                "layer" => Some(n.layer.as_str().into()),
                "summary" => n.summary.clone(),
                "primary_entity" => n.primary_entity.clone(),
                "file_path" => n.file_path.clone(),
                other => n.extra.get(other).cloned(),
            },
            Node::Entity(n) => match attr {
                "type" => Some("ENTITY".into()),
                "label" => Some(n.label.as_str().into()),
                "name" => Some(n.name.clone()),
                "layer" => Some(n.layer.as_str().into()),
                _ => None,
            },
        }
    }

    /// Concatenated searchable text fields, lowercased: summary,
    /// primary entity, event type, name, label.
    pub fn searchable_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        match self {
            Node::Event(n) => {
                if let Some(s) = n.summary.as_deref() {
                    parts.push(s);
                }
                if let Some(p) = n.primary_entity.as_deref() {
                    parts.push(p);
                }
                parts.push(&n.event_type);
            }
            Node::Entity(n) => {
                parts.push(&n.name);
                parts.push(n.label.as_str());
            }
        }
        parts.join(" ").to_lowercase()
    }
}

/// A directed, typed edge between two existing nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub relation: String,
}

#[derive(Serialize, Deserialize)]
struct SnapshotNode {
    id: String,
    #[serde(flatten)]
    node: Node,
}

/// Serialized snapshot document: node list plus edge list, overwritten
/// wholesale on every save.
#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    nodes: Vec<SnapshotNode>,
    edges: Vec<Edge>,
}

/// Unified graph storage for the QUICK and CORE layers.
pub struct GraphStore {
    path: PathBuf,
    /// BTreeMap keeps iteration order stable, so search tie-breaks and
    /// snapshots are deterministic.
    nodes: BTreeMap<String, Node>,
    edges: Vec<Edge>,
    edge_keys: HashSet<(String, String, String)>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
}

impl GraphStore {
    /// Open the graph at `path`, loading an existing snapshot if present.
    /// A missing or corrupt snapshot yields an empty graph, never an error.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut store = Self {
            path,
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            edge_keys: HashSet::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        };
        store.load();
        store
    }

    fn load(&mut self) {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no graph snapshot, starting empty");
            return;
        }
        let snapshot: Snapshot = match std::fs::read_to_string(&self.path)
            .map_err(anyhow::Error::from)
            .and_then(|s| serde_json::from_str(&s).map_err(anyhow::Error::from))
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err,
                    "graph snapshot unreadable, starting empty");
                return;
            }
        };
        for entry in snapshot.nodes {
            self.nodes.insert(entry.id, entry.node);
        }
        for edge in snapshot.edges {
            self.insert_edge(edge);
        }
        info!(
            nodes = self.nodes.len(),
            edges = self.edges.len(),
            "graph snapshot loaded"
        );
    }

    /// Write the full snapshot, overwriting any previous file.
    pub fn save(&self) -> anyhow::Result<()> {
        use anyhow::Context;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let snapshot = Snapshot {
            nodes: self
                .nodes
                .iter()
                .map(|(id, node)| SnapshotNode {
                    id: id.clone(),
                    node: node.clone(),
                })
                .collect(),
            edges: self.edges.clone(),
        };
        let json = serde_json::to_string(&snapshot)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("failed to write snapshot {}", self.path.display()))?;
        Ok(())
    }

    /// Insert (or overwrite) the Event node for `event.id`. When the event
    /// carries a normalized structure, its summary, primary entity, and
    /// file path are copied into node attributes.
    pub fn add_event_node(&mut self, event: &Event) -> String {
        let mut node = EventNode {
            event_type: event.event_type.as_str().to_string(),
            timestamp: event.timestamp.to_rfc3339(),
            source: event.source.clone(),
            layer: Layer::Quick,
            summary: None,
            primary_entity: None,
            file_path: None,
            extra: BTreeMap::new(),
        };
        if let Some(normalized) = &event.normalized {
            if !normalized.content_summary.is_empty() {
                node.summary = Some(normalized.content_summary.clone());
            }
            if !normalized.primary_entity.is_empty() {
                node.primary_entity = Some(normalized.primary_entity.clone());
            }
            node.file_path = normalized.deep_metadata.file_path.clone();
            if let Some(confidence) = &normalized.deep_metadata.confidence {
                node.extra.insert("confidence".into(), confidence.clone());
            }
        }
        self.nodes.insert(event.id.clone(), Node::Event(node));
        debug!(id = %event.id, "event node added");
        event.id.clone()
    }

    /// Create the Entity node for `(label, name)` if absent. Idempotent:
    /// returns the stable id either way.
    pub fn add_entity_node(&mut self, name: &str, label: EntityLabel) -> String {
        let node_id = format!("{label}:{name}");
        self.nodes.entry(node_id.clone()).or_insert_with(|| {
            debug!(id = %node_id, "entity node added");
            Node::Entity(EntityNode {
                label,
                name: name.to_string(),
                layer: Layer::Core,
            })
        });
        node_id
    }

    /// Add a directed edge. Both endpoints must already exist; a missing
    /// endpoint is returned as an error for the caller to log — callers in
    /// the pipeline drop it rather than aborting event processing.
    /// Duplicate `(source, target, relation)` triples coalesce.
    pub fn add_relation(
        &mut self,
        source_id: &str,
        target_id: &str,
        relation: &str,
    ) -> Result<(), GraphError> {
        if !self.nodes.contains_key(source_id) {
            return Err(GraphError::MissingEndpoint(source_id.to_string()));
        }
        if !self.nodes.contains_key(target_id) {
            return Err(GraphError::MissingEndpoint(target_id.to_string()));
        }
        let key = (
            source_id.to_string(),
            target_id.to_string(),
            relation.to_string(),
        );
        if self.edge_keys.contains(&key) {
            return Ok(());
        }
        self.insert_edge(Edge {
            source: source_id.to_string(),
            target: target_id.to_string(),
            relation: relation.to_string(),
        });
        Ok(())
    }

    fn insert_edge(&mut self, edge: Edge) {
        let key = (
            edge.source.clone(),
            edge.target.clone(),
            edge.relation.clone(),
        );
        if !self.edge_keys.insert(key) {
            return;
        }
        let index = self.edges.len();
        self.outgoing
            .entry(edge.source.clone())
            .or_default()
            .push(index);
        self.incoming
            .entry(edge.target.clone())
            .or_default()
            .push(index);
        self.edges.push(edge);
    }

    /// Whether any edge connects `source → target`, regardless of relation.
    pub fn has_edge(&self, source_id: &str, target_id: &str) -> bool {
        self.outgoing
            .get(source_id)
            .map(|indices| indices.iter().any(|&i| self.edges[i].target == target_id))
            .unwrap_or(false)
    }

    /// Exact-match scan over node attributes.
    pub fn find_nodes_by_attribute(&self, attr: &str, value: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.attribute(attr).as_deref() == Some(value))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Event nodes whose timestamp lies within `window_minutes` (inclusive,
    /// symmetric) of `timestamp`. Malformed stored timestamps are skipped.
    pub fn get_context_window(
        &self,
        timestamp: DateTime<Utc>,
        window_minutes: i64,
    ) -> Vec<String> {
        let window_secs = window_minutes * 60;
        self.nodes
            .iter()
            .filter_map(|(id, node)| {
                let stored = node.timestamp()?;
                let node_time = DateTime::parse_from_rfc3339(stored).ok()?;
                let diff = (node_time.with_timezone(&Utc) - timestamp)
                    .num_seconds()
                    .abs();
                (diff <= window_secs).then(|| id.clone())
            })
            .collect()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Nodes in stable iteration order.
    pub fn nodes(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Targets of outgoing edges from `id`.
    pub fn successors(&self, id: &str) -> impl Iterator<Item = &str> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .map(|&i| self.edges[i].target.as_str())
    }

    /// Sources of incoming edges into `id`.
    pub fn predecessors(&self, id: &str) -> impl Iterator<Item = &str> {
        self.incoming
            .get(id)
            .into_iter()
            .flatten()
            .map(|&i| self.edges[i].source.as_str())
    }

    /// Outgoing edges from `id`.
    pub fn out_edges(&self, id: &str) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .map(|&i| &self.edges[i])
    }

    /// Incoming edges into `id`.
    pub fn in_edges(&self, id: &str) -> impl Iterator<Item = &Edge> {
        self.incoming
            .get(id)
            .into_iter()
            .flatten()
            .map(|&i| &self.edges[i])
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Counts by node kind and relation label, for `mnema inspect`.
    pub fn stats(&self) -> GraphStats {
        let mut stats = GraphStats::default();
        for node in self.nodes.values() {
            match node {
                Node::Event(_) => stats.event_nodes += 1,
                Node::Entity(n) => {
                    stats.entity_nodes += 1;
                    *stats.entities_by_label.entry(n.label.as_str().into()).or_default() += 1;
                }
            }
        }
        for edge in &self.edges {
            *stats.edges_by_relation.entry(edge.relation.clone()).or_default() += 1;
        }
        stats
    }
}

/// Aggregate counts over the graph.
#[derive(Debug, Default, Serialize)]
pub struct GraphStats {
    pub event_nodes: usize,
    pub entity_nodes: usize,
    pub entities_by_label: BTreeMap<String, usize>,
    pub edges_by_relation: BTreeMap<String, usize>,
}
