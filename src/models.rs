use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Largest absolute coordinate a stored position may carry.
pub const POSITION_LIMIT: f64 = 100_000.0;

pub const DEFAULT_EDGE_TYPE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    Rectangle,
    Rounded,
    Diamond,
    Circle,
    Parallelogram,
    Hexagon,
    Cylinder,
    Document,
    Note,
    Task,
}

impl NodeType {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            NodeType::Rectangle => "rectangle",
            NodeType::Rounded => "rounded",
            NodeType::Diamond => "diamond",
            NodeType::Circle => "circle",
            NodeType::Parallelogram => "parallelogram",
            NodeType::Hexagon => "hexagon",
            NodeType::Cylinder => "cylinder",
            NodeType::Document => "document",
            NodeType::Note => "note",
            NodeType::Task => "task",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "rectangle" => Some(NodeType::Rectangle),
            "rounded" => Some(NodeType::Rounded),
            "diamond" => Some(NodeType::Diamond),
            "circle" => Some(NodeType::Circle),
            "parallelogram" => Some(NodeType::Parallelogram),
            "hexagon" => Some(NodeType::Hexagon),
            "cylinder" => Some(NodeType::Cylinder),
            "document" => Some(NodeType::Document),
            "note" => Some(NodeType::Note),
            "task" => Some(NodeType::Task),
            _ => None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct DocumentId(pub Uuid);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

impl From<Uuid> for DocumentId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub String);

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EdgeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl EdgeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Finite and within [`POSITION_LIMIT`] on both axes.
    pub fn is_valid(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.x.abs() <= POSITION_LIMIT
            && self.y.abs() <= POSITION_LIMIT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

impl Viewport {
    /// Finite pan offsets and a finite, positive zoom.
    pub fn is_valid(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.zoom.is_finite() && self.zoom > 0.0
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            zoom: 1.0,
        }
    }
}

/// Node payload. Keys the core does not know about are kept in `extra` and
/// written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeData {
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub style: Value,
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeData {
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type", default)]
    pub node_type: NodeType,
    pub position: Position,
    #[serde(default)]
    pub data: NodeData,
}

impl Node {
    pub fn new(id: impl Into<String>, position: Position, data: NodeData) -> Self {
        Self {
            id: NodeId(id.into()),
            node_type: NodeType::default(),
            position,
            data,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.data.locked
    }
}

fn default_edge_type() -> String {
    DEFAULT_EDGE_TYPE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    #[serde(rename = "type", default = "default_edge_type")]
    pub edge_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_style: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker_start: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker_end: Option<Value>,
    #[serde(default)]
    pub animated: bool,
    #[serde(default)]
    pub connection_hash: String,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        let mut edge = Self {
            id: EdgeId(id.into()),
            source: NodeId(source.into()),
            target: NodeId(target.into()),
            source_handle: None,
            target_handle: None,
            edge_type: default_edge_type(),
            label: None,
            label_style: None,
            style: None,
            marker_start: None,
            marker_end: None,
            animated: false,
            connection_hash: String::new(),
        };
        edge.refresh_connection_hash();
        edge
    }

    pub fn touches(&self, node_id: &NodeId) -> bool {
        &self.source == node_id || &self.target == node_id
    }

    pub fn refresh_connection_hash(&mut self) {
        self.connection_hash = connection_hash(&self.source, &self.target, &self.edge_type);
    }
}

/// Fingerprint of `(source, target, type)`: hex of the first 16 bytes of a
/// SHA-256 over the NUL-separated fields.
pub fn connection_hash(source: &NodeId, target: &NodeId, edge_type: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(target.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(edge_type.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Nodes and edges are kept ordered by id, the same order the store loads
/// them in, so equal contents always compare equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: DocumentId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub viewport: Viewport,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Document {
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|node| &node.id == id)
    }

    pub fn edge(&self, id: &EdgeId) -> Option<&Edge> {
        self.edges.iter().find(|edge| &edge.id == id)
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.node(id).is_some()
    }

    pub(crate) fn insert_node(&mut self, node: Node) {
        let at = self.nodes.partition_point(|existing| existing.id < node.id);
        self.nodes.insert(at, node);
    }

    pub(crate) fn insert_edge(&mut self, edge: Edge) {
        let at = self.edges.partition_point(|existing| existing.id < edge.id);
        self.edges.insert(at, edge);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub id: DocumentId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub node_count: i64,
    pub edge_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Paged<T> {
    pub page: u32,
    pub limit: u32,
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListDocumentsQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl ListDocumentsQuery {
    pub fn pagination(&self) -> (u32, u32) {
        let page = self.page.unwrap_or(1).max(1);
        let limit = self.limit.unwrap_or(25).clamp(1, 200);
        (page, limit)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentPayload {
    pub name: String,
    pub description: Option<String>,
    pub viewport: Option<Viewport>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Association between a diagram and an item of the host task list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLink {
    pub document_id: DocumentId,
    pub task_id: String,
    pub created_at: NaiveDateTime,
}

/// Where a task is referenced: either a node's `taskId` or a document-level link
/// (`node_id` is `None`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReference {
    pub document_id: DocumentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

/// Deserializes a present field (including `null`) as `Some(..)` so partial
/// updates can tell "clear" apart from "leave unchanged".
pub(crate) fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn connection_hash_tracks_source_target_and_type() {
        let edge = Edge::new("e1", "a", "b");
        let same = Edge::new("e2", "a", "b");
        assert_eq!(edge.connection_hash, same.connection_hash);
        assert_eq!(edge.connection_hash.len(), 32);

        let reversed = Edge::new("e3", "b", "a");
        assert_ne!(edge.connection_hash, reversed.connection_hash);

        let mut typed = Edge::new("e4", "a", "b");
        typed.edge_type = "smoothstep".to_string();
        typed.refresh_connection_hash();
        assert_ne!(edge.connection_hash, typed.connection_hash);
    }

    #[test]
    fn connection_hash_separates_fields() {
        let left = connection_hash(&NodeId::from("ab"), &NodeId::from("c"), "x");
        let right = connection_hash(&NodeId::from("a"), &NodeId::from("bc"), "x");
        assert_ne!(left, right);
    }

    #[test]
    fn position_validity_checks_bounds_and_finiteness() {
        assert!(Position::new(0.0, 0.0).is_valid());
        assert!(Position::new(-100_000.0, 100_000.0).is_valid());
        assert!(!Position::new(100_000.5, 0.0).is_valid());
        assert!(!Position::new(f64::NAN, 5.0).is_valid());
        assert!(!Position::new(0.0, f64::INFINITY).is_valid());
    }

    #[test]
    fn viewport_validity_rejects_non_finite_and_flat_zoom() {
        assert!(Viewport::default().is_valid());
        assert!(
            !Viewport {
                x: f64::NAN,
                ..Viewport::default()
            }
            .is_valid()
        );
        assert!(
            !Viewport {
                zoom: 0.0,
                ..Viewport::default()
            }
            .is_valid()
        );
        assert!(
            !Viewport {
                zoom: f64::INFINITY,
                ..Viewport::default()
            }
            .is_valid()
        );
    }

    #[test]
    fn node_data_keeps_unknown_keys() {
        let raw = json!({
            "label": "Review",
            "locked": true,
            "taskId": "task-7",
            "icon": "flag",
            "color": {"fill": "#fff"}
        });
        let data: NodeData = serde_json::from_value(raw.clone()).expect("valid node data");
        assert_eq!(data.label, "Review");
        assert!(data.locked);
        assert_eq!(data.task_id.as_deref(), Some("task-7"));
        assert_eq!(data.extra.get("icon"), Some(&json!("flag")));

        let back = serde_json::to_value(&data).expect("serializable");
        assert_eq!(back, raw);
    }

    #[test]
    fn node_type_db_values_are_stable() {
        for kind in [
            NodeType::Rectangle,
            NodeType::Rounded,
            NodeType::Diamond,
            NodeType::Circle,
            NodeType::Parallelogram,
            NodeType::Hexagon,
            NodeType::Cylinder,
            NodeType::Document,
            NodeType::Note,
            NodeType::Task,
        ] {
            assert_eq!(NodeType::from_db_value(kind.as_db_value()), Some(kind));
        }
        assert_eq!(NodeType::from_db_value("blob"), None);
    }

    #[test]
    fn edge_defaults_apply_when_deserializing() {
        let edge: Edge = serde_json::from_value(json!({
            "id": "e1",
            "source": "a",
            "target": "b"
        }))
        .expect("minimal edge");
        assert_eq!(edge.edge_type, DEFAULT_EDGE_TYPE);
        assert!(!edge.animated);
        assert!(edge.label.is_none());
    }

    #[test]
    fn pagination_clamps_values() {
        let query = ListDocumentsQuery {
            page: Some(0),
            limit: Some(1_000),
        };
        assert_eq!(query.pagination(), (1, 200));
        assert_eq!(ListDocumentsQuery::default().pagination(), (1, 25));
    }
}
