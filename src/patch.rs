//! Edit patches and the pure in-memory applier.
//!
//! A batch is applied as a left fold over its patches. The input document is
//! never modified, so a batch that fails part-way leaves the caller's state
//! exactly as it was.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LibError, Result};
use crate::invariants::DocumentInvariantViolation;
use crate::models::{
    Document, Edge, EdgeId, Node, NodeData, NodeId, NodeType, Position, Viewport, double_option,
};
use crate::recovery::PositionRecovery;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DiagramPatch {
    AddNode { node: Node },
    UpdateNode { id: NodeId, changes: NodeChanges },
    RemoveNode { id: NodeId },
    AddEdge { edge: Edge },
    UpdateEdge { id: EdgeId, changes: EdgeChanges },
    RemoveEdge { id: EdgeId },
    UpdateViewport { viewport: Viewport },
    UpdateMetadata { changes: MetadataChanges },
}

impl DiagramPatch {
    pub const fn kind(&self) -> &'static str {
        match self {
            DiagramPatch::AddNode { .. } => "add_node",
            DiagramPatch::UpdateNode { .. } => "update_node",
            DiagramPatch::RemoveNode { .. } => "remove_node",
            DiagramPatch::AddEdge { .. } => "add_edge",
            DiagramPatch::UpdateEdge { .. } => "update_edge",
            DiagramPatch::RemoveEdge { .. } => "remove_edge",
            DiagramPatch::UpdateViewport { .. } => "update_viewport",
            DiagramPatch::UpdateMetadata { .. } => "update_metadata",
        }
    }

    pub fn move_node(id: NodeId, position: Position) -> Self {
        DiagramPatch::UpdateNode {
            id,
            changes: NodeChanges {
                position: Some(position),
                ..NodeChanges::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<NodeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<NodeData>,
}

/// Partial edge update. Double options distinguish "absent" (`None`) from
/// "clear the field" (`Some(None)`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EdgeChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<NodeId>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_handle: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_handle: Option<Option<String>>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub edge_type: Option<String>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub label: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub label_style: Option<Option<Value>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub style: Option<Option<Value>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub marker_start: Option<Option<Value>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub marker_end: Option<Option<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animated: Option<bool>,
}

impl EdgeChanges {
    fn merge_into(&self, edge: &mut Edge) {
        if let Some(source) = &self.source {
            edge.source = source.clone();
        }
        if let Some(target) = &self.target {
            edge.target = target.clone();
        }
        if let Some(handle) = &self.source_handle {
            edge.source_handle = handle.clone();
        }
        if let Some(handle) = &self.target_handle {
            edge.target_handle = handle.clone();
        }
        if let Some(edge_type) = &self.edge_type {
            edge.edge_type = edge_type.clone();
        }
        if let Some(label) = &self.label {
            edge.label = label.clone();
        }
        if let Some(label_style) = &self.label_style {
            edge.label_style = label_style.clone();
        }
        if let Some(style) = &self.style {
            edge.style = style.clone();
        }
        if let Some(marker) = &self.marker_start {
            edge.marker_start = marker.clone();
        }
        if let Some(marker) = &self.marker_end {
            edge.marker_end = marker.clone();
        }
        if let Some(animated) = self.animated {
            edge.animated = animated;
        }
        edge.refresh_connection_hash();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetadataChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<Option<String>>,
}

pub fn apply_patches(document: &Document, patches: &[DiagramPatch]) -> Result<Document> {
    patches
        .iter()
        .try_fold(document.clone(), |document, patch| apply_patch(document, patch))
}

pub fn apply_patch(mut document: Document, patch: &DiagramPatch) -> Result<Document> {
    match patch {
        DiagramPatch::AddNode { node } => {
            if document.contains_node(&node.id) {
                return Err(DocumentInvariantViolation::DuplicateNodeId {
                    node_id: node.id.clone(),
                }
                .into_error());
            }
            let mut node = node.clone();
            if !node.position.is_valid() {
                let mut recovery =
                    PositionRecovery::with_placed(document.nodes.iter().map(|n| n.position));
                let recovered = recovery.recover();
                tracing::warn!(
                    document_id = %document.id,
                    node_id = %node.id,
                    x = node.position.x,
                    y = node.position.y,
                    "added node carried an invalid position; placing it on a free grid cell"
                );
                node.position = recovered;
            }
            document.insert_node(node);
        }
        DiagramPatch::UpdateNode { id, changes } => {
            let document_id = document.id;
            let Some(node) = document.nodes.iter_mut().find(|node| &node.id == id) else {
                tracing::debug!(document_id = %document_id, node_id = %id, "update for unknown node ignored");
                return Ok(document);
            };
            if let Some(position) = changes.position {
                if position.is_valid() {
                    node.position = position;
                } else {
                    tracing::warn!(
                        document_id = %document_id,
                        node_id = %id,
                        x = position.x,
                        y = position.y,
                        "dropping invalid position update"
                    );
                }
            }
            if let Some(node_type) = changes.node_type {
                node.node_type = node_type;
            }
            if let Some(data) = &changes.data {
                node.data = data.clone();
            }
        }
        DiagramPatch::RemoveNode { id } => {
            document.nodes.retain(|node| &node.id != id);
            document.edges.retain(|edge| !edge.touches(id));
        }
        DiagramPatch::AddEdge { edge } => {
            if document.edge(&edge.id).is_some() {
                return Err(DocumentInvariantViolation::DuplicateEdgeId {
                    edge_id: edge.id.clone(),
                }
                .into_error());
            }
            let mut edge = edge.clone();
            edge.refresh_connection_hash();
            ensure_endpoints(&document, &edge)?;
            document.insert_edge(edge);
        }
        DiagramPatch::UpdateEdge { id, changes } => {
            let Some(index) = document.edges.iter().position(|edge| &edge.id == id) else {
                tracing::debug!(document_id = %document.id, edge_id = %id, "update for unknown edge ignored");
                return Ok(document);
            };
            let mut edge = document.edges[index].clone();
            changes.merge_into(&mut edge);
            ensure_endpoints(&document, &edge)?;
            document.edges[index] = edge;
        }
        DiagramPatch::RemoveEdge { id } => {
            document.edges.retain(|edge| &edge.id != id);
        }
        DiagramPatch::UpdateViewport { viewport } => {
            if viewport.is_valid() {
                document.viewport = *viewport;
            } else {
                tracing::warn!(
                    document_id = %document.id,
                    x = viewport.x,
                    y = viewport.y,
                    zoom = viewport.zoom,
                    "dropping invalid viewport update"
                );
            }
        }
        DiagramPatch::UpdateMetadata { changes } => {
            if let Some(name) = &changes.name {
                document.name = normalize_name(name)?;
            }
            if let Some(description) = &changes.description {
                document.description = description.clone();
            }
        }
    }

    Ok(document)
}

pub(crate) fn normalize_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(LibError::invalid(
            "Diagram name is required",
            anyhow!("empty diagram name"),
        ));
    }
    Ok(name.to_string())
}

fn ensure_endpoints(document: &Document, edge: &Edge) -> Result<()> {
    for endpoint in [&edge.source, &edge.target] {
        if !document.contains_node(endpoint) {
            return Err(DocumentInvariantViolation::UnknownNodeReference {
                edge_id: edge.id.clone(),
                missing_node_id: endpoint.clone(),
            }
            .into_error());
        }
    }
    Ok(())
}
