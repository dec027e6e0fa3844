//! Undo/redo support: semantic inverses of patches.
//!
//! The inverter keeps no history. Callers capture a [`PreImage`] right before
//! applying a destructive or mutating patch and hand it back when they want
//! the inverse. Without a usable pre-image the inverse is unavailable and the
//! caller should disable the action instead of guessing.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Document, Edge, Node, Viewport};
use crate::patch::{DiagramPatch, EdgeChanges, MetadataChanges, NodeChanges, apply_patch};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PreImage {
    /// A node plus the edges attached to it when the snapshot was taken.
    Node { node: Node, edges: Vec<Edge> },
    Edge { edge: Edge },
    Viewport { viewport: Viewport },
    Metadata {
        name: String,
        description: Option<String>,
    },
}

pub fn capture_pre_image(document: &Document, patch: &DiagramPatch) -> Option<PreImage> {
    match patch {
        DiagramPatch::AddNode { .. } | DiagramPatch::AddEdge { .. } => None,
        DiagramPatch::UpdateNode { id, .. } | DiagramPatch::RemoveNode { id } => {
            document.node(id).map(|node| PreImage::Node {
                node: node.clone(),
                edges: document
                    .edges
                    .iter()
                    .filter(|edge| edge.touches(id))
                    .cloned()
                    .collect(),
            })
        }
        DiagramPatch::UpdateEdge { id, .. } | DiagramPatch::RemoveEdge { id } => document
            .edge(id)
            .map(|edge| PreImage::Edge { edge: edge.clone() }),
        DiagramPatch::UpdateViewport { .. } => Some(PreImage::Viewport {
            viewport: document.viewport,
        }),
        DiagramPatch::UpdateMetadata { .. } => Some(PreImage::Metadata {
            name: document.name.clone(),
            description: document.description.clone(),
        }),
    }
}

/// Inverse of a single patch, or `None` when it cannot be computed.
///
/// Removing a node also removed its edges, so the inverse of `RemoveNode`
/// re-adds the node followed by every edge captured in the pre-image.
pub fn invert_patch(patch: &DiagramPatch, pre_image: Option<&PreImage>) -> Option<Vec<DiagramPatch>> {
    match (patch, pre_image) {
        (DiagramPatch::AddNode { node }, _) => Some(vec![DiagramPatch::RemoveNode {
            id: node.id.clone(),
        }]),
        (DiagramPatch::AddEdge { edge }, _) => Some(vec![DiagramPatch::RemoveEdge {
            id: edge.id.clone(),
        }]),
        (DiagramPatch::RemoveNode { id }, Some(PreImage::Node { node, edges })) if &node.id == id => {
            let mut inverse = Vec::with_capacity(edges.len() + 1);
            inverse.push(DiagramPatch::AddNode { node: node.clone() });
            inverse.extend(
                edges
                    .iter()
                    .map(|edge| DiagramPatch::AddEdge { edge: edge.clone() }),
            );
            Some(inverse)
        }
        (DiagramPatch::UpdateNode { id, changes }, Some(PreImage::Node { node, .. }))
            if &node.id == id =>
        {
            let restored = NodeChanges {
                position: changes.position.map(|_| node.position),
                node_type: changes.node_type.map(|_| node.node_type),
                data: changes.data.as_ref().map(|_| node.data.clone()),
            };
            Some(vec![DiagramPatch::UpdateNode {
                id: id.clone(),
                changes: restored,
            }])
        }
        (DiagramPatch::RemoveEdge { id }, Some(PreImage::Edge { edge })) if &edge.id == id => {
            Some(vec![DiagramPatch::AddEdge { edge: edge.clone() }])
        }
        (DiagramPatch::UpdateEdge { id, changes }, Some(PreImage::Edge { edge })) if &edge.id == id => {
            Some(vec![DiagramPatch::UpdateEdge {
                id: id.clone(),
                changes: restore_edge_fields(changes, edge),
            }])
        }
        (DiagramPatch::UpdateViewport { .. }, Some(PreImage::Viewport { viewport })) => {
            Some(vec![DiagramPatch::UpdateViewport {
                viewport: *viewport,
            }])
        }
        (DiagramPatch::UpdateMetadata { changes }, Some(PreImage::Metadata { name, description })) => {
            Some(vec![DiagramPatch::UpdateMetadata {
                changes: MetadataChanges {
                    name: changes.name.as_ref().map(|_| name.clone()),
                    description: changes.description.as_ref().map(|_| description.clone()),
                },
            }])
        }
        _ => None,
    }
}

fn restore_edge_fields(changes: &EdgeChanges, original: &Edge) -> EdgeChanges {
    EdgeChanges {
        source: changes.source.as_ref().map(|_| original.source.clone()),
        target: changes.target.as_ref().map(|_| original.target.clone()),
        source_handle: changes
            .source_handle
            .as_ref()
            .map(|_| original.source_handle.clone()),
        target_handle: changes
            .target_handle
            .as_ref()
            .map(|_| original.target_handle.clone()),
        edge_type: changes
            .edge_type
            .as_ref()
            .map(|_| original.edge_type.clone()),
        label: changes.label.as_ref().map(|_| original.label.clone()),
        label_style: changes
            .label_style
            .as_ref()
            .map(|_| original.label_style.clone()),
        style: changes.style.as_ref().map(|_| original.style.clone()),
        marker_start: changes
            .marker_start
            .as_ref()
            .map(|_| original.marker_start.clone()),
        marker_end: changes
            .marker_end
            .as_ref()
            .map(|_| original.marker_end.clone()),
        animated: changes.animated.map(|_| original.animated),
    }
}

/// Applies `patches` in order while capturing the pre-image of each one.
pub fn record_batch(
    document: &Document,
    patches: &[DiagramPatch],
) -> Result<(Document, Vec<Option<PreImage>>)> {
    let mut pre_images = Vec::with_capacity(patches.len());
    let mut current = document.clone();
    for patch in patches {
        pre_images.push(capture_pre_image(&current, patch));
        current = apply_patch(current, patch)?;
    }
    Ok((current, pre_images))
}

/// Inverse of a whole batch: each patch inverted, replayed in reverse order.
pub fn invert_batch(recorded: &[(DiagramPatch, Option<PreImage>)]) -> Option<Vec<DiagramPatch>> {
    let mut inverse = Vec::with_capacity(recorded.len());
    for (patch, pre_image) in recorded.iter().rev() {
        inverse.extend(invert_patch(patch, pre_image.as_ref())?);
    }
    Some(inverse)
}
