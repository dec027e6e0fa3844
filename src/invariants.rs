use std::collections::HashSet;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{LibError, Result};
use crate::models::{Edge, EdgeId, Node, NodeId, connection_hash};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentInvariantViolation {
    DuplicateNodeId {
        node_id: NodeId,
    },
    DuplicateEdgeId {
        edge_id: EdgeId,
    },
    UnknownNodeReference {
        edge_id: EdgeId,
        missing_node_id: NodeId,
    },
    StaleConnectionHash {
        edge_id: EdgeId,
    },
}

impl DocumentInvariantViolation {
    pub const fn error_code(&self) -> &'static str {
        match self {
            DocumentInvariantViolation::DuplicateNodeId { .. } => "diagram_duplicate_node",
            DocumentInvariantViolation::DuplicateEdgeId { .. } => "diagram_duplicate_edge",
            DocumentInvariantViolation::UnknownNodeReference { .. } => {
                "diagram_unknown_node_reference"
            }
            DocumentInvariantViolation::StaleConnectionHash { .. } => {
                "diagram_stale_connection_hash"
            }
        }
    }

    pub const fn public_message(&self) -> &'static str {
        match self {
            DocumentInvariantViolation::DuplicateNodeId { .. } => {
                "Node ID already exists in diagram"
            }
            DocumentInvariantViolation::DuplicateEdgeId { .. } => {
                "Edge ID already exists in diagram"
            }
            DocumentInvariantViolation::UnknownNodeReference { .. } => {
                "Edge references a node that does not exist"
            }
            DocumentInvariantViolation::StaleConnectionHash { .. } => {
                "Edge connection hash does not match its endpoints"
            }
        }
    }

    pub fn into_error(self) -> LibError {
        LibError::invalid_with_code(
            self.error_code(),
            self.public_message(),
            anyhow!("diagram invariant violated: {:?}", self),
        )
    }
}

pub fn document_invariant_violations(
    nodes: &[Node],
    edges: &[Edge],
) -> Vec<DocumentInvariantViolation> {
    let mut violations = Vec::new();

    let mut node_ids: HashSet<&NodeId> = HashSet::with_capacity(nodes.len());
    for node in nodes {
        if !node_ids.insert(&node.id) {
            violations.push(DocumentInvariantViolation::DuplicateNodeId {
                node_id: node.id.clone(),
            });
        }
    }

    let mut edge_ids: HashSet<&EdgeId> = HashSet::with_capacity(edges.len());
    for edge in edges {
        if !edge_ids.insert(&edge.id) {
            violations.push(DocumentInvariantViolation::DuplicateEdgeId {
                edge_id: edge.id.clone(),
            });
        }

        for endpoint in [&edge.source, &edge.target] {
            if !node_ids.contains(endpoint) {
                violations.push(DocumentInvariantViolation::UnknownNodeReference {
                    edge_id: edge.id.clone(),
                    missing_node_id: endpoint.clone(),
                });
            }
        }

        if edge.connection_hash != connection_hash(&edge.source, &edge.target, &edge.edge_type) {
            violations.push(DocumentInvariantViolation::StaleConnectionHash {
                edge_id: edge.id.clone(),
            });
        }
    }

    violations
}

pub fn ensure_document_invariants(nodes: &[Node], edges: &[Edge]) -> Result<()> {
    match document_invariant_violations(nodes, edges).into_iter().next() {
        Some(first) => Err(first.into_error()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeData, Position};

    fn node(id: &str) -> Node {
        Node::new(id, Position::new(0.0, 0.0), NodeData::labeled(id))
    }

    #[test]
    fn valid_document_has_no_violations() {
        let violations = document_invariant_violations(
            &[node("a"), node("b")],
            &[Edge::new("e1", "a", "b"), Edge::new("e2", "b", "a")],
        );
        assert!(violations.is_empty());
    }

    #[test]
    fn duplicate_node_ids_are_reported() {
        let violations = document_invariant_violations(&[node("a"), node("a")], &[]);
        assert_eq!(
            violations,
            vec![DocumentInvariantViolation::DuplicateNodeId {
                node_id: NodeId::from("a")
            }]
        );
    }

    #[test]
    fn duplicate_edge_ids_are_reported() {
        let violations = document_invariant_violations(
            &[node("a"), node("b")],
            &[Edge::new("e1", "a", "b"), Edge::new("e1", "b", "a")],
        );
        assert!(
            violations
                .iter()
                .any(|v| matches!(v, DocumentInvariantViolation::DuplicateEdgeId { edge_id } if edge_id.as_str() == "e1"))
        );
    }

    #[test]
    fn unknown_node_references_are_reported() {
        let violations =
            document_invariant_violations(&[node("a")], &[Edge::new("e1", "a", "missing")]);
        assert!(matches!(
            &violations[0],
            DocumentInvariantViolation::UnknownNodeReference {
                edge_id,
                missing_node_id
            } if edge_id.as_str() == "e1" && missing_node_id.as_str() == "missing"
        ));
    }

    #[test]
    fn stale_connection_hash_is_reported() {
        let mut edge = Edge::new("e1", "a", "b");
        edge.edge_type = "step".to_string();
        let violations = document_invariant_violations(&[node("a"), node("b")], &[edge]);
        assert_eq!(
            violations,
            vec![DocumentInvariantViolation::StaleConnectionHash {
                edge_id: EdgeId::from("e1")
            }]
        );
    }

    #[test]
    fn ensure_reports_first_violation_code() {
        let err = ensure_document_invariants(&[node("a")], &[Edge::new("e1", "a", "b")])
            .expect_err("dangling edge should fail");
        assert_eq!(err.code, "diagram_unknown_node_reference");
    }
}
