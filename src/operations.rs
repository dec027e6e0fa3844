use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::algorithms::would_create_cycle;
use crate::db;
use crate::error::{LibError, Result};
use crate::layout::{self, LayoutOptions};
use crate::models::{
    CreateDocumentPayload, Document, DocumentId, DocumentSummary, ListDocumentsQuery, NodeId,
    Paged, TaskLink, TaskReference,
};
use crate::patch::DiagramPatch;

fn default_respect_locks() -> bool {
    true
}

/// Tool-friendly high-level diagram actions.
///
/// Layout and snap only compute patches; callers apply them with `Apply` so
/// they can be undone like any other edit.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum DiagramOperation {
    Create {
        payload: CreateDocumentPayload,
    },
    Get {
        document_id: DocumentId,
    },
    List {
        #[serde(default)]
        query: ListDocumentsQuery,
    },
    Apply {
        document_id: DocumentId,
        patches: Vec<DiagramPatch>,
    },
    Delete {
        document_id: DocumentId,
    },
    Layout {
        document_id: DocumentId,
        #[serde(default)]
        options: LayoutOptions,
    },
    SnapToGrid {
        document_id: DocumentId,
        grid_size: f64,
        #[serde(default = "default_respect_locks")]
        respect_locks: bool,
    },
    CheckConnection {
        document_id: DocumentId,
        source: NodeId,
        target: NodeId,
    },
    LinkTask {
        document_id: DocumentId,
        task_id: String,
    },
    UnlinkTask {
        document_id: DocumentId,
        task_id: String,
    },
    FindTaskReferences {
        task_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DiagramOperationResult {
    Document {
        document: Document,
    },
    DocumentsPage {
        page: u32,
        limit: u32,
        items: Vec<DocumentSummary>,
    },
    Patches {
        patches: Vec<DiagramPatch>,
    },
    Connection {
        would_create_cycle: bool,
    },
    TaskLink {
        link: TaskLink,
    },
    TaskUnlinked {
        removed: bool,
    },
    TaskReferences {
        references: Vec<TaskReference>,
    },
    Deleted,
}

#[derive(Clone)]
pub struct DiagramOperations {
    pool: Arc<SqlitePool>,
}

impl DiagramOperations {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    pub fn from_pool(pool: &SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool.clone()),
        }
    }

    pub fn pool(&self) -> Arc<SqlitePool> {
        Arc::clone(&self.pool)
    }

    pub async fn execute(&self, operation: DiagramOperation) -> Result<DiagramOperationResult> {
        match operation {
            DiagramOperation::Create { payload } => {
                let document = self.create_document(payload).await?;
                Ok(DiagramOperationResult::Document { document })
            }
            DiagramOperation::Get { document_id } => {
                let document = self.get_document(document_id).await?;
                Ok(DiagramOperationResult::Document { document })
            }
            DiagramOperation::List { query } => {
                let page = self.list_documents(query).await?;
                Ok(DiagramOperationResult::DocumentsPage {
                    page: page.page,
                    limit: page.limit,
                    items: page.items,
                })
            }
            DiagramOperation::Apply {
                document_id,
                patches,
            } => {
                let document = self.apply_patches(document_id, &patches).await?;
                Ok(DiagramOperationResult::Document { document })
            }
            DiagramOperation::Delete { document_id } => {
                self.delete_document(document_id).await?;
                Ok(DiagramOperationResult::Deleted)
            }
            DiagramOperation::Layout {
                document_id,
                options,
            } => {
                let patches = self.layout(document_id, &options).await?;
                Ok(DiagramOperationResult::Patches { patches })
            }
            DiagramOperation::SnapToGrid {
                document_id,
                grid_size,
                respect_locks,
            } => {
                let patches = self
                    .snap_to_grid(document_id, grid_size, respect_locks)
                    .await?;
                Ok(DiagramOperationResult::Patches { patches })
            }
            DiagramOperation::CheckConnection {
                document_id,
                source,
                target,
            } => {
                let would_create_cycle =
                    self.check_connection(document_id, &source, &target).await?;
                Ok(DiagramOperationResult::Connection { would_create_cycle })
            }
            DiagramOperation::LinkTask {
                document_id,
                task_id,
            } => {
                let link = self.link_task(document_id, &task_id).await?;
                Ok(DiagramOperationResult::TaskLink { link })
            }
            DiagramOperation::UnlinkTask {
                document_id,
                task_id,
            } => {
                let removed = self.unlink_task(document_id, &task_id).await?;
                Ok(DiagramOperationResult::TaskUnlinked { removed })
            }
            DiagramOperation::FindTaskReferences { task_id } => {
                let references = self.find_task_references(&task_id).await?;
                Ok(DiagramOperationResult::TaskReferences { references })
            }
        }
    }

    pub async fn create_document(&self, payload: CreateDocumentPayload) -> Result<Document> {
        db::create_document(&self.pool, payload).await
    }

    /// Unlike [`db::get_document`], a missing document is an error here.
    pub async fn get_document(&self, document_id: DocumentId) -> Result<Document> {
        db::get_document(&self.pool, document_id)
            .await?
            .ok_or_else(|| {
                LibError::not_found(
                    "Diagram not found",
                    anyhow!("diagram {} not found", document_id),
                )
            })
    }

    pub async fn list_documents(&self, query: ListDocumentsQuery) -> Result<Paged<DocumentSummary>> {
        let (page, limit) = query.pagination();
        let items = db::list_documents(&self.pool, page, limit).await?;
        Ok(Paged { page, limit, items })
    }

    pub async fn apply_patches(
        &self,
        document_id: DocumentId,
        patches: &[DiagramPatch],
    ) -> Result<Document> {
        db::apply_patches(&self.pool, document_id, patches).await
    }

    pub async fn delete_document(&self, document_id: DocumentId) -> Result<()> {
        db::delete_document(&self.pool, document_id).await
    }

    pub async fn layout(
        &self,
        document_id: DocumentId,
        options: &LayoutOptions,
    ) -> Result<Vec<DiagramPatch>> {
        let document = self.get_document(document_id).await?;
        layout::layout_patches(&document.nodes, &document.edges, options)
    }

    pub async fn snap_to_grid(
        &self,
        document_id: DocumentId,
        grid_size: f64,
        respect_locks: bool,
    ) -> Result<Vec<DiagramPatch>> {
        let document = self.get_document(document_id).await?;
        layout::snap_to_grid(&document.nodes, grid_size, respect_locks)
    }

    /// Whether connecting `source -> target` would close a cycle in the
    /// stored diagram.
    pub async fn check_connection(
        &self,
        document_id: DocumentId,
        source: &NodeId,
        target: &NodeId,
    ) -> Result<bool> {
        let document = self.get_document(document_id).await?;
        Ok(would_create_cycle(&document.edges, source, target))
    }

    pub async fn link_task(&self, document_id: DocumentId, task_id: &str) -> Result<TaskLink> {
        db::link_task(&self.pool, document_id, task_id).await
    }

    pub async fn unlink_task(&self, document_id: DocumentId, task_id: &str) -> Result<bool> {
        db::unlink_task(&self.pool, document_id, task_id).await
    }

    pub async fn find_task_references(&self, task_id: &str) -> Result<Vec<TaskReference>> {
        db::find_task_references(&self.pool, task_id).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{Edge, Node, NodeData, Position};

    async fn operations() -> DiagramOperations {
        let pool = db::DiagramStoreConfig::in_memory()
            .connect()
            .await
            .expect("in-memory database should open");
        db::create_diagram_tables(&pool)
            .await
            .expect("migrations should run");
        DiagramOperations::from_pool(&pool)
    }

    fn node_at(id: &str, x: f64, y: f64) -> Node {
        Node::new(id, Position::new(x, y), NodeData::labeled(id))
    }

    async fn stacked(ops: &DiagramOperations) -> Document {
        ops.create_document(CreateDocumentPayload {
            name: "Stacked".to_string(),
            description: None,
            viewport: None,
            nodes: vec![node_at("A", 0.0, 0.0), node_at("B", 0.0, 0.0)],
            edges: vec![Edge::new("A-B", "A", "B")],
        })
        .await
        .expect("create should succeed")
    }

    #[test]
    fn operations_use_tagged_wire_format() {
        let operation: DiagramOperation = serde_json::from_value(json!({
            "operation": "snap_to_grid",
            "document_id": "7f1d2e6a-3c1b-4f7a-9d8e-0a1b2c3d4e5f",
            "grid_size": 20.0
        }))
        .expect("valid operation");
        assert!(matches!(
            operation,
            DiagramOperation::SnapToGrid {
                respect_locks: true,
                ..
            }
        ));

        let operation: DiagramOperation = serde_json::from_value(json!({"operation": "list"}))
            .expect("list without query");
        assert!(matches!(operation, DiagramOperation::List { .. }));

        let result = serde_json::to_value(DiagramOperationResult::Connection {
            would_create_cycle: true,
        })
        .expect("serializable");
        assert_eq!(
            result,
            json!({"result": "connection", "would_create_cycle": true})
        );
    }

    #[tokio::test]
    async fn layout_returns_patches_without_applying_them() {
        let ops = operations().await;
        let document = stacked(&ops).await;

        let result = ops
            .execute(DiagramOperation::Layout {
                document_id: document.id,
                options: LayoutOptions::default(),
            })
            .await
            .expect("layout should succeed");
        let DiagramOperationResult::Patches { patches } = result else {
            panic!("expected patches");
        };
        assert_eq!(
            patches,
            vec![DiagramPatch::move_node(
                NodeId::from("B"),
                Position::new(0.0, 180.0)
            )]
        );

        let unchanged = ops.get_document(document.id).await.expect("load");
        assert_eq!(unchanged.nodes[1].position, Position::new(0.0, 0.0));

        let applied = ops
            .apply_patches(document.id, &patches)
            .await
            .expect("apply should succeed");
        assert_eq!(applied.nodes[1].position, Position::new(0.0, 180.0));

        let again = ops
            .layout(document.id, &LayoutOptions::default())
            .await
            .expect("layout should succeed");
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn check_connection_uses_stored_edges() {
        let ops = operations().await;
        let document = stacked(&ops).await;

        let closes = ops
            .check_connection(document.id, &NodeId::from("B"), &NodeId::from("A"))
            .await
            .expect("check should succeed");
        assert!(closes);

        let result = ops
            .execute(DiagramOperation::CheckConnection {
                document_id: document.id,
                source: NodeId::from("A"),
                target: NodeId::from("B"),
            })
            .await
            .expect("check should succeed");
        assert!(matches!(
            result,
            DiagramOperationResult::Connection {
                would_create_cycle: false
            }
        ));
    }

    #[tokio::test]
    async fn missing_document_is_not_found() {
        let ops = operations().await;
        let err = ops
            .execute(DiagramOperation::Get {
                document_id: DocumentId::default(),
            })
            .await
            .expect_err("missing document should fail");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn list_pages_are_clamped() {
        let ops = operations().await;
        stacked(&ops).await;
        let result = ops
            .execute(DiagramOperation::List {
                query: ListDocumentsQuery {
                    page: Some(0),
                    limit: Some(500),
                },
            })
            .await
            .expect("list should succeed");
        let DiagramOperationResult::DocumentsPage { page, limit, items } = result else {
            panic!("expected a page");
        };
        assert_eq!((page, limit, items.len()), (1, 200, 1));
    }

    #[tokio::test]
    async fn task_operations_round_trip() {
        let ops = operations().await;
        let document = stacked(&ops).await;

        ops.execute(DiagramOperation::LinkTask {
            document_id: document.id,
            task_id: "task-1".to_string(),
        })
        .await
        .expect("link should succeed");

        let references = ops
            .find_task_references("task-1")
            .await
            .expect("lookup should succeed");
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].node_id, None);

        let result = ops
            .execute(DiagramOperation::UnlinkTask {
                document_id: document.id,
                task_id: "task-1".to_string(),
            })
            .await
            .expect("unlink should succeed");
        assert!(matches!(
            result,
            DiagramOperationResult::TaskUnlinked { removed: true }
        ));
    }
}
