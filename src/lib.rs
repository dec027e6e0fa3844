pub mod algorithms;
#[cfg(feature = "api")]
pub mod api;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod invariants;
pub mod inverse;
pub mod layout;
pub mod models;
#[cfg(feature = "sqlx")]
pub mod operations;
pub mod patch;
pub mod recovery;

pub mod prelude {
    pub use crate::algorithms::{adjacency_map, would_create_cycle};
    #[cfg(feature = "api")]
    pub use crate::api::{DiagramApp, HasPool};
    #[cfg(feature = "sqlx")]
    pub use crate::db::{
        DiagramStoreConfig, apply_patches, create_diagram_tables, create_document,
        delete_document, find_task_references, get_document, link_task, list_documents,
        list_task_links, unlink_task,
    };
    pub use crate::error::{ErrorKind, LibError, Result};
    pub use crate::invariants::{DocumentInvariantViolation, ensure_document_invariants};
    pub use crate::inverse::{PreImage, capture_pre_image, invert_batch, invert_patch, record_batch};
    pub use crate::layout::{LayoutOptions, RankDirection, layout_patches, snap_to_grid};
    pub use crate::models::{
        CreateDocumentPayload, Document, DocumentId, DocumentSummary, Edge, EdgeId,
        ListDocumentsQuery, Node, NodeData, NodeId, NodeType, Paged, Position, TaskLink,
        TaskReference, Viewport,
    };
    #[cfg(feature = "sqlx")]
    pub use crate::operations::{DiagramOperation, DiagramOperationResult, DiagramOperations};
    pub use crate::patch::{DiagramPatch, EdgeChanges, MetadataChanges, NodeChanges};
    pub use crate::recovery::PositionRecovery;
}
