use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::db;
use crate::error::{ErrorKind, LibError};
use crate::inverse::{PreImage, invert_batch};
use crate::layout::LayoutOptions;
use crate::models::{CreateDocumentPayload, DocumentId, ListDocumentsQuery, NodeId, Paged};
use crate::operations::DiagramOperations;
use crate::patch::DiagramPatch;

#[derive(Debug)]
pub struct AppError(pub LibError);

impl From<LibError> for AppError {
    fn from(value: LibError) -> Self {
        Self(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::Database => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::error!(
            kind = ?self.0.kind,
            code = self.0.code,
            error = %self.0.source,
            "diagram api request failed"
        );
        (status, self.0.public).into_response()
    }
}

pub trait HasPool {
    fn pool(&self) -> Arc<sqlx::SqlitePool>;
}

pub trait DiagramApp: HasPool {
    /// Used by the layout route when the request has no JSON body.
    fn default_layout_options(&self) -> LayoutOptions {
        LayoutOptions::default()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapPayload {
    pub grid_size: f64,
    #[serde(default = "default_true")]
    pub respect_locks: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCheckPayload {
    pub source: NodeId,
    pub target: NodeId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCheck {
    pub would_create_cycle: bool,
}

/// One applied patch together with the pre-image captured before it ran.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedPatch {
    pub patch: DiagramPatch,
    #[serde(default)]
    pub pre_image: Option<PreImage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvertPayload {
    pub patches: Vec<RecordedPatch>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchBatch {
    pub patches: Vec<DiagramPatch>,
}

async fn create_document_handler<S>(
    State(app): State<S>,
    Json(payload): Json<CreateDocumentPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: DiagramApp + Clone + Send + Sync + 'static,
{
    let document = db::create_document(&app.pool(), payload).await?;
    Ok((StatusCode::CREATED, Json(document)))
}

async fn list_documents_handler<S>(
    State(app): State<S>,
    Query(query): Query<ListDocumentsQuery>,
) -> Result<impl IntoResponse, AppError>
where
    S: DiagramApp + Clone + Send + Sync + 'static,
{
    let (page, limit) = query.pagination();
    let documents = db::list_documents(&app.pool(), page, limit).await?;
    Ok(Json(Paged {
        page,
        limit,
        items: documents,
    }))
}

async fn get_document_handler<S>(
    State(app): State<S>,
    Path(document_id): Path<DocumentId>,
) -> Result<impl IntoResponse, AppError>
where
    S: DiagramApp + Clone + Send + Sync + 'static,
{
    let document = DiagramOperations::new(app.pool())
        .get_document(document_id)
        .await?;
    Ok(Json(document))
}

async fn delete_document_handler<S>(
    State(app): State<S>,
    Path(document_id): Path<DocumentId>,
) -> Result<impl IntoResponse, AppError>
where
    S: DiagramApp + Clone + Send + Sync + 'static,
{
    db::delete_document(&app.pool(), document_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn apply_patches_handler<S>(
    State(app): State<S>,
    Path(document_id): Path<DocumentId>,
    Json(patches): Json<Vec<DiagramPatch>>,
) -> Result<impl IntoResponse, AppError>
where
    S: DiagramApp + Clone + Send + Sync + 'static,
{
    let document = db::apply_patches(&app.pool(), document_id, &patches).await?;
    Ok(Json(document))
}

async fn layout_handler<S>(
    State(app): State<S>,
    Path(document_id): Path<DocumentId>,
    options: Option<Json<LayoutOptions>>,
) -> Result<impl IntoResponse, AppError>
where
    S: DiagramApp + Clone + Send + Sync + 'static,
{
    let options = options
        .map(|Json(options)| options)
        .unwrap_or_else(|| app.default_layout_options());
    let patches = DiagramOperations::new(app.pool())
        .layout(document_id, &options)
        .await?;
    Ok(Json(PatchBatch { patches }))
}

async fn snap_handler<S>(
    State(app): State<S>,
    Path(document_id): Path<DocumentId>,
    Json(payload): Json<SnapPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: DiagramApp + Clone + Send + Sync + 'static,
{
    let patches = DiagramOperations::new(app.pool())
        .snap_to_grid(document_id, payload.grid_size, payload.respect_locks)
        .await?;
    Ok(Json(PatchBatch { patches }))
}

async fn connection_check_handler<S>(
    State(app): State<S>,
    Path(document_id): Path<DocumentId>,
    Json(payload): Json<ConnectionCheckPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: DiagramApp + Clone + Send + Sync + 'static,
{
    let would_create_cycle = DiagramOperations::new(app.pool())
        .check_connection(document_id, &payload.source, &payload.target)
        .await?;
    Ok(Json(ConnectionCheck { would_create_cycle }))
}

async fn invert_handler(
    Json(payload): Json<InvertPayload>,
) -> Result<Json<PatchBatch>, AppError> {
    let recorded = payload
        .patches
        .into_iter()
        .map(|recorded| (recorded.patch, recorded.pre_image))
        .collect::<Vec<_>>();

    let patches =
        invert_batch(&recorded).ok_or_else(|| LibError::inversion_unavailable(recorded.len()))?;
    Ok(Json(PatchBatch { patches }))
}

pub fn routes<S>() -> Router<S>
where
    S: DiagramApp + Clone + Send + Sync + 'static,
{
    tracing::info!("Registering route /diagram [GET,POST]");
    tracing::info!("Registering route /diagram/invert [POST]");
    tracing::info!("Registering route /diagram/{{document_id}} [GET,DELETE]");
    tracing::info!("Registering route /diagram/{{document_id}}/patches [POST]");
    tracing::info!("Registering route /diagram/{{document_id}}/layout [POST]");
    tracing::info!("Registering route /diagram/{{document_id}}/snap [POST]");
    tracing::info!("Registering route /diagram/{{document_id}}/connection-check [POST]");

    Router::new()
        .route(
            "/diagram",
            get(list_documents_handler::<S>).post(create_document_handler::<S>),
        )
        .route("/diagram/invert", post(invert_handler))
        .route(
            "/diagram/{document_id}",
            get(get_document_handler::<S>).delete(delete_document_handler::<S>),
        )
        .route(
            "/diagram/{document_id}/patches",
            post(apply_patches_handler::<S>),
        )
        .route("/diagram/{document_id}/layout", post(layout_handler::<S>))
        .route("/diagram/{document_id}/snap", post(snap_handler::<S>))
        .route(
            "/diagram/{document_id}/connection-check",
            post(connection_check_handler::<S>),
        )
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;
    use crate::models::Viewport;

    #[test]
    fn error_kinds_map_to_statuses() {
        let cases = [
            (
                LibError::not_found("Diagram not found", anyhow!("missing")),
                StatusCode::NOT_FOUND,
            ),
            (
                LibError::invalid("Diagram name is required", anyhow!("blank")),
                StatusCode::BAD_REQUEST,
            ),
            (
                LibError::database("Failed to query diagram", anyhow!("io")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (LibError::inversion_unavailable(1), StatusCode::CONFLICT),
        ];
        for (error, status) in cases {
            assert_eq!(AppError(error).into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn invert_without_pre_image_is_a_conflict() {
        let payload: InvertPayload = serde_json::from_value(serde_json::json!({
            "patches": [{"patch": {"op": "remove_node", "id": "A"}}]
        }))
        .expect("valid payload");
        let response = invert_handler(Json(payload)).await.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn invert_with_pre_image_succeeds() {
        let payload = InvertPayload {
            patches: vec![RecordedPatch {
                patch: DiagramPatch::UpdateViewport {
                    viewport: Viewport {
                        x: 5.0,
                        y: 5.0,
                        zoom: 2.0,
                    },
                },
                pre_image: Some(PreImage::Viewport {
                    viewport: Viewport::default(),
                }),
            }],
        };
        let Json(batch) = invert_handler(Json(payload))
            .await
            .expect("inverse should be available");
        assert_eq!(
            batch.patches,
            vec![DiagramPatch::UpdateViewport {
                viewport: Viewport::default(),
            }]
        );
    }
}
