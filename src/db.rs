use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{LibError, Result};
use crate::invariants::{
    DocumentInvariantViolation, document_invariant_violations, ensure_document_invariants,
};
use crate::models::{
    CreateDocumentPayload, Document, DocumentId, DocumentSummary, Edge, EdgeId, Node, NodeData,
    NodeId, NodeType, Position, TaskLink, TaskReference, Viewport,
};
use crate::patch::{self, DiagramPatch, NodeChanges, normalize_name};
use crate::recovery::PositionRecovery;

pub static MIGRATOR: Lazy<Migrator> = Lazy::new(|| {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
});

pub async fn create_diagram_tables(pool: &SqlitePool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

pub const DEFAULT_DATABASE_URL: &str = "sqlite://flowchart.db";
pub const MEMORY_DATABASE_URL: &str = "sqlite::memory:";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagramStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl Default for DiagramStoreConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl DiagramStoreConfig {
    /// Reads `DIAGRAM_DATABASE_URL` and `DIAGRAM_MAX_CONNECTIONS`, falling back
    /// to the defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("DIAGRAM_DATABASE_URL") {
            if !url.trim().is_empty() {
                config.database_url = url.trim().to_string();
            }
        }
        if let Ok(raw) = std::env::var("DIAGRAM_MAX_CONNECTIONS") {
            config.max_connections = raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|value| *value > 0)
                .ok_or_else(|| {
                    LibError::invalid(
                        "DIAGRAM_MAX_CONNECTIONS must be a positive integer",
                        anyhow!("invalid DIAGRAM_MAX_CONNECTIONS value {:?}", raw),
                    )
                })?;
        }
        Ok(config)
    }

    pub fn in_memory() -> Self {
        Self {
            database_url: MEMORY_DATABASE_URL.to_string(),
            max_connections: 1,
        }
    }

    fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }

    pub async fn connect(&self) -> Result<SqlitePool> {
        let mut options = SqliteConnectOptions::from_str(&self.database_url)
            .map_err(|err| db_err("Invalid diagram database URL", err))?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to `:memory:` is its own database, so the pool must
        // hold on to exactly one.
        let pool_options = if self.is_in_memory() {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options = options.journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new().max_connections(self.max_connections.max(1))
        };

        pool_options
            .connect_with(options)
            .await
            .map_err(|err| db_err("Failed to open diagram database", err))
    }
}

#[derive(Debug, Clone, FromRow)]
struct DocumentRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    viewport: String,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, FromRow)]
struct DocumentSummaryRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
    node_count: i64,
    edge_count: i64,
}

#[derive(Debug, Clone, FromRow)]
struct NodeRow {
    id: String,
    node_type: String,
    position: String,
    data: String,
}

#[derive(Debug, Clone, FromRow)]
struct EdgeRow {
    id: String,
    source: String,
    target: String,
    source_handle: Option<String>,
    target_handle: Option<String>,
    edge_type: String,
    label: Option<String>,
    label_style: Option<String>,
    style: Option<String>,
    marker_start: Option<String>,
    marker_end: Option<String>,
    animated: bool,
    connection_hash: String,
}

#[derive(Debug, Clone, FromRow)]
struct TaskLinkRow {
    document_id: Uuid,
    task_id: String,
    created_at: NaiveDateTime,
}

impl From<DocumentSummaryRow> for DocumentSummary {
    fn from(value: DocumentSummaryRow) -> Self {
        Self {
            id: DocumentId(value.id),
            name: value.name,
            description: value.description,
            created_at: value.created_at,
            updated_at: value.updated_at,
            node_count: value.node_count,
            edge_count: value.edge_count,
        }
    }
}

impl From<TaskLinkRow> for TaskLink {
    fn from(value: TaskLinkRow) -> Self {
        Self {
            document_id: DocumentId(value.document_id),
            task_id: value.task_id,
            created_at: value.created_at,
        }
    }
}

fn hydrate_document(row: DocumentRow, nodes: Vec<NodeRow>, edges: Vec<EdgeRow>) -> Document {
    let document_id = DocumentId(row.id);
    let viewport = serde_json::from_str::<Viewport>(&row.viewport).unwrap_or_else(|err| {
        warn!(
            document_id = %document_id,
            error = %err,
            "malformed viewport; using default"
        );
        Viewport::default()
    });

    // One recovery pass per load: corrupt rows are placed around the nodes
    // read before them, in id order.
    let mut recovery = PositionRecovery::new();
    let nodes = nodes
        .into_iter()
        .map(|node| hydrate_node(document_id, node, &mut recovery))
        .collect::<Vec<_>>();
    let mut edges = edges
        .into_iter()
        .map(|edge| hydrate_edge(document_id, edge))
        .collect::<Vec<_>>();

    // Violations in stored rows are reported; fingerprints are then recomputed
    // from the endpoints.
    for violation in document_invariant_violations(&nodes, &edges) {
        warn!(
            document_id = %document_id,
            code = violation.error_code(),
            violation = ?violation,
            "stored diagram violates a document invariant"
        );
    }
    for edge in &mut edges {
        edge.refresh_connection_hash();
    }

    Document {
        id: document_id,
        name: row.name,
        description: row.description,
        viewport,
        created_at: row.created_at,
        updated_at: row.updated_at,
        nodes,
        edges,
    }
}

fn hydrate_node(document_id: DocumentId, row: NodeRow, recovery: &mut PositionRecovery) -> Node {
    let node_type = NodeType::from_db_value(&row.node_type).unwrap_or_else(|| {
        warn!(
            document_id = %document_id,
            node_id = %row.id,
            node_type = %row.node_type,
            "unknown node type; using default shape"
        );
        NodeType::default()
    });

    let data = serde_json::from_str::<NodeData>(&row.data).unwrap_or_else(|err| {
        warn!(
            document_id = %document_id,
            node_id = %row.id,
            error = %err,
            "malformed node data; using empty payload"
        );
        NodeData::default()
    });

    let position = match parse_position(&row.position) {
        Ok(position) => {
            recovery.observe(position);
            position
        }
        Err(reason) => {
            let recovered = recovery.recover();
            warn!(
                document_id = %document_id,
                node_id = %row.id,
                reason,
                x = recovered.x,
                y = recovered.y,
                "recovered corrupt node position"
            );
            recovered
        }
    };

    Node {
        id: NodeId(row.id),
        node_type,
        position,
        data,
    }
}

fn parse_position(raw: &str) -> std::result::Result<Position, &'static str> {
    let value: Value = serde_json::from_str(raw).map_err(|_| "malformed json")?;
    let coordinate = |axis: &str| value.get(axis).and_then(Value::as_f64);
    let (Some(x), Some(y)) = (coordinate("x"), coordinate("y")) else {
        return Err("missing or non-numeric coordinate");
    };
    let position = Position::new(x, y);
    if position.is_valid() {
        Ok(position)
    } else {
        Err("coordinate out of range")
    }
}

fn hydrate_edge(document_id: DocumentId, row: EdgeRow) -> Edge {
    let blob = |column: &'static str, raw: Option<String>| -> Option<Value> {
        let raw = raw?;
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Null) => None,
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    document_id = %document_id,
                    edge_id = %row.id,
                    column,
                    error = %err,
                    "malformed edge style column; dropping it"
                );
                None
            }
        }
    };

    let label_style = blob("label_style", row.label_style);
    let style = blob("style", row.style);
    let marker_start = blob("marker_start", row.marker_start);
    let marker_end = blob("marker_end", row.marker_end);

    Edge {
        id: EdgeId(row.id),
        source: NodeId(row.source),
        target: NodeId(row.target),
        source_handle: row.source_handle,
        target_handle: row.target_handle,
        edge_type: row.edge_type,
        label: row.label,
        label_style,
        style,
        marker_start,
        marker_end,
        animated: row.animated,
        connection_hash: row.connection_hash,
    }
}

fn db_err(public: &'static str, err: sqlx::Error) -> LibError {
    LibError::database(public, anyhow!(err))
}

/// Primary-key conflicts surface as the matching invariant violation rather
/// than a storage failure.
fn write_err(
    public: &'static str,
    conflict: DocumentInvariantViolation,
    err: sqlx::Error,
) -> LibError {
    let is_conflict = err
        .as_database_error()
        .is_some_and(|db| db.is_unique_violation());
    if is_conflict {
        conflict.into_error()
    } else {
        db_err(public, err)
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(LibError::serialization)
}

fn optional_json(value: &Option<Value>) -> Result<Option<String>> {
    value.as_ref().map(to_json).transpose()
}

fn not_found(document_id: DocumentId) -> LibError {
    LibError::not_found(
        "Diagram not found",
        anyhow!("diagram {} not found", document_id),
    )
}

async fn document_exists(conn: &mut SqliteConnection, document_id: DocumentId) -> Result<bool> {
    let exists: (bool,) = sqlx::query_as(
        r#"
        SELECT EXISTS(
            SELECT 1
            FROM diagram_documents
            WHERE id = ?
        )
        "#,
    )
    .bind(document_id.0)
    .fetch_one(&mut *conn)
    .await
    .map_err(|err| db_err("Failed to query diagram", err))?;

    Ok(exists.0)
}

async fn load_document(
    conn: &mut SqliteConnection,
    document_id: DocumentId,
) -> Result<Option<Document>> {
    let row = sqlx::query_as::<_, DocumentRow>(
        r#"
        SELECT id, name, description, viewport, created_at, updated_at
        FROM diagram_documents
        WHERE id = ?
        "#,
    )
    .bind(document_id.0)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|err| db_err("Failed to query diagram", err))?;

    let Some(row) = row else {
        return Ok(None);
    };

    let nodes = sqlx::query_as::<_, NodeRow>(
        r#"
        SELECT id, node_type, position, data
        FROM diagram_nodes
        WHERE document_id = ?
        ORDER BY id ASC
        "#,
    )
    .bind(document_id.0)
    .fetch_all(&mut *conn)
    .await
    .map_err(|err| db_err("Failed to query diagram nodes", err))?;

    let edges = sqlx::query_as::<_, EdgeRow>(
        r#"
        SELECT
            id,
            source,
            target,
            source_handle,
            target_handle,
            edge_type,
            label,
            label_style,
            style,
            marker_start,
            marker_end,
            animated,
            connection_hash
        FROM diagram_edges
        WHERE document_id = ?
        ORDER BY id ASC
        "#,
    )
    .bind(document_id.0)
    .fetch_all(&mut *conn)
    .await
    .map_err(|err| db_err("Failed to query diagram edges", err))?;

    Ok(Some(hydrate_document(row, nodes, edges)))
}

async fn insert_node(conn: &mut SqliteConnection, document_id: DocumentId, node: &Node) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO diagram_nodes (document_id, id, node_type, position, data)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(document_id.0)
    .bind(node.id.as_str())
    .bind(node.node_type.as_db_value())
    .bind(to_json(&node.position)?)
    .bind(to_json(&node.data)?)
    .execute(&mut *conn)
    .await
    .map_err(|err| {
        write_err(
            "Failed to write diagram node",
            DocumentInvariantViolation::DuplicateNodeId {
                node_id: node.id.clone(),
            },
            err,
        )
    })?;

    Ok(())
}

async fn insert_edge(conn: &mut SqliteConnection, document_id: DocumentId, edge: &Edge) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO diagram_edges (
            document_id,
            id,
            source,
            target,
            source_handle,
            target_handle,
            edge_type,
            label,
            label_style,
            style,
            marker_start,
            marker_end,
            animated,
            connection_hash
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(document_id.0)
    .bind(edge.id.as_str())
    .bind(edge.source.as_str())
    .bind(edge.target.as_str())
    .bind(edge.source_handle.as_deref())
    .bind(edge.target_handle.as_deref())
    .bind(&edge.edge_type)
    .bind(edge.label.as_deref())
    .bind(optional_json(&edge.label_style)?)
    .bind(optional_json(&edge.style)?)
    .bind(optional_json(&edge.marker_start)?)
    .bind(optional_json(&edge.marker_end)?)
    .bind(edge.animated)
    .bind(&edge.connection_hash)
    .execute(&mut *conn)
    .await
    .map_err(|err| {
        write_err(
            "Failed to write diagram edge",
            DocumentInvariantViolation::DuplicateEdgeId {
                edge_id: edge.id.clone(),
            },
            err,
        )
    })?;

    Ok(())
}

async fn update_edge_row(
    conn: &mut SqliteConnection,
    document_id: DocumentId,
    edge: &Edge,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE diagram_edges
        SET source = ?,
            target = ?,
            source_handle = ?,
            target_handle = ?,
            edge_type = ?,
            label = ?,
            label_style = ?,
            style = ?,
            marker_start = ?,
            marker_end = ?,
            animated = ?,
            connection_hash = ?
        WHERE document_id = ?
          AND id = ?
        "#,
    )
    .bind(edge.source.as_str())
    .bind(edge.target.as_str())
    .bind(edge.source_handle.as_deref())
    .bind(edge.target_handle.as_deref())
    .bind(&edge.edge_type)
    .bind(edge.label.as_deref())
    .bind(optional_json(&edge.label_style)?)
    .bind(optional_json(&edge.style)?)
    .bind(optional_json(&edge.marker_start)?)
    .bind(optional_json(&edge.marker_end)?)
    .bind(edge.animated)
    .bind(&edge.connection_hash)
    .bind(document_id.0)
    .bind(edge.id.as_str())
    .execute(&mut *conn)
    .await
    .map_err(|err| db_err("Failed to update diagram edge", err))?;

    Ok(())
}

/// Writes only the columns present in `changes`. A position that is not
/// finite or out of range is never written; the stored one stays.
async fn update_node_columns(
    conn: &mut SqliteConnection,
    document_id: DocumentId,
    node_id: &NodeId,
    changes: &NodeChanges,
) -> Result<()> {
    let mut assignments: Vec<(&'static str, String)> = Vec::new();
    if let Some(position) = changes.position {
        if position.is_valid() {
            assignments.push(("position", to_json(&position)?));
        } else {
            debug!(
                document_id = %document_id,
                node_id = %node_id,
                "skipping position column write"
            );
        }
    }
    if let Some(node_type) = changes.node_type {
        assignments.push(("node_type", node_type.as_db_value().to_string()));
    }
    if let Some(data) = &changes.data {
        assignments.push(("data", to_json(data)?));
    }
    if assignments.is_empty() {
        return Ok(());
    }

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE diagram_nodes SET ");
    let mut columns = builder.separated(", ");
    for (column, value) in assignments {
        columns.push(column);
        columns.push_unseparated(" = ");
        columns.push_bind_unseparated(value);
    }
    builder.push(" WHERE document_id = ");
    builder.push_bind(document_id.0);
    builder.push(" AND id = ");
    builder.push_bind(node_id.as_str().to_string());

    builder
        .build()
        .execute(&mut *conn)
        .await
        .map_err(|err| db_err("Failed to update diagram node", err))?;

    Ok(())
}

/// Mirrors one patch into the store. `document` is the state after the patch
/// was applied in memory, so recovered positions and recomputed hashes are
/// what gets written.
async fn write_patch(
    conn: &mut SqliteConnection,
    document: &Document,
    patch: &DiagramPatch,
) -> Result<()> {
    let document_id = document.id;
    match patch {
        DiagramPatch::AddNode { node } => match document.node(&node.id) {
            Some(stored) => insert_node(conn, document_id, stored).await,
            None => Ok(()),
        },
        DiagramPatch::UpdateNode { id, changes } => {
            update_node_columns(conn, document_id, id, changes).await
        }
        DiagramPatch::RemoveNode { id } => {
            sqlx::query(
                r#"
                DELETE FROM diagram_nodes
                WHERE document_id = ?
                  AND id = ?
                "#,
            )
            .bind(document_id.0)
            .bind(id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|err| db_err("Failed to remove diagram node", err))?;

            sqlx::query(
                r#"
                DELETE FROM diagram_edges
                WHERE document_id = ?
                  AND (source = ? OR target = ?)
                "#,
            )
            .bind(document_id.0)
            .bind(id.as_str())
            .bind(id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|err| db_err("Failed to remove diagram node edges", err))?;

            Ok(())
        }
        DiagramPatch::AddEdge { edge } => match document.edge(&edge.id) {
            Some(stored) => insert_edge(conn, document_id, stored).await,
            None => Ok(()),
        },
        DiagramPatch::UpdateEdge { id, .. } => match document.edge(id) {
            Some(stored) => update_edge_row(conn, document_id, stored).await,
            None => Ok(()),
        },
        DiagramPatch::RemoveEdge { id } => {
            sqlx::query(
                r#"
                DELETE FROM diagram_edges
                WHERE document_id = ?
                  AND id = ?
                "#,
            )
            .bind(document_id.0)
            .bind(id.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|err| db_err("Failed to remove diagram edge", err))?;

            Ok(())
        }
        DiagramPatch::UpdateViewport { .. } => {
            sqlx::query(
                r#"
                UPDATE diagram_documents
                SET viewport = ?
                WHERE id = ?
                "#,
            )
            .bind(to_json(&document.viewport)?)
            .bind(document_id.0)
            .execute(&mut *conn)
            .await
            .map_err(|err| db_err("Failed to update diagram viewport", err))?;

            Ok(())
        }
        DiagramPatch::UpdateMetadata { .. } => {
            sqlx::query(
                r#"
                UPDATE diagram_documents
                SET name = ?,
                    description = ?
                WHERE id = ?
                "#,
            )
            .bind(&document.name)
            .bind(document.description.as_deref())
            .bind(document_id.0)
            .execute(&mut *conn)
            .await
            .map_err(|err| db_err("Failed to update diagram metadata", err))?;

            Ok(())
        }
    }
}

pub async fn create_document(pool: &SqlitePool, payload: CreateDocumentPayload) -> Result<Document> {
    let name = normalize_name(&payload.name)?;
    let description = payload
        .description
        .map(|description| description.trim().to_string())
        .filter(|description| !description.is_empty());
    let document_id = DocumentId(Uuid::new_v4());
    let viewport = match payload.viewport {
        Some(viewport) if !viewport.is_valid() => {
            warn!(
                document_id = %document_id,
                x = viewport.x,
                y = viewport.y,
                zoom = viewport.zoom,
                "new diagram carried an invalid viewport; using default"
            );
            Viewport::default()
        }
        viewport => viewport.unwrap_or_default(),
    };

    let mut recovery = PositionRecovery::with_placed(
        payload
            .nodes
            .iter()
            .map(|node| node.position)
            .filter(Position::is_valid),
    );
    let nodes = payload
        .nodes
        .into_iter()
        .map(|mut node| {
            if !node.position.is_valid() {
                let recovered = recovery.recover();
                warn!(
                    document_id = %document_id,
                    node_id = %node.id,
                    x = recovered.x,
                    y = recovered.y,
                    "new node carried an invalid position; placed on a free grid cell"
                );
                node.position = recovered;
            }
            node
        })
        .collect::<Vec<_>>();
    let mut edges = payload.edges;
    for edge in &mut edges {
        edge.refresh_connection_hash();
    }
    ensure_document_invariants(&nodes, &edges)?;

    let now = Utc::now().naive_utc();
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| db_err("Failed to start transaction", err))?;

    sqlx::query(
        r#"
        INSERT INTO diagram_documents (id, name, description, viewport, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(document_id.0)
    .bind(&name)
    .bind(description.as_deref())
    .bind(to_json(&viewport)?)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(|err| db_err("Failed to create diagram", err))?;

    for node in &nodes {
        insert_node(&mut tx, document_id, node).await?;
    }
    for edge in &edges {
        insert_edge(&mut tx, document_id, edge).await?;
    }

    let document = load_document(&mut tx, document_id)
        .await?
        .ok_or_else(|| not_found(document_id))?;

    tx.commit()
        .await
        .map_err(|err| db_err("Failed to commit transaction", err))?;

    Ok(document)
}

/// Loads a document. `None` when it does not exist; corrupt rows are
/// recovered and logged rather than reported.
///
/// The document, node and edge reads share one transaction so a batch
/// committed in between cannot leave edges pointing at nodes that were not
/// read.
pub async fn get_document(pool: &SqlitePool, document_id: DocumentId) -> Result<Option<Document>> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| db_err("Failed to start transaction", err))?;

    let document = load_document(&mut tx, document_id).await?;

    tx.commit()
        .await
        .map_err(|err| db_err("Failed to commit transaction", err))?;

    Ok(document)
}

pub async fn list_documents(
    pool: &SqlitePool,
    page: u32,
    limit: u32,
) -> Result<Vec<DocumentSummary>> {
    let offset = (page.saturating_sub(1) as i64).saturating_mul(limit as i64);

    let rows = sqlx::query_as::<_, DocumentSummaryRow>(
        r#"
        SELECT
            d.id,
            d.name,
            d.description,
            d.created_at,
            d.updated_at,
            COALESCE(n.node_count, 0) AS node_count,
            COALESCE(e.edge_count, 0) AS edge_count
        FROM diagram_documents d
        LEFT JOIN (
            SELECT document_id, COUNT(*) AS node_count
            FROM diagram_nodes
            GROUP BY document_id
        ) n
        ON n.document_id = d.id
        LEFT JOIN (
            SELECT document_id, COUNT(*) AS edge_count
            FROM diagram_edges
            GROUP BY document_id
        ) e
        ON e.document_id = d.id
        ORDER BY d.updated_at DESC, d.id DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(limit as i64)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(|err| db_err("Failed to list diagrams", err))?;

    Ok(rows.into_iter().map(DocumentSummary::from).collect())
}

/// Applies a batch atomically. Each patch is checked by the in-memory applier
/// against the state left by the previous one before it is written; the first
/// failure rolls the whole batch back.
pub async fn apply_patches(
    pool: &SqlitePool,
    document_id: DocumentId,
    patches: &[DiagramPatch],
) -> Result<Document> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| db_err("Failed to start transaction", err))?;

    let mut document = load_document(&mut tx, document_id)
        .await?
        .ok_or_else(|| not_found(document_id))?;

    if patches.is_empty() {
        return Ok(document);
    }

    for patch in patches {
        let next = patch::apply_patch(document, patch)?;
        write_patch(&mut tx, &next, patch).await?;
        document = next;
    }

    sqlx::query(
        r#"
        UPDATE diagram_documents
        SET updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(Utc::now().naive_utc())
    .bind(document_id.0)
    .execute(&mut *tx)
    .await
    .map_err(|err| db_err("Failed to update diagram", err))?;

    let document = load_document(&mut tx, document_id)
        .await?
        .ok_or_else(|| not_found(document_id))?;

    tx.commit()
        .await
        .map_err(|err| db_err("Failed to commit transaction", err))?;

    debug!(
        document_id = %document_id,
        patches = patches.len(),
        "applied diagram patch batch"
    );
    Ok(document)
}

pub async fn delete_document(pool: &SqlitePool, document_id: DocumentId) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| db_err("Failed to start transaction", err))?;

    for (statement, public) in [
        (
            "DELETE FROM diagram_task_links WHERE document_id = ?",
            "Failed to delete diagram task links",
        ),
        (
            "DELETE FROM diagram_edges WHERE document_id = ?",
            "Failed to delete diagram edges",
        ),
        (
            "DELETE FROM diagram_nodes WHERE document_id = ?",
            "Failed to delete diagram nodes",
        ),
    ] {
        sqlx::query(statement)
            .bind(document_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|err| db_err(public, err))?;
    }

    let deleted = sqlx::query(
        r#"
        DELETE FROM diagram_documents
        WHERE id = ?
        "#,
    )
    .bind(document_id.0)
    .execute(&mut *tx)
    .await
    .map_err(|err| db_err("Failed to delete diagram", err))?;

    if deleted.rows_affected() == 0 {
        return Err(not_found(document_id));
    }

    tx.commit()
        .await
        .map_err(|err| db_err("Failed to commit transaction", err))?;

    Ok(())
}

fn normalize_task_id(task_id: &str) -> Result<&str> {
    let task_id = task_id.trim();
    if task_id.is_empty() {
        return Err(LibError::invalid(
            "Task ID is required",
            anyhow!("empty task id"),
        ));
    }
    Ok(task_id)
}

/// Associates a host task with a diagram. Linking twice keeps the first link.
pub async fn link_task(
    pool: &SqlitePool,
    document_id: DocumentId,
    task_id: &str,
) -> Result<TaskLink> {
    let task_id = normalize_task_id(task_id)?;
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| db_err("Failed to start transaction", err))?;

    if !document_exists(&mut tx, document_id).await? {
        return Err(not_found(document_id));
    }

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO diagram_task_links (document_id, task_id, created_at)
        VALUES (?, ?, ?)
        "#,
    )
    .bind(document_id.0)
    .bind(task_id)
    .bind(Utc::now().naive_utc())
    .execute(&mut *tx)
    .await
    .map_err(|err| db_err("Failed to link task", err))?;

    let row = sqlx::query_as::<_, TaskLinkRow>(
        r#"
        SELECT document_id, task_id, created_at
        FROM diagram_task_links
        WHERE document_id = ?
          AND task_id = ?
        "#,
    )
    .bind(document_id.0)
    .bind(task_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|err| db_err("Failed to query task link", err))?;

    tx.commit()
        .await
        .map_err(|err| db_err("Failed to commit transaction", err))?;

    Ok(row.into())
}

pub async fn unlink_task(pool: &SqlitePool, document_id: DocumentId, task_id: &str) -> Result<bool> {
    let task_id = normalize_task_id(task_id)?;
    let deleted = sqlx::query(
        r#"
        DELETE FROM diagram_task_links
        WHERE document_id = ?
          AND task_id = ?
        "#,
    )
    .bind(document_id.0)
    .bind(task_id)
    .execute(pool)
    .await
    .map_err(|err| db_err("Failed to unlink task", err))?;

    Ok(deleted.rows_affected() > 0)
}

pub async fn list_task_links(pool: &SqlitePool, document_id: DocumentId) -> Result<Vec<TaskLink>> {
    let rows = sqlx::query_as::<_, TaskLinkRow>(
        r#"
        SELECT document_id, task_id, created_at
        FROM diagram_task_links
        WHERE document_id = ?
        ORDER BY created_at ASC, task_id ASC
        "#,
    )
    .bind(document_id.0)
    .fetch_all(pool)
    .await
    .map_err(|err| db_err("Failed to list task links", err))?;

    Ok(rows.into_iter().map(TaskLink::from).collect())
}

/// Every place a task is referenced: nodes whose data carries its `taskId`
/// and document-level links. De-duplicated and ordered by document.
pub async fn find_task_references(pool: &SqlitePool, task_id: &str) -> Result<Vec<TaskReference>> {
    let task_id = normalize_task_id(task_id)?;

    let node_refs = sqlx::query_as::<_, (Uuid, String)>(
        r#"
        SELECT document_id, id
        FROM diagram_nodes
        WHERE (CASE WHEN json_valid(data) THEN json_extract(data, '$.taskId') END) = ?
        "#,
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .map_err(|err| db_err("Failed to query task references", err))?;

    let link_refs = sqlx::query_as::<_, (Uuid,)>(
        r#"
        SELECT document_id
        FROM diagram_task_links
        WHERE task_id = ?
        "#,
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .map_err(|err| db_err("Failed to query task links", err))?;

    let mut references = BTreeSet::new();
    for (document_id, node_id) in node_refs {
        references.insert(TaskReference {
            document_id: DocumentId(document_id),
            node_id: Some(NodeId(node_id)),
        });
    }
    for (document_id,) in link_refs {
        references.insert(TaskReference {
            document_id: DocumentId(document_id),
            node_id: None,
        });
    }

    Ok(references.into_iter().collect())
}
