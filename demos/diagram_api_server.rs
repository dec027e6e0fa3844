use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use sqlx::SqlitePool;
use subseq_flowchart::api::{DiagramApp, HasPool};
use subseq_flowchart::db::{DiagramStoreConfig, create_diagram_tables};
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct ExampleApp {
    pool: Arc<SqlitePool>,
}

impl HasPool for ExampleApp {
    fn pool(&self) -> Arc<SqlitePool> {
        Arc::clone(&self.pool)
    }
}

impl DiagramApp for ExampleApp {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,subseq_flowchart=debug")),
        )
        .init();

    let mut config = DiagramStoreConfig::from_env().context("invalid diagram store config")?;
    if let Ok(database_url) = env::var("DATABASE_URL") {
        config.database_url = database_url;
    }
    let bind = env::var("DIAGRAM_EXAMPLE_BIND").unwrap_or_else(|_| "127.0.0.1:4011".to_string());
    let bind_addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid DIAGRAM_EXAMPLE_BIND '{}'", bind))?;

    let pool = config
        .connect()
        .await
        .with_context(|| format!("failed to open {}", config.database_url))?;
    create_diagram_tables(&pool)
        .await
        .context("failed to run diagram migrations")?;

    let app_state = ExampleApp {
        pool: Arc::new(pool),
    };

    let api_v1 = Router::new()
        .route("/healthz", get(health_handler))
        .merge(subseq_flowchart::api::routes::<ExampleApp>());

    let app = Router::new().nest("/api/v1", api_v1).with_state(app_state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", bind_addr))?;

    tracing::info!(
        %bind_addr,
        database_url = %config.database_url,
        "subseq_flowchart example server listening under /api/v1"
    );

    axum::serve(listener, app)
        .await
        .context("example server failed")
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true
    }))
}
