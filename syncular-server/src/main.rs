use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::{get, post},
    Router,
};
use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use syncular_core::handler::HandlerRegistry;
use syncular_core::models::PartitionId;
use syncular_core::snapshot::{BlobStore, InMemoryBlobStore};

use syncular_server::{api, database::ServerDatabase, websocket::handle_websocket, AppState};

/// Standalone Syncular server: push/pull HTTP endpoints plus a realtime
/// websocket, backed by a single Postgres partition and an in-memory blob
/// store. Production deployments wire their own table handlers and an
/// object-store-backed `BlobStore` through the library instead of this
/// binary.
#[derive(Parser, Debug)]
#[command(name = "syncular-server")]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "postgres://localhost/syncular")]
    database_url: String,

    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    bind_address: String,

    #[arg(long, env = "PARTITION_ID")]
    partition_id: Option<Uuid>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("syncular_server=debug,tower_http=debug")
        .init();

    let cli = Cli::parse();

    let db = Arc::new(ServerDatabase::new(&cli.database_url).await?);
    db.run_migrations().await?;

    // No table handlers are registered by default -- a real deployment
    // builds its own `HandlerRegistry` from its schema and passes it to
    // `AppState::new` instead of running this binary directly.
    let handlers = Arc::new(HandlerRegistry::build(Vec::new())?);
    let blob_store: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
    let partition_id = PartitionId::new(cli.partition_id.unwrap_or_else(Uuid::nil));

    let state = Arc::new(AppState::new(db, handlers, blob_store, partition_id, None));

    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/api/push", post(api::push))
        .route("/api/pull", post(api::pull))
        .route("/api/snapshots/:blob_hash", get(api::snapshot_chunk))
        .route("/health", get(|| async { "OK" }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("starting syncular server on {}", cli.bind_address);
    let listener = tokio::net::TcpListener::bind(&cli.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}
