use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use board_api::auth::KvAuthenticator;
use board_api::config::Config;
use board_api::db::boards::MemoryBoardStore;
use board_api::db::kv::{KeyValueStore, MemoryStore};
use board_api::db::presence::MemoryPresenceStore;
use board_api::render::HtmlTaskRenderer;
use board_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;
    let cors_allow_any = config.cors_allow_any;

    // In-memory collaborators. Swap for durable stores behind the same traits.
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let state = AppState::new(
        config,
        Arc::new(MemoryBoardStore::new()),
        Arc::new(MemoryPresenceStore::new()),
        Arc::new(HtmlTaskRenderer),
        Arc::new(KvAuthenticator::new(kv)),
    );

    tracing::info!(hub = ?state.config.hub, "board-api configured");

    let mut app = Router::new().merge(board_api::routes::router());
    if cors_allow_any {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }
    let app = app.layer(TraceLayer::new_for_http()).with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "board-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
