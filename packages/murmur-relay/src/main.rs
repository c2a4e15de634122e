//! Murmur Relay Server
//!
//! HTTP + WebSocket backend for the Murmur chat client:
//!
//! 1. **Real-time relay**: holds a live-connection registry keyed by user
//!    identity; persists every sent message and fans it out to the sender
//!    and receiver connections.
//!
//! 2. **Public-key directory**: stores users' published public keys so
//!    peers can wrap conversation session keys for each other.
//!
//! 3. **History**: persisted messages are queryable per conversation,
//!    ascending by timestamp, including envelope fields for encrypted
//!    bodies.
//!
//! **Privacy**: the relay never sees plaintext for encrypted messages.
//! Encryption happens client-side; the relay validates envelope shape and
//! moves opaque blobs.

mod api;
mod handler;
mod protocol;
mod state;
mod store;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::{RelayConfig, RelayState};
use store::MessageStore;

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "murmur-relay", version, about = "Murmur chat relay server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "RELAY_PORT")]
    port: u16,

    /// SQLite database path (in-memory when omitted)
    #[arg(long, env = "RELAY_DB")]
    db: Option<String>,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur_relay=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = RelayConfig {
        port: args.port,
        db_path: args.db,
    };

    let store = MessageStore::open(config.db_path.as_deref()).expect("Failed to open store");
    match &config.db_path {
        Some(path) => tracing::info!(path = path.as_str(), "Message store opened"),
        None => tracing::warn!("No --db configured; messages are in-memory only"),
    }

    let state = RelayState::new(config, store);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/messages", post(api::get_messages))
        .route("/api/keys", post(api::publish_key))
        .route("/api/keys/batch", post(api::get_keys))
        .route("/api/keys/:user_id", get(api::get_key))
        .route("/api/users", put(api::upsert_profile))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = format!("0.0.0.0:{}", state.config.port);
    tracing::info!("Murmur relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app).await.expect("Server error");
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// Connection-time parameters; `userId` is supplied by the authentication
/// collaborator and trusted as the connection's identity.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams {
    #[serde(default)]
    user_id: Option<String>,
}

/// WebSocket upgrade handler for client connections.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    let user_id = match params.user_id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => {
            tracing::warn!("Rejected connection without userId");
            return (StatusCode::BAD_REQUEST, "userId is required").into_response();
        }
    };

    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state, user_id))
        .into_response()
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "murmur-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "onlineClients": state.online_count(),
        "storedMessages": state.store.message_count(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
