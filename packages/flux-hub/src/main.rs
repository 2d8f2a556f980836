//! Flux Signaling Hub
//!
//! A stateful WebSocket server that:
//!
//! 1. **Authenticates peers**: every upgrade on `/flux` carries a bearer
//!    token, validated against the external identity provider.
//!
//! 2. **Discovers peers by connect code**: six-character ambiguity-free
//!    codes map 1:1 to users and back friendships.
//!
//! 3. **Brokers P2P sessions**: offer/answer/ICE payloads are relayed
//!    verbatim between peers; the hub never parses SDP. Once the direct
//!    link is up, bulk data flows peer-to-peer and the hub only sees
//!    lifecycle pings.

mod directory;
mod handler;
mod identity;
mod protocol;
mod state;

use std::sync::Arc;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use directory::Directory;
use identity::HttpIdentityProvider;
use state::{HubConfig, HubState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "flux-hub", version, about = "Flux P2P signaling hub")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "FLUX_PORT")]
    port: u16,

    /// SQLite database path (connect codes, friendships). In-memory when
    /// omitted — fine for development, wrong for production.
    #[arg(long, env = "FLUX_DB_PATH")]
    db_path: Option<String>,

    /// Identity provider verify endpoint, called with the client's bearer
    /// token on every upgrade.
    #[arg(long, env = "FLUX_IDENTITY_URL")]
    identity_url: String,

    /// Server→client ping interval in seconds
    #[arg(long, default_value_t = 30, env = "FLUX_PING_INTERVAL_SECS")]
    ping_interval_secs: u64,

    /// Idle timeout in seconds; a connection with no inbound traffic for
    /// this long is closed
    #[arg(long, default_value_t = 90, env = "FLUX_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: u64,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flux_hub=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let directory = Directory::open(args.db_path.as_deref()).expect("Failed to open directory db");
    if args.db_path.is_none() {
        tracing::warn!("No FLUX_DB_PATH set, using an in-memory database");
    }

    let identity = Arc::new(HttpIdentityProvider::new(args.identity_url.clone()));
    tracing::info!(verify_url = args.identity_url.as_str(), "Identity provider configured");

    let config = HubConfig {
        ping_interval: std::time::Duration::from_secs(args.ping_interval_secs),
        idle_timeout: std::time::Duration::from_secs(args.idle_timeout_secs),
    };

    let state = HubState::new(directory, identity, config);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    let app = Router::new()
        .route("/flux", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", args.port);
    tracing::info!("Flux hub starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app).await.expect("Server error");
}

// ── Route Handlers ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ConnectParams {
    /// Bearer credential for the upgrade. Missing or invalid tokens close
    /// the socket with 4001.
    token: Option<String>,
}

/// WebSocket upgrade handler for peer connections.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<HubState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_socket(socket, state, params.token))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "flux-hub",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<HubState>) -> impl IntoResponse {
    Json(json!({
        "online_peers": state.online_count(),
        "active_sessions": state.sessions.len(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
