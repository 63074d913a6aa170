use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::{HeaderMap, Method},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use peerdrop_shared::constants::SIGNALING_PATH;
use peerdrop_shared::PeerRecord;

use crate::config::ServerConfig;
use crate::directory::PeerDirectory;
use crate::error::ServerError;
use crate::hub::{Hub, HubStats};
use crate::session;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub directory: Arc<dyn PeerDirectory>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route(SIGNALING_PATH, get(ws_upgrade))
        .route("/health", get(health_check))
        .route("/api/stats", get(hub_stats))
        .route("/api/peers", get(active_peers))
        .fallback(not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn hub_stats(State(state): State<AppState>) -> Json<HubStats> {
    Json(state.hub.stats().await)
}

async fn active_peers(State(state): State<AppState>) -> Json<Vec<PeerRecord>> {
    Json(state.directory.active_peers())
}

async fn not_found() -> ServerError {
    ServerError::NotFound("No such route".into())
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Response, ServerError> {
    let addr = client_address(&headers, remote, state.config.trust_forwarded_for)?;
    let AppState { hub, config, .. } = state;

    Ok(ws
        .max_message_size(config.max_message_size)
        .on_upgrade(move |socket| session::run(socket, hub, addr, config)))
}

/// Address used to pick the auto-scope room: the first `X-Forwarded-For`
/// entry when trusted and present, otherwise the TCP peer address.
fn client_address(
    headers: &HeaderMap,
    remote: SocketAddr,
    trust_forwarded_for: bool,
) -> Result<String, ServerError> {
    if trust_forwarded_for {
        if let Some(value) = headers.get("x-forwarded-for") {
            let value = value
                .to_str()
                .map_err(|_| ServerError::BadRequest("Invalid X-Forwarded-For header".into()))?;
            if let Some(first) = value.split(',').map(str::trim).find(|s| !s.is_empty()) {
                return Ok(first.to_string());
            }
        }
    }
    Ok(remote.to_string())
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Starting HTTP / signaling server");
    serve_listener(state, listener).await
}

pub async fn serve_listener(state: AppState, listener: TcpListener) -> anyhow::Result<()> {
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
