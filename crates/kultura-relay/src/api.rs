use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, Method},
    middleware,
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use kultura_shared::constants::{MAX_FRAME_SIZE, PROTOCOL_VERSION};
use kultura_shared::types::UserId;

use crate::config::RelayConfig;
use crate::error::ApiError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::registry::ConnectionSnapshot;
use crate::relay::Relay;
use crate::stats::StatsSnapshot;
use crate::transport::WsTransport;

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<RelayConfig>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", get(ws_upgrade))
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health_check))
        .route("/info", get(relay_info))
        .route("/admin/status", get(admin_status))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(MAX_FRAME_SIZE)
        .max_frame_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| async move {
            state.relay.accept(WsTransport::new(socket)).await;
        })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct InfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    online_users: usize,
    live_connections: usize,
    uptime_secs: u64,
    stats: StatsSnapshot,
}

#[derive(Serialize)]
struct AdminStatusResponse {
    name: String,
    uptime_secs: u64,
    online_users: Vec<UserId>,
    connections: Vec<ConnectionSnapshot>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn relay_info(State(state): State<AppState>) -> Json<InfoResponse> {
    let (live_connections, online_users) = state.relay.registry().counts().await;
    Json(InfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        online_users,
        live_connections,
        uptime_secs: state.started_at.elapsed().as_secs(),
        stats: state.relay.stats().snapshot(),
    })
}

fn verify_admin_token(headers: &HeaderMap, config: &RelayConfig) -> Result<(), ApiError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ApiError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ApiError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ApiError> {
    verify_admin_token(&headers, &state.config)?;

    let registry = state.relay.registry();
    let mut connections = registry.snapshot().await;
    connections.sort_by_key(|c| c.opened_at);

    Ok(Json(AdminStatusResponse {
        name: state.config.instance_name.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        online_users: registry.online_users().await,
        connections,
    }))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {addr}"))?;
    serve_listener(state, listener).await
}

pub async fn serve_listener(state: AppState, listener: TcpListener) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %listener.local_addr()?, "Relay listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
