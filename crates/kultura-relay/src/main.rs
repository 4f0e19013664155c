//! # kultura-relay
//!
//! Real-time messaging relay for the KulturaX app.
//!
//! This binary provides:
//! - **WebSocket relay** brokering direct messages, typing indicators, read
//!   receipts and presence between connected clients (best-effort, nothing
//!   is persisted)
//! - **Handshake verification** of API-issued credential tokens
//! - **HTTP endpoints** (axum) for health checks, instance info and admin
//!   status
//! - **Per-IP and per-connection rate limiting** to protect against abuse

mod api;
mod audience;
mod auth;
mod bus;
mod config;
mod error;
mod presence;
mod rate_limit;
mod registry;
mod relay;
mod router;
mod session;
mod stats;
mod transport;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kultura_shared::constants::APP_NAME;

use crate::api::AppState;
use crate::auth::{CredentialVerifier, SignedTokenVerifier, TrustingVerifier};
use crate::bus::{EventKind, RelayEvent};
use crate::config::RelayConfig;
use crate::rate_limit::RateLimiter;
use crate::relay::Relay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,kultura_relay=debug")),
        )
        .init();

    info!("Starting {} relay v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = RelayConfig::from_env().context("failed to load relay configuration")?;
    info!(
        instance = %config.instance_name,
        addr = %config.listen_addr,
        handshake_timeout_secs = config.handshake_timeout.as_secs(),
        heartbeat_interval_secs = config.heartbeat_interval.as_secs(),
        presence_scope = ?config.presence_scope,
        admin_enabled = config.admin_token.is_some(),
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize the relay
    // -----------------------------------------------------------------------
    let verifier: Arc<dyn CredentialVerifier> = match config.auth_server_pubkey {
        Some(pubkey) => {
            info!(pubkey = %hex::encode(pubkey), "Verifying signed relay credentials");
            Arc::new(SignedTokenVerifier::new(pubkey))
        }
        None => {
            warn!("AUTH_SERVER_PUBKEY not set, accepting any non-empty token (development only)");
            Arc::new(TrustingVerifier)
        }
    };

    let relay = Relay::new(&config, verifier);

    relay.bus().subscribe(EventKind::Presence, |event| {
        if let RelayEvent::PresenceChanged {
            user,
            online,
            notified,
        } = event
        {
            info!(user = %user, online, notified, "Presence changed");
        }
    });

    // Rate limiter: 10 req/s sustained, burst of 30
    let rate_limiter = RateLimiter::default();

    let http_addr = config.listen_addr;
    let app_state = AppState {
        relay,
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config),
        started_at: Instant::now(),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rate_limiter.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Serve WebSocket + HTTP until shutdown
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Relay server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
