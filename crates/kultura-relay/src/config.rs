//! Relay configuration loaded from environment variables.
//!
//! Every setting has a default so the relay starts with zero configuration
//! for local development. Invalid values are logged and ignored.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use kultura_shared::constants::{
    DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_SEND_QUEUE_CAPACITY,
    DEFAULT_WS_PORT,
};

/// Who receives a user's online/offline transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceScope {
    /// Users who exchanged envelopes with, or explicitly watch, the user.
    Contacts,
    /// Every online user.
    Everyone,
}

impl FromStr for PresenceScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "contacts" => Ok(Self::Contacts),
            "everyone" | "all" => Ok(Self::Everyone),
            other => Err(format!("unknown presence scope '{other}'")),
        }
    }
}

/// Relay configuration.
#[derive(Clone)]
pub struct RelayConfig {
    /// Socket address the HTTP/WebSocket listener binds.
    /// Env: `WS_HOST` and `WS_PORT`
    /// Default: `0.0.0.0:8080`
    pub listen_addr: SocketAddr,

    /// How long a fresh connection may stay unauthenticated.
    /// Env: `HANDSHAKE_TIMEOUT_SECS`
    /// Default: 10s
    pub handshake_timeout: Duration,

    /// Heartbeat ping interval. A connection silent for twice this is closed.
    /// Env: `HEARTBEAT_INTERVAL_SECS`
    /// Default: 30s
    pub heartbeat_interval: Duration,

    /// Outbound frames buffered per connection before new ones are dropped.
    /// Env: `SEND_QUEUE_CAPACITY`
    pub send_queue_capacity: usize,

    /// Ed25519 public key of the API service that mints relay credentials.
    /// When unset every non-empty token is accepted (development only).
    /// Env: `AUTH_SERVER_PUBKEY` (64 hex chars)
    pub auth_server_pubkey: Option<[u8; 32]>,

    /// Env: `PRESENCE_SCOPE` (`contacts` | `everyone`)
    /// Default: `contacts`
    pub presence_scope: PresenceScope,

    /// Sustained inbound envelopes per second per connection.
    /// Env: `ENVELOPE_RATE_PER_SEC`
    pub envelope_rate: f64,

    /// Inbound envelope burst per connection.
    /// Env: `ENVELOPE_BURST`
    pub envelope_burst: f64,

    /// Env: `INSTANCE_NAME`
    pub instance_name: String,

    /// Bearer token for `/admin/status`. Admin API disabled when unset.
    /// Env: `ADMIN_TOKEN`
    pub admin_token: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], DEFAULT_WS_PORT).into(),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            auth_server_pubkey: None,
            presence_scope: PresenceScope::Contacts,
            envelope_rate: 20.0,
            envelope_burst: 40.0,
            instance_name: "KulturaX Relay".to_string(),
            admin_token: None,
        }
    }
}

impl RelayConfig {
    /// Load configuration from the process environment, falling back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Fails only on settings that would weaken security if ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(host) = lookup("WS_HOST") {
            match host.parse::<IpAddr>() {
                Ok(ip) => config.listen_addr.set_ip(ip),
                Err(_) => tracing::warn!(value = %host, "Invalid WS_HOST, using default"),
            }
        }

        if let Some(port) = lookup("WS_PORT") {
            match port.parse::<u16>() {
                Ok(port) => config.listen_addr.set_port(port),
                Err(_) => tracing::warn!(value = %port, "Invalid WS_PORT, using default"),
            }
        }

        if let Some(secs) = parse_positive::<u64>(&lookup, "HANDSHAKE_TIMEOUT_SECS") {
            config.handshake_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_positive::<u64>(&lookup, "HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval = Duration::from_secs(secs);
        }

        if let Some(capacity) = parse_positive::<usize>(&lookup, "SEND_QUEUE_CAPACITY") {
            config.send_queue_capacity = capacity;
        }

        // A key that is set but unusable must not fall back to trusting tokens.
        if let Some(hex_key) = lookup("AUTH_SERVER_PUBKEY") {
            let key = parse_hex_pubkey(&hex_key)
                .map_err(anyhow::Error::msg)
                .context("invalid AUTH_SERVER_PUBKEY")?;
            config.auth_server_pubkey = Some(key);
        }

        if let Some(scope) = lookup("PRESENCE_SCOPE") {
            match scope.parse() {
                Ok(scope) => config.presence_scope = scope,
                Err(e) => tracing::warn!(error = %e, "Invalid PRESENCE_SCOPE, using default"),
            }
        }

        if let Some(rate) = parse_positive::<f64>(&lookup, "ENVELOPE_RATE_PER_SEC") {
            config.envelope_rate = rate;
        }

        if let Some(burst) = parse_positive::<f64>(&lookup, "ENVELOPE_BURST") {
            config.envelope_burst = burst;
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(token) = lookup("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        Ok(config)
    }
}

fn parse_positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Some(value),
        _ => {
            tracing::warn!(key, value = %raw, "Expected a positive number, using default");
            None
        }
    }
}

/// Parse a 64-character hex string into a 32-byte array.
fn parse_hex_pubkey(hex: &str) -> Result<[u8; 32], String> {
    let hex = hex.trim();
    if hex.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex.len()));
    }

    let bytes = hex::decode(hex).map_err(|e| format!("invalid hex: {e}"))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
