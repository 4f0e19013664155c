/// Application name
pub const APP_NAME: &str = "KulturaX";

/// Protocol version advertised on `/info`
pub const PROTOCOL_VERSION: &str = "kultura-relay/1";

/// Default WebSocket listen port
pub const DEFAULT_WS_PORT: u16 = 8080;

/// Maximum size of a single inbound frame in bytes (256 KiB)
pub const MAX_FRAME_SIZE: usize = 262_144;

/// Maximum chat message content size in bytes (64 KiB)
pub const MAX_CONTENT_SIZE: usize = 65_536;

/// Maximum number of ids in a read receipt or presence watch list
pub const MAX_ID_LIST: usize = 500;

/// Seconds a connection may stay unauthenticated
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Heartbeat interval in seconds; a connection silent for twice this is reaped
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Per-connection outbound queue depth
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;

/// Domain separation prefix for signed credential tokens
pub const CREDENTIAL_CONTEXT: &str = "kultura-relay";

// WebSocket close codes (application range 4000-4999)
pub const CLOSE_MALFORMED_HANDSHAKE: u16 = 4000;
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
pub const CLOSE_HANDSHAKE_TIMEOUT: u16 = 4002;
pub const CLOSE_PROTOCOL_VIOLATION: u16 = 4003;
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4004;
