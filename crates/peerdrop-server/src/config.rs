//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration on a local network.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use peerdrop_shared::constants::{DEFAULT_HTTP_PORT, MAX_MESSAGE_SIZE, SEND_QUEUE_CAPACITY};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP / WebSocket server.
    /// Env: `HTTP_ADDR`, with `PORT` overriding just the port
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Outbound messages a session may queue before new ones are dropped.
    /// Env: `SEND_QUEUE_CAPACITY`
    /// Default: `256`
    pub send_queue_capacity: usize,

    /// Interval between keepalive pings.
    /// Env: `PING_INTERVAL_SECS`
    /// Default: 54s
    pub ping_interval: Duration,

    /// Read-silence deadline after which a session is presumed dead.
    /// Env: `PONG_WAIT_SECS`
    /// Default: 60s
    pub pong_wait: Duration,

    /// Time allowed for a single socket write.
    /// Env: `WRITE_WAIT_SECS`
    /// Default: 10s
    pub write_wait: Duration,

    /// Largest inbound WebSocket message accepted.
    /// Env: `MAX_MESSAGE_SIZE`
    /// Default: 10 MiB
    pub max_message_size: usize,

    /// Interval of the empty-room sweep.
    /// Env: `ROOM_SWEEP_INTERVAL_SECS`
    /// Default: 60s
    pub room_sweep_interval: Duration,

    /// Take the client address from the first `X-Forwarded-For` entry when
    /// present (the server usually sits behind a reverse proxy).
    /// Env: `TRUST_FORWARDED_FOR` (true/false)
    /// Default: `true`
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            send_queue_capacity: SEND_QUEUE_CAPACITY,
            ping_interval: pong_wait * 9 / 10,
            pong_wait,
            write_wait: Duration::from_secs(10),
            max_message_size: MAX_MESSAGE_SIZE,
            room_sweep_interval: Duration::from_secs(60),
            trust_forwarded_for: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(addr) = parse_var::<SocketAddr>("HTTP_ADDR") {
            config.http_addr = addr;
        }
        if let Some(port) = parse_var::<u16>("PORT") {
            config.http_addr.set_port(port);
        }
        if let Some(n) = parse_var::<usize>("SEND_QUEUE_CAPACITY") {
            config.send_queue_capacity = n.max(1);
        }
        if let Some(secs) = parse_var::<u64>("PING_INTERVAL_SECS") {
            config.ping_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>("PONG_WAIT_SECS") {
            config.pong_wait = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>("WRITE_WAIT_SECS") {
            config.write_wait = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = parse_var::<usize>("MAX_MESSAGE_SIZE") {
            config.max_message_size = n;
        }
        if let Some(secs) = parse_var::<u64>("ROOM_SWEEP_INTERVAL_SECS") {
            config.room_sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Ok(val) = std::env::var("TRUST_FORWARDED_FOR") {
            config.trust_forwarded_for = val != "false" && val != "0";
        }

        if config.ping_interval >= config.pong_wait {
            tracing::warn!(
                ping = ?config.ping_interval,
                pong_wait = ?config.pong_wait,
                "Ping interval must be shorter than the pong wait, using 9/10 of it"
            );
            config.ping_interval = config.pong_wait * 9 / 10;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

/// Read and parse an env var. Invalid values are logged and ignored.
fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}
