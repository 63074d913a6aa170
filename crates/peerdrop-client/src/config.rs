use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use peerdrop_shared::constants::{
    APP_NAME, BACKPRESSURE_POLL_MS, BUFFER_HIGH_WATER_MARK, CHUNK_SIZE, DATA_CHANNEL_TIMEOUT_SECS,
    DEFAULT_HTTP_PORT, RELAY_CHUNK_DELAY_MS, SIGNALING_PATH, TRANSFER_RESPONSE_TIMEOUT_SECS,
};

use crate::reconnect::ReconnectPolicy;
use crate::signaling::SignalingConfig;
use crate::transfer::TransferConfig;

const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Agent configuration.
///
/// Every field can be overridden through environment variables; see
/// [`ClientConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub signaling_url: String,
    pub device_name: String,
    pub platform: String,
    /// Where received files are written
    pub download_dir: PathBuf,
    /// Accept every incoming transfer without asking
    pub auto_accept: bool,
    pub stun_servers: Vec<String>,
    pub signaling: SignalingConfig,
    pub transfer: TransferConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: format!("ws://127.0.0.1:{}{}", DEFAULT_HTTP_PORT, SIGNALING_PATH),
            device_name: format!("{} Device", APP_NAME),
            platform: std::env::consts::OS.to_string(),
            download_dir: default_download_dir(),
            auto_accept: false,
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            signaling: SignalingConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            ping_interval: Duration::from_secs(25),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            high_water_mark: BUFFER_HIGH_WATER_MARK,
            backpressure_poll: Duration::from_millis(BACKPRESSURE_POLL_MS),
            relay_chunk_delay: Duration::from_millis(RELAY_CHUNK_DELAY_MS),
            channel_timeout: Duration::from_secs(DATA_CHANNEL_TIMEOUT_SECS),
            response_timeout: Duration::from_secs(TRANSFER_RESPONSE_TIMEOUT_SECS),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or invalid.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SIGNALING_URL") {
            config.signaling_url = url;
        }
        if let Some(name) = std::env::var("DEVICE_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .ok()
            .filter(|n| !n.trim().is_empty())
        {
            config.device_name = name;
        }
        if let Ok(platform) = std::env::var("PLATFORM") {
            config.platform = platform;
        }
        if let Ok(dir) = std::env::var("DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_var::<bool>("AUTO_ACCEPT") {
            config.auto_accept = v;
        }
        if let Ok(list) = std::env::var("STUN_SERVERS") {
            config.stun_servers = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        let reconnect = &mut config.signaling.reconnect;
        if let Some(ms) = parse_var::<u64>("RECONNECT_BASE_MS") {
            reconnect.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>("RECONNECT_MAX_MS") {
            reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32>("RECONNECT_MAX_ATTEMPTS") {
            reconnect.max_attempts = n;
        }
        if let Some(secs) = parse_var::<u64>("SIGNALING_PING_SECS").filter(|s| *s > 0) {
            config.signaling.ping_interval = Duration::from_secs(secs);
        }

        if let Some(n) = parse_var::<usize>("CHUNK_SIZE").filter(|n| *n > 0) {
            config.transfer.chunk_size = n;
        }
        if let Some(secs) = parse_var::<u64>("DATA_CHANNEL_TIMEOUT_SECS") {
            config.transfer.channel_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("TRANSFER_RESPONSE_TIMEOUT_SECS") {
            config.transfer.response_timeout = Duration::from_secs(secs);
        }

        config
    }
}

fn default_download_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(|d| d.join(APP_NAME)))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring invalid value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.signaling_url, "ws://127.0.0.1:8080/ws");
        assert!(!config.auto_accept);
        assert_eq!(config.transfer.chunk_size, 64 * 1024);
        assert_eq!(config.transfer.high_water_mark, 1024 * 1024);
        assert_eq!(config.transfer.channel_timeout, Duration::from_secs(10));
        assert_eq!(config.transfer.response_timeout, Duration::from_secs(60));
        assert_eq!(config.signaling.reconnect.max_attempts, 10);
        assert!(config.download_dir.ends_with(APP_NAME) || config.download_dir.ends_with("downloads"));
    }
}
