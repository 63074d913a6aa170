/// Application name
pub const APP_NAME: &str = "PeerDrop";

/// Default HTTP / WebSocket port of the signaling server
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// WebSocket path served by the hub
pub const SIGNALING_PATH: &str = "/ws";

/// Alphabet for coded room identifiers (no 0/O, no 1/I)
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of a coded room identifier
pub const ROOM_CODE_LEN: usize = 5;

/// Auto-scope room used when the remote address can't be parsed
pub const DEFAULT_AUTO_ROOM: &str = "default";

/// Bytes per chunk on both delivery paths (64 KiB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Outstanding data-channel buffer above which a sender pauses (1 MiB)
pub const BUFFER_HIGH_WATER_MARK: usize = 1024 * 1024;

/// Poll interval while waiting for the data-channel buffer to drain
pub const BACKPRESSURE_POLL_MS: u64 = 10;

/// Delay between relay-path chunk envelopes
pub const RELAY_CHUNK_DELAY_MS: u64 = 5;

/// How long a sender waits for a direct data channel before relaying
pub const DATA_CHANNEL_TIMEOUT_SECS: u64 = 10;

/// How long a sender waits for a transfer-response
pub const TRANSFER_RESPONSE_TIMEOUT_SECS: u64 = 60;

/// Label of the direct data channel
pub const DATA_CHANNEL_LABEL: &str = "peerdrop";

/// Maximum inbound WebSocket message size (10 MiB, sized for relay chunks)
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Outbound messages a server session may queue before new ones are dropped
pub const SEND_QUEUE_CAPACITY: usize = 256;
