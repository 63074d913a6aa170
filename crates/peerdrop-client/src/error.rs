use thiserror::Error;

use peerdrop_shared::{FrameError, ProtocolError};

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("Signaling channel closed")]
    Closed,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Invalid room code: {0:?}")]
    InvalidRoomCode(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum RtcError {
    #[error("WebRTC error: {0}")]
    Backend(String),

    #[error("No connectivity session for peer {0}")]
    NoSession(String),

    #[error("Unsupported description type: {0}")]
    DescriptionType(String),

    #[error("Data channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("A transfer with peer {0} is already in progress")]
    Busy(String),

    #[error("Unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("Transfer {0} was already accepted or rejected")]
    AlreadyResolved(String),

    #[error("No files to send")]
    NoFiles,

    #[error("Too many files: {0}")]
    TooManyFiles(usize),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Data channel closed")]
    ChannelClosed,

    #[error("Size mismatch for {name}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("Invalid relay chunk data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Rtc(#[from] RtcError),

    #[error("Could not read file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Output sink failed: {0}")]
    Sink(#[from] SinkError),
}
