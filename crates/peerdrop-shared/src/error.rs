use thiserror::Error;

use crate::protocol::MessageType;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing payload for {0:?} message")]
    MissingPayload(MessageType),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown frame tag: {0}")]
    UnknownTag(u8),

    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid metadata: {0}")]
    Metadata(String),

    #[error("Transfer id too long: {0} bytes (max 255)")]
    IdTooLong(usize),

    #[error("File index out of range: {0}")]
    FileIndexOutOfRange(usize),

    #[error("Invalid UTF-8 in transfer id")]
    InvalidUtf8,
}
