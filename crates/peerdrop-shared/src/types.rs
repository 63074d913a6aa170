use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire-facing view of a connected session. Carries no network address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    pub platform: String,
}

/// One file offered in a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    /// Declared content type (MIME), may be empty
    #[serde(rename = "type", default)]
    pub mime: String,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, size: u64, mime: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            mime: mime.into(),
        }
    }

    /// Number of chunks this file is split into at `chunk_size` bytes each.
    pub fn chunk_count(&self, chunk_size: usize) -> u32 {
        chunk_count(self.size, chunk_size)
    }
}

/// `ceil(size / chunk_size)`; zero-length files have zero chunks.
pub fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    let chunk = chunk_size.max(1) as u64;
    size.div_ceil(chunk) as u32
}

/// Aggregate byte size of a set of files.
pub fn total_size(files: &[FileDescriptor]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

/// A peer as reported by the (external) discovery subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub platform: String,
    pub last_seen: DateTime<Utc>,
}
