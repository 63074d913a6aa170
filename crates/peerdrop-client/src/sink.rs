//! Destinations for fully received files.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::SinkError;

/// A reassembled file, ready to hand to the user.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub transfer_id: String,
    pub name: String,
    pub mime: String,
    pub data: Bytes,
}

#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn deliver(&self, file: ReceivedFile) -> Result<(), SinkError>;
}

/// Writes files into a directory, never overwriting an existing one.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl OutputSink for DirectorySink {
    async fn deliver(&self, file: ReceivedFile) -> Result<(), SinkError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let name = sanitize_file_name(&file.name);

        let mut n = 0u32;
        loop {
            let path = self.dir.join(numbered(&name, n));
            let opened = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            match opened {
                Ok(mut out) => {
                    out.write_all(&file.data).await?;
                    out.flush().await?;
                    info!(path = %path.display(), bytes = file.data.len(), "Saved received file");
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Keeps everything in memory.
#[derive(Default)]
pub struct MemorySink {
    files: Mutex<Vec<ReceivedFile>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> Vec<ReceivedFile> {
        self.files.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn deliver(&self, file: ReceivedFile) -> Result<(), SinkError> {
        if let Ok(mut files) = self.files.lock() {
            files.push(file);
        }
        Ok(())
    }
}

/// Reduce a sender-supplied name to a bare file name.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

/// `report.pdf` -> `report (2).pdf`
fn numbered(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{name} ({n})"),
    }
}
