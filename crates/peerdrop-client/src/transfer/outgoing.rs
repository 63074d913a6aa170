//! Sender side: the two delivery paths.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine;
use bytes::Bytes;
use tracing::{debug, trace};

use peerdrop_shared::frame::FileMetadata;
use peerdrop_shared::protocol::RelayChunkPayload;
use peerdrop_shared::{Envelope, FileDescriptor, Frame, MessageType};

use super::TransferConfig;
use crate::error::TransferError;
use crate::rtc::DataChannel;
use crate::signaling::SignalingChannel;

/// A file offered for sending, held in memory.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub mime: String,
    pub data: Bytes,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            data: data.into(),
        }
    }

    /// Read a file from disk. The content type is left generic.
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self::new(name, "application/octet-stream", data))
    }

    pub fn descriptor(&self) -> FileDescriptor {
        FileDescriptor::new(self.name.clone(), self.data.len() as u64, self.mime.clone())
    }
}

/// Split `data` into zero-copy chunks of at most `chunk_size` bytes.
fn chunks(data: &Bytes, chunk_size: usize) -> impl Iterator<Item = Bytes> + '_ {
    let step = chunk_size.max(1);
    (0..data.len())
        .step_by(step)
        .map(move |start| data.slice(start..(start + step).min(data.len())))
}

fn check_cancel(cancel: &AtomicBool) -> Result<(), TransferError> {
    if cancel.load(Ordering::SeqCst) {
        return Err(TransferError::Cancelled);
    }
    Ok(())
}

/// Wait until the channel's outstanding buffer is at or below the
/// high-water mark.
async fn drain(channel: &dyn DataChannel, config: &TransferConfig, cancel: &AtomicBool) -> Result<(), TransferError> {
    loop {
        check_cancel(cancel)?;
        if !channel.is_open() {
            return Err(TransferError::ChannelClosed);
        }
        let buffered = channel.buffered_amount().await;
        if buffered <= config.high_water_mark {
            return Ok(());
        }
        trace!(buffered, "Waiting for data channel to drain");
        tokio::time::sleep(config.backpressure_poll).await;
    }
}

/// Send every file as binary frames over an open data channel.
pub(crate) async fn send_direct(
    channel: &dyn DataChannel,
    transfer_id: &str,
    files: &[OutgoingFile],
    config: &TransferConfig,
    cancel: &AtomicBool,
    mut progress: impl FnMut(u64),
) -> Result<(), TransferError> {
    for (index, file) in files.iter().enumerate() {
        let file_index = u16::try_from(index).map_err(|_| TransferError::TooManyFiles(files.len()))?;
        let total_chunks = file.descriptor().chunk_count(config.chunk_size);
        let meta = Frame::Metadata(FileMetadata {
            file_index,
            name: file.name.clone(),
            size: file.data.len() as u64,
            mime: file.mime.clone(),
            total_chunks,
        });
        check_cancel(cancel)?;
        channel.send(meta.encode()?).await?;
        debug!(file = %file.name, total_chunks, "Sending file directly");

        for (chunk_index, data) in chunks(&file.data, config.chunk_size).enumerate() {
            drain(channel, config, cancel).await?;
            let len = data.len() as u64;
            let frame = Frame::chunk(index, chunk_index as u32, data)?;
            channel.send(frame.encode()?).await?;
            progress(len);
        }
    }

    check_cancel(cancel)?;
    let done = Frame::Complete {
        transfer_id: transfer_id.to_string(),
    };
    channel.send(done.encode()?).await?;
    Ok(())
}

/// Send every file as base64 `relay-chunk` envelopes through the hub.
pub(crate) async fn send_relay(
    signaling: &SignalingChannel,
    peer: &str,
    transfer_id: &str,
    files: &[OutgoingFile],
    config: &TransferConfig,
    cancel: &AtomicBool,
    mut progress: impl FnMut(u64),
) -> Result<(), TransferError> {
    let engine = &base64::engine::general_purpose::STANDARD;
    let send = |file_index: u32, chunk_index: u32, data: &[u8], is_last: bool| {
        let payload = RelayChunkPayload {
            transfer_id: transfer_id.to_string(),
            file_index,
            chunk_index,
            data: engine.encode(data),
            is_last,
        };
        let env = Envelope::with_payload(MessageType::RelayChunk, &payload)?.to(peer);
        signaling.send(env)?;
        Ok::<_, TransferError>(())
    };

    let mut remaining: u64 = files
        .iter()
        .map(|f| u64::from(f.descriptor().chunk_count(config.chunk_size)))
        .sum();

    if remaining == 0 {
        // Nothing to carry, but the receiver still needs the last-chunk flag
        check_cancel(cancel)?;
        return send(0, 0, &[], true);
    }

    for (file_index, file) in files.iter().enumerate() {
        for (chunk_index, data) in chunks(&file.data, config.chunk_size).enumerate() {
            check_cancel(cancel)?;
            remaining -= 1;
            send(file_index as u32, chunk_index as u32, &data, remaining == 0)?;
            progress(data.len() as u64);
            if remaining > 0 {
                tokio::time::sleep(config.relay_chunk_delay).await;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_split_exactly() {
        let data = Bytes::from(vec![7u8; 204_800]);
        let sizes: Vec<usize> = chunks(&data, 64 * 1024).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![65_536, 65_536, 65_536, 8_192]);

        let empty = Bytes::new();
        assert_eq!(chunks(&empty, 64 * 1024).count(), 0);
    }

    #[test]
    fn test_descriptor() {
        let file = OutgoingFile::new("a.bin", "application/x-test", vec![1u8, 2, 3]);
        let desc = file.descriptor();
        assert_eq!(desc.size, 3);
        assert_eq!(desc.mime, "application/x-test");
    }
}
