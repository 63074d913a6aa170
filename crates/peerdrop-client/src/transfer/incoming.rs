//! Receiver-side reassembly for both delivery paths.
//!
//! These are plain state machines: they consume frames or relay chunks and
//! report what happened, leaving events and output to the coordinator.

use std::collections::BTreeMap;

use base64::Engine;
use bytes::{Bytes, BytesMut};
use tracing::warn;

use peerdrop_shared::frame::FileMetadata;
use peerdrop_shared::protocol::RelayChunkPayload;
use peerdrop_shared::{FileDescriptor, Frame};

use crate::error::TransferError;

/// A fully reassembled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFile {
    pub name: String,
    pub mime: String,
    pub data: Bytes,
}

/// Result of feeding one frame to a [`DirectReceiver`].
#[derive(Debug, Default)]
pub struct DirectStep {
    /// Payload bytes carried by this frame
    pub bytes: u64,
    pub file: Option<AssembledFile>,
    pub complete: bool,
}

struct FileAssembly {
    meta: FileMetadata,
    chunks: Vec<Bytes>,
}

impl FileAssembly {
    fn finish(self) -> Result<AssembledFile, TransferError> {
        let len: usize = self.chunks.iter().map(Bytes::len).sum();
        if len as u64 != self.meta.size {
            return Err(TransferError::SizeMismatch {
                name: self.meta.name,
                expected: self.meta.size,
                actual: len as u64,
            });
        }
        let mut buf = BytesMut::with_capacity(len);
        for chunk in &self.chunks {
            buf.extend_from_slice(chunk);
        }
        Ok(AssembledFile {
            name: self.meta.name,
            mime: self.meta.mime,
            data: buf.freeze(),
        })
    }
}

/// Reassembles files from an ordered stream of direct-path frames.
pub struct DirectReceiver {
    transfer_id: String,
    current: Option<FileAssembly>,
}

impl DirectReceiver {
    pub fn new(transfer_id: impl Into<String>) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            current: None,
        }
    }

    pub fn accept(&mut self, frame: Frame) -> Result<DirectStep, TransferError> {
        match frame {
            Frame::Metadata(meta) => {
                if let Some(open) = &self.current {
                    return Err(TransferError::UnexpectedFrame(format!(
                        "metadata for file {} while file {} is incomplete",
                        meta.file_index, open.meta.file_index
                    )));
                }
                let assembly = FileAssembly {
                    chunks: Vec::new(),
                    meta,
                };
                if assembly.meta.total_chunks == 0 {
                    return Ok(DirectStep {
                        file: Some(assembly.finish()?),
                        ..Default::default()
                    });
                }
                self.current = Some(assembly);
                Ok(DirectStep::default())
            }
            Frame::Chunk { file_index, data, .. } => {
                let Some(open) = self.current.as_mut().filter(|a| a.meta.file_index == file_index) else {
                    return Err(TransferError::UnexpectedFrame(format!(
                        "chunk for file {file_index} without its metadata"
                    )));
                };
                let bytes = data.len() as u64;
                open.chunks.push(data);

                let mut step = DirectStep {
                    bytes,
                    ..Default::default()
                };
                if open.chunks.len() as u64 >= u64::from(open.meta.total_chunks) {
                    if let Some(done) = self.current.take() {
                        step.file = Some(done.finish()?);
                    }
                }
                Ok(step)
            }
            Frame::Complete { transfer_id } => {
                if transfer_id != self.transfer_id {
                    warn!(expected = %self.transfer_id, got = %transfer_id, "Ignoring completion for another transfer");
                    return Ok(DirectStep::default());
                }
                if let Some(open) = &self.current {
                    return Err(TransferError::UnexpectedFrame(format!(
                        "completion while file {} is incomplete",
                        open.meta.file_index
                    )));
                }
                Ok(DirectStep {
                    complete: true,
                    ..Default::default()
                })
            }
        }
    }
}

/// Result of feeding one relay chunk to a [`RelayReceiver`].
#[derive(Debug, Default)]
pub struct RelayStep {
    pub bytes: u64,
    /// Every file of the transfer, set once the last chunk arrives
    pub files: Option<Vec<AssembledFile>>,
}

/// Collects relay chunks by index; arrival order does not matter.
pub struct RelayReceiver {
    files: Vec<FileDescriptor>,
    chunks: BTreeMap<(u32, u32), Bytes>,
}

impl RelayReceiver {
    pub fn new(files: Vec<FileDescriptor>) -> Self {
        Self {
            files,
            chunks: BTreeMap::new(),
        }
    }

    pub fn accept(&mut self, chunk: RelayChunkPayload) -> Result<RelayStep, TransferError> {
        if chunk.file_index as usize >= self.files.len() {
            return Err(TransferError::UnexpectedFrame(format!(
                "relay chunk for unknown file {}",
                chunk.file_index
            )));
        }
        let data = Bytes::from(base64::engine::general_purpose::STANDARD.decode(chunk.data.as_bytes())?);
        let bytes = data.len() as u64;
        self.chunks.insert((chunk.file_index, chunk.chunk_index), data);

        let files = chunk.is_last.then(|| self.assemble());
        Ok(RelayStep { bytes, files })
    }

    fn assemble(&mut self) -> Vec<AssembledFile> {
        let chunks = std::mem::take(&mut self.chunks);
        let mut out = Vec::with_capacity(self.files.len());
        for (index, desc) in self.files.iter().enumerate() {
            let index = index as u32;
            let parts = chunks.range((index, 0)..=(index, u32::MAX));
            let mut buf = BytesMut::with_capacity(parts.clone().map(|(_, d)| d.len()).sum());
            for (_, data) in parts {
                buf.extend_from_slice(data);
            }
            if buf.len() as u64 != desc.size {
                // No acknowledgements on this path; a lost chunk shows up here
                warn!(file = %desc.name, expected = desc.size, actual = buf.len(), "Relayed file size differs");
            }
            out.push(AssembledFile {
                name: desc.name.clone(),
                mime: desc.mime.clone(),
                data: buf.freeze(),
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(index: u16, size: u64, total_chunks: u32) -> Frame {
        Frame::Metadata(FileMetadata {
            file_index: index,
            name: format!("f{index}"),
            size,
            mime: "application/octet-stream".into(),
            total_chunks,
        })
    }

    fn chunk(file: u16, index: u32, data: &'static [u8]) -> Frame {
        Frame::Chunk {
            file_index: file,
            chunk_index: index,
            data: Bytes::from_static(data),
        }
    }

    fn relay(file: u32, index: u32, data: &[u8], is_last: bool) -> RelayChunkPayload {
        RelayChunkPayload {
            transfer_id: "t".into(),
            file_index: file,
            chunk_index: index,
            data: base64::engine::general_purpose::STANDARD.encode(data),
            is_last,
        }
    }

    #[test]
    fn test_direct_two_files() {
        let mut rx = DirectReceiver::new("t");
        assert!(rx.accept(meta(0, 5, 2)).unwrap().file.is_none());
        assert_eq!(rx.accept(chunk(0, 0, b"hel")).unwrap().bytes, 3);
        let step = rx.accept(chunk(0, 1, b"lo")).unwrap();
        assert_eq!(step.file.unwrap().data, Bytes::from_static(b"hello"));

        rx.accept(meta(1, 2, 1)).unwrap();
        let step = rx.accept(chunk(1, 0, b"ok")).unwrap();
        assert_eq!(step.file.unwrap().name, "f1");

        assert!(rx.accept(Frame::Complete { transfer_id: "t".into() }).unwrap().complete);
    }

    #[test]
    fn test_direct_empty_file_finalised_at_metadata() {
        let mut rx = DirectReceiver::new("t");
        let step = rx.accept(meta(0, 0, 0)).unwrap();
        let file = step.file.unwrap();
        assert!(file.data.is_empty());
        assert!(rx.accept(Frame::Complete { transfer_id: "t".into() }).unwrap().complete);
    }

    #[test]
    fn test_direct_size_mismatch_fails() {
        let mut rx = DirectReceiver::new("t");
        rx.accept(meta(0, 10, 1)).unwrap();
        let err = rx.accept(chunk(0, 0, b"short")).unwrap_err();
        assert!(matches!(err, TransferError::SizeMismatch { expected: 10, actual: 5, .. }));
    }

    #[test]
    fn test_direct_chunk_without_metadata() {
        let mut rx = DirectReceiver::new("t");
        assert!(matches!(
            rx.accept(chunk(0, 0, b"x")),
            Err(TransferError::UnexpectedFrame(_))
        ));
    }

    #[test]
    fn test_direct_completion_for_other_transfer_ignored() {
        let mut rx = DirectReceiver::new("t");
        let step = rx.accept(Frame::Complete { transfer_id: "other".into() }).unwrap();
        assert!(!step.complete);
    }

    #[test]
    fn test_relay_out_of_order() {
        let files = vec![
            FileDescriptor::new("a.txt", 6, "text/plain"),
            FileDescriptor::new("b.txt", 3, "text/plain"),
        ];
        let mut rx = RelayReceiver::new(files);
        assert!(rx.accept(relay(0, 1, b"def", false)).unwrap().files.is_none());
        assert!(rx.accept(relay(1, 0, b"xyz", false)).unwrap().files.is_none());
        let step = rx.accept(relay(0, 0, b"abc", true)).unwrap();

        let files = step.files.unwrap();
        assert_eq!(files[0].data, Bytes::from_static(b"abcdef"));
        assert_eq!(files[1].data, Bytes::from_static(b"xyz"));
    }

    #[test]
    fn test_relay_all_empty_transfer() {
        let mut rx = RelayReceiver::new(vec![FileDescriptor::new("empty", 0, "")]);
        let step = rx.accept(relay(0, 0, b"", true)).unwrap();
        let files = step.files.unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].data.is_empty());
    }

    #[test]
    fn test_declared_sizes_are_not_trusted_for_buffers() {
        let mut rx = RelayReceiver::new(vec![FileDescriptor::new("big", u64::MAX, "")]);
        let files = rx.accept(relay(0, 0, b"abc", true)).unwrap().files.unwrap();
        assert_eq!(files[0].data, Bytes::from_static(b"abc"));

        let mut rx = DirectReceiver::new("t");
        rx.accept(meta(0, u64::MAX, u32::MAX)).unwrap();
        assert_eq!(rx.accept(chunk(0, 0, b"abc")).unwrap().bytes, 3);
    }

    #[test]
    fn test_relay_rejects_bad_input() {
        let mut rx = RelayReceiver::new(vec![FileDescriptor::new("a", 1, "")]);
        assert!(matches!(
            rx.accept(relay(3, 0, b"x", false)),
            Err(TransferError::UnexpectedFrame(_))
        ));
        let mut bad = relay(0, 0, b"x", false);
        bad.data = "***".into();
        assert!(matches!(rx.accept(bad), Err(TransferError::Base64(_))));
    }
}
