//! Binary frames carried over a direct data channel.
//!
//! | Frame    | Byte 0 | Following bytes                                    |
//! |----------|--------|----------------------------------------------------|
//! | metadata | 1      | u32 BE length, then that many bytes of JSON        |
//! | chunk    | 2      | u16 BE file index, u32 BE chunk index, raw bytes   |
//! | complete | 3      | u8 id length, then the UTF-8 transfer id           |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::FrameError;

pub const TAG_METADATA: u8 = 1;
pub const TAG_CHUNK: u8 = 2;
pub const TAG_COMPLETE: u8 = 3;

/// Per-file header sent before a file's chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_index: u16,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime: String,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Metadata(FileMetadata),
    Chunk {
        file_index: u16,
        chunk_index: u32,
        data: Bytes,
    },
    Complete {
        transfer_id: String,
    },
}

impl Frame {
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        match self {
            Frame::Metadata(meta) => {
                let json =
                    serde_json::to_vec(meta).map_err(|e| FrameError::Metadata(e.to_string()))?;
                let len = u32::try_from(json.len())
                    .map_err(|_| FrameError::Metadata("metadata too large".into()))?;
                let mut buf = BytesMut::with_capacity(5 + json.len());
                buf.put_u8(TAG_METADATA);
                buf.put_u32(len);
                buf.put_slice(&json);
                Ok(buf.freeze())
            }
            Frame::Chunk {
                file_index,
                chunk_index,
                data,
            } => {
                let mut buf = BytesMut::with_capacity(7 + data.len());
                buf.put_u8(TAG_CHUNK);
                buf.put_u16(*file_index);
                buf.put_u32(*chunk_index);
                buf.put_slice(data);
                Ok(buf.freeze())
            }
            Frame::Complete { transfer_id } => {
                let id = transfer_id.as_bytes();
                let len = u8::try_from(id.len()).map_err(|_| FrameError::IdTooLong(id.len()))?;
                let mut buf = BytesMut::with_capacity(2 + id.len());
                buf.put_u8(TAG_COMPLETE);
                buf.put_u8(len);
                buf.put_slice(id);
                Ok(buf.freeze())
            }
        }
    }

    /// Decode one frame. Chunk data is a zero-copy slice of `raw`.
    pub fn decode(raw: Bytes) -> Result<Self, FrameError> {
        let mut buf = raw;
        if !buf.has_remaining() {
            return Err(FrameError::Empty);
        }

        match buf.get_u8() {
            TAG_METADATA => {
                need(&buf, 4)?;
                let len = buf.get_u32() as usize;
                need(&buf, len)?;
                let meta: FileMetadata = serde_json::from_slice(&buf[..len])
                    .map_err(|e| FrameError::Metadata(e.to_string()))?;
                Ok(Frame::Metadata(meta))
            }
            TAG_CHUNK => {
                need(&buf, 6)?;
                let file_index = buf.get_u16();
                let chunk_index = buf.get_u32();
                Ok(Frame::Chunk {
                    file_index,
                    chunk_index,
                    data: buf,
                })
            }
            TAG_COMPLETE => {
                need(&buf, 1)?;
                let len = buf.get_u8() as usize;
                need(&buf, len)?;
                let transfer_id = std::str::from_utf8(&buf[..len])
                    .map_err(|_| FrameError::InvalidUtf8)?
                    .to_string();
                Ok(Frame::Complete { transfer_id })
            }
            other => Err(FrameError::UnknownTag(other)),
        }
    }

    /// Build a chunk frame, checking the file index fits the wire field.
    pub fn chunk(file_index: usize, chunk_index: u32, data: Bytes) -> Result<Self, FrameError> {
        let file_index =
            u16::try_from(file_index).map_err(|_| FrameError::FileIndexOutOfRange(file_index))?;
        Ok(Frame::Chunk {
            file_index,
            chunk_index,
            data,
        })
    }
}

fn need(buf: &Bytes, needed: usize) -> Result<(), FrameError> {
    if buf.remaining() < needed {
        return Err(FrameError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}
