//! # Wire Framing
//!
//! Byte-exact framing for the transfer protocol. Every frame starts with a
//! one-byte type tag; the payload layout depends on the tag:
//!
//! ```text
//! ┌──────┬────────────────┬──────────────────────────────────────────┐
//! │ Tag  │ Name           │ Payload                                  │
//! ├──────┼────────────────┼──────────────────────────────────────────┤
//! │  1   │ FILE_METADATA  │ UTF-8 JSON TransferMetadata              │
//! │  2   │ FILE_CHUNK     │ u32 index (big-endian) ‖ chunk bytes     │
//! │  3   │ FILE_COMPLETE  │ UTF-8 hex SHA-256 of the full payload    │
//! │  4   │ TRANSFER_ACK   │ UTF-8 transfer id                        │
//! │  5   │ TRANSFER_SUCCESS │ UTF-8 transfer id                      │
//! │  6   │ TRANSFER_FAILED  │ UTF-8 failure reason                   │
//! │  7   │ TRANSFER_CANCEL  │ UTF-8 transfer id                      │
//! └──────┴────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! Control frames (everything except FILE_CHUNK) travel on channel 0 only;
//! chunk frames are fanned out `index % channel_count`.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Frame type tags, as they appear on the wire.
pub const FILE_METADATA: u8 = 1;
pub const FILE_CHUNK: u8 = 2;
pub const FILE_COMPLETE: u8 = 3;
pub const TRANSFER_ACK: u8 = 4;
pub const TRANSFER_SUCCESS: u8 = 5;
pub const TRANSFER_FAILED: u8 = 6;
pub const TRANSFER_CANCEL: u8 = 7;

/// The channel index reserved for control frames.
pub const CONTROL_CHANNEL: usize = 0;

/// Per-file metadata, carried as the JSON payload of a FILE_METADATA frame.
///
/// The transfer id equals the signaling session id that negotiated the
/// direct link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    /// Unique transfer identifier (the signaling session id).
    pub transfer_id: String,
    /// Original filename.
    pub file_name: String,
    /// Total payload size in bytes.
    pub file_size: u64,
    /// File-type tag (extension), if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    /// Total number of chunks: ceil(file_size / chunk_size).
    pub total_chunks: u32,
    /// Hex-encoded SHA-256 of the entire payload.
    pub checksum: String,
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Transfer announcement, sent first on channel 0.
    Metadata(TransferMetadata),
    /// One bounded slice of the payload with its strict index.
    Chunk { index: u32, data: Bytes },
    /// All chunks submitted; carries the whole-payload checksum.
    Complete { checksum: String },
    /// Receiver is ready for chunks.
    Ack { transfer_id: String },
    /// Receiver verified and persisted the payload.
    Success { transfer_id: String },
    /// Terminal failure with a human-readable reason.
    Failed { reason: String },
    /// Terminal cancellation from either side.
    Cancel { transfer_id: String },
}

impl Frame {
    /// The wire tag for this frame.
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Metadata(_) => FILE_METADATA,
            Frame::Chunk { .. } => FILE_CHUNK,
            Frame::Complete { .. } => FILE_COMPLETE,
            Frame::Ack { .. } => TRANSFER_ACK,
            Frame::Success { .. } => TRANSFER_SUCCESS,
            Frame::Failed { .. } => TRANSFER_FAILED,
            Frame::Cancel { .. } => TRANSFER_CANCEL,
        }
    }

    /// Short name for logging and error reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Metadata(_) => "FILE_METADATA",
            Frame::Chunk { .. } => "FILE_CHUNK",
            Frame::Complete { .. } => "FILE_COMPLETE",
            Frame::Ack { .. } => "TRANSFER_ACK",
            Frame::Success { .. } => "TRANSFER_SUCCESS",
            Frame::Failed { .. } => "TRANSFER_FAILED",
            Frame::Cancel { .. } => "TRANSFER_CANCEL",
        }
    }

    /// Whether this frame must travel on the control channel.
    pub fn is_control(&self) -> bool {
        !matches!(self, Frame::Chunk { .. })
    }

    /// Encode the frame into its wire representation.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.tag());

        match self {
            Frame::Metadata(meta) => {
                let json = serde_json::to_vec(meta)
                    .map_err(|e| Error::InvalidMetadata(e.to_string()))?;
                buf.put_slice(&json);
            }
            Frame::Chunk { index, data } => {
                buf.put_u32(*index);
                buf.put_slice(data);
            }
            Frame::Complete { checksum } => buf.put_slice(checksum.as_bytes()),
            Frame::Ack { transfer_id } => buf.put_slice(transfer_id.as_bytes()),
            Frame::Success { transfer_id } => buf.put_slice(transfer_id.as_bytes()),
            Frame::Failed { reason } => buf.put_slice(reason.as_bytes()),
            Frame::Cancel { transfer_id } => buf.put_slice(transfer_id.as_bytes()),
        }

        Ok(buf.freeze())
    }

    /// Decode a frame from its wire representation.
    pub fn decode(raw: &[u8]) -> Result<Frame> {
        let (&tag, payload) = raw.split_first().ok_or(Error::EmptyFrame)?;

        match tag {
            FILE_METADATA => {
                let meta: TransferMetadata = serde_json::from_slice(payload)
                    .map_err(|e| Error::InvalidMetadata(e.to_string()))?;
                Ok(Frame::Metadata(meta))
            }
            FILE_CHUNK => {
                if payload.len() < 4 {
                    return Err(Error::TruncatedFrame("chunk index"));
                }
                let index = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                Ok(Frame::Chunk {
                    index,
                    data: Bytes::copy_from_slice(&payload[4..]),
                })
            }
            FILE_COMPLETE => Ok(Frame::Complete {
                checksum: utf8_payload(payload)?,
            }),
            TRANSFER_ACK => Ok(Frame::Ack {
                transfer_id: utf8_payload(payload)?,
            }),
            TRANSFER_SUCCESS => Ok(Frame::Success {
                transfer_id: utf8_payload(payload)?,
            }),
            TRANSFER_FAILED => Ok(Frame::Failed {
                reason: utf8_payload(payload)?,
            }),
            TRANSFER_CANCEL => Ok(Frame::Cancel {
                transfer_id: utf8_payload(payload)?,
            }),
            other => Err(Error::UnknownFrameType(other)),
        }
    }
}

fn utf8_payload(payload: &[u8]) -> Result<String> {
    String::from_utf8(payload.to_vec()).map_err(|_| Error::InvalidPayloadEncoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_metadata() -> TransferMetadata {
        TransferMetadata {
            transfer_id: "sess-1".to_string(),
            file_name: "report.pdf".to_string(),
            file_size: 131072,
            file_type: Some("pdf".to_string()),
            total_chunks: 2,
            checksum: "ab".repeat(32),
        }
    }

    #[test]
    fn test_metadata_round_trip() {
        let frame = Frame::Metadata(test_metadata());
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded[0], FILE_METADATA);

        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_metadata_json_is_camel_case() {
        let json = serde_json::to_string(&test_metadata()).unwrap();
        assert!(json.contains("\"transferId\""));
        assert!(json.contains("\"fileName\""));
        assert!(json.contains("\"fileSize\""));
        assert!(json.contains("\"totalChunks\""));
    }

    #[test]
    fn test_metadata_file_type_optional() {
        let mut meta = test_metadata();
        meta.file_type = None;
        let json = serde_json::to_string(&meta).unwrap();
        assert!(!json.contains("fileType"));

        let parsed: TransferMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.file_type, None);
    }

    #[test]
    fn test_chunk_round_trip() {
        let frame = Frame::Chunk {
            index: 1_000_000,
            data: Bytes::from_static(b"hello chunk"),
        };
        let encoded = frame.encode().unwrap();

        // Tag, then big-endian index, then raw bytes.
        assert_eq!(encoded[0], FILE_CHUNK);
        assert_eq!(&encoded[1..5], &1_000_000u32.to_be_bytes());
        assert_eq!(&encoded[5..], b"hello chunk");

        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_chunk_index_boundaries() {
        for index in [0u32, 1, u32::MAX] {
            let frame = Frame::Chunk {
                index,
                data: Bytes::new(),
            };
            let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_empty_chunk_data_allowed() {
        let encoded = Frame::Chunk {
            index: 3,
            data: Bytes::new(),
        }
        .encode()
        .unwrap();
        assert_eq!(encoded.len(), 5);
    }

    #[test]
    fn test_control_frames_round_trip() {
        let frames = vec![
            Frame::Complete {
                checksum: "deadbeef".to_string(),
            },
            Frame::Ack {
                transfer_id: "sess-1".to_string(),
            },
            Frame::Success {
                transfer_id: "sess-1".to_string(),
            },
            Frame::Failed {
                reason: "Checksum mismatch".to_string(),
            },
            Frame::Cancel {
                transfer_id: "sess-1".to_string(),
            },
        ];

        for frame in frames {
            let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_control_channel_classification() {
        assert!(Frame::Ack {
            transfer_id: "t".to_string()
        }
        .is_control());
        assert!(!Frame::Chunk {
            index: 0,
            data: Bytes::new()
        }
        .is_control());
    }

    #[test]
    fn test_decode_empty_frame() {
        assert!(matches!(Frame::decode(&[]), Err(Error::EmptyFrame)));
    }

    #[test]
    fn test_decode_unknown_tag() {
        assert!(matches!(
            Frame::decode(&[99, 1, 2, 3]),
            Err(Error::UnknownFrameType(99))
        ));
    }

    #[test]
    fn test_decode_truncated_chunk() {
        assert!(matches!(
            Frame::decode(&[FILE_CHUNK, 0, 0]),
            Err(Error::TruncatedFrame(_))
        ));
    }

    #[test]
    fn test_decode_bad_metadata_json() {
        let mut raw = vec![FILE_METADATA];
        raw.extend_from_slice(b"not json");
        assert!(matches!(
            Frame::decode(&raw),
            Err(Error::InvalidMetadata(_))
        ));
    }
}
