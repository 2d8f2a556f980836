//! # Error Handling
//!
//! Error types for the Flux transfer protocol, categorized by layer:
//! wire framing, transfer state machine, transport adapter, and I/O.

use thiserror::Error;

/// Result type alias for flux-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for flux-core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Frame Errors
    // ========================================================================

    /// A frame arrived with no bytes at all
    #[error("Empty frame")]
    EmptyFrame,

    /// The leading type byte is not one of the known frame types
    #[error("Unknown frame type: {0}")]
    UnknownFrameType(u8),

    /// The frame ended before its fixed-size header was complete
    #[error("Truncated frame: {0}")]
    TruncatedFrame(&'static str),

    /// The FILE_METADATA JSON payload failed to parse
    #[error("Invalid metadata payload: {0}")]
    InvalidMetadata(String),

    /// A text payload (checksum, transfer id, reason) was not valid UTF-8
    #[error("Invalid UTF-8 in frame payload")]
    InvalidPayloadEncoding,

    // ========================================================================
    // Transfer Errors
    // ========================================================================

    /// The receiver finished collection with a gap in the chunk index set
    #[error("Missing chunk {0}")]
    MissingChunk(u32),

    /// The reassembled payload's digest does not match the declared checksum
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// The remote peer reported the transfer as failed
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// The transfer was cancelled, locally or by the remote peer
    #[error("Transfer cancelled")]
    Cancelled,

    // ========================================================================
    // Transport Errors
    // ========================================================================

    /// The transport adapter was dropped while a transfer still held a handle
    #[error("Transport closed")]
    TransportClosed,

    /// The adapter refused a frame on the given channel
    #[error("Transport send failed on channel {channel}: {reason}")]
    TransportSend { channel: usize, reason: String },

    /// The transport event stream ended before the transfer reached a
    /// terminal state
    #[error("Transport event stream ended")]
    EventStreamEnded,

    // ========================================================================
    // I/O Errors
    // ========================================================================

    /// Scratch-file persistence failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
