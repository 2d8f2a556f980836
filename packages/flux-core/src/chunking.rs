//! # File Chunking
//!
//! Splits payloads into fixed-size chunks for multi-channel transfer and
//! collects them back on the receiving side.
//!
//! There is no per-chunk checksum: integrity is verified once, against the
//! whole-payload SHA-256 declared in the metadata frame. The receiver-side
//! `ChunkStore` tolerates duplicate deliveries (first occurrence wins) and
//! out-of-order arrival across channels.

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Default chunk size: 64 KiB.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Default number of parallel data channels.
pub const CHANNEL_COUNT: usize = 4;

/// Number of chunks a payload of `size` bytes splits into.
///
/// Zero-byte payloads produce zero chunks; the transfer then consists of
/// metadata and completion frames only.
pub fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    if size == 0 {
        0
    } else {
        ((size + chunk_size as u64 - 1) / chunk_size as u64) as u32
    }
}

/// Hex-encoded SHA-256 of a payload.
pub fn checksum_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compare two hex digests case-insensitively.
pub fn checksums_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Receiver-side chunk collection.
///
/// Maps chunk index to its bytes. The first delivery of an index wins;
/// later duplicates are dropped without affecting the byte accounting.
#[derive(Debug)]
pub struct ChunkStore {
    slots: Vec<Option<Bytes>>,
    received: u32,
    received_bytes: u64,
}

impl ChunkStore {
    /// Create a store expecting `total_chunks` indices.
    pub fn new(total_chunks: u32) -> Self {
        Self {
            slots: vec![None; total_chunks as usize],
            received: 0,
            received_bytes: 0,
        }
    }

    /// Store a chunk. Returns the number of bytes newly accounted for:
    /// the chunk length on first delivery, zero for duplicates.
    ///
    /// Indices at or beyond the declared chunk count are dropped; the
    /// whole-payload digest check catches any sender that miscounted.
    pub fn insert(&mut self, index: u32, data: Bytes) -> u64 {
        let Some(slot) = self.slots.get_mut(index as usize) else {
            tracing::warn!(index, total = self.slots.len(), "Chunk index out of range, dropping");
            return 0;
        };

        if slot.is_some() {
            tracing::debug!(index, "Duplicate chunk, keeping first delivery");
            return 0;
        }

        let len = data.len() as u64;
        *slot = Some(data);
        self.received += 1;
        self.received_bytes += len;
        len
    }

    /// Total bytes received so far (duplicates excluded).
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Number of distinct indices received.
    pub fn received_count(&self) -> u32 {
        self.received
    }

    /// The smallest index that has not been received, if any.
    pub fn first_missing(&self) -> Option<u32> {
        self.slots
            .iter()
            .position(|slot| slot.is_none())
            .map(|i| i as u32)
    }

    /// Whether every index `0 … N-1` has been received.
    pub fn is_complete(&self) -> bool {
        self.received as usize == self.slots.len()
    }

    /// Concatenate all chunks in index order.
    ///
    /// Fails with the smallest missing index if coverage is incomplete.
    pub fn reassemble(self) -> Result<Vec<u8>> {
        if let Some(missing) = self.first_missing() {
            return Err(Error::MissingChunk(missing));
        }

        let mut payload = Vec::with_capacity(self.received_bytes as usize);
        for slot in self.slots {
            payload.extend_from_slice(&slot.expect("coverage checked above"));
        }
        Ok(payload)
    }
}
