//! # Flux Core
//!
//! Peer-side library for Flux P2P file transfers: chunked framing,
//! multi-channel dispatch, checksum verification, backpressure-aware
//! sending, progress accounting, and cancellation.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         FLUX CORE MODULES                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────┐      ┌──────────────┐      ┌───────────────────┐     │
//! │  │  Signaling   │      │    Sender    │      │     Receiver      │     │
//! │  │              │      │              │      │                   │     │
//! │  │ - Hub wire   │      │ - Metadata   │      │ - Chunk collect   │     │
//! │  │   mirror     │      │ - Chunk pump │      │ - Coverage check  │     │
//! │  │ - Sessions   │      │ - Watermarks │      │ - SHA-256 verify  │     │
//! │  └──────────────┘      └──────┬───────┘      └─────────┬─────────┘     │
//! │                               │                        │               │
//! │                ┌──────────────┴────────────────────────┘               │
//! │                │                                                       │
//! │  ┌─────────────▼──────────────┐      ┌─────────────────────────────┐   │
//! │  │       Frame / Chunking     │      │        Transport            │   │
//! │  │                            │      │                             │   │
//! │  │ - 1-byte tag wire format   │      │ - N ordered reliable        │   │
//! │  │ - u32 BE chunk indices     │      │   binary channels           │   │
//! │  │ - whole-payload SHA-256    │      │ - buffered-bytes reporting  │   │
//! │  └────────────────────────────┘      └─────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The hub only ever sees the signaling mirror; chunk frames travel
//! directly between peers over the transport's data channels. Control
//! frames ride channel 0, chunk `i` rides channel `i % N`.

pub mod chunking;
pub mod error;
pub mod frame;
pub mod progress;
pub mod receiver;
pub mod sender;
pub mod signaling;
pub mod transport;

pub use chunking::{ChunkStore, CHANNEL_COUNT, CHUNK_SIZE};
pub use error::{Error, Result};
pub use frame::{Frame, TransferMetadata};
pub use progress::TransferEvent;
pub use receiver::{FileReceiver, ReceivedFile};
pub use sender::{CancelHandle, FileSender, HIGH_WATERMARK, LOW_WATERMARK};
pub use transport::{ChannelTransport, ConnectionState, TransportEvent};

#[cfg(test)]
mod tests {
    //! End-to-end transfers over the in-memory loopback transport.

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::transport::memory_pair;
    use super::*;

    /// Deterministic pseudo-random payload (xorshift), so failures
    /// reproduce without seeding a real RNG.
    fn pseudo_random_payload(len: usize) -> Vec<u8> {
        let mut state = 0x243F_6A88_85A3_08D3u64;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            out.extend_from_slice(&state.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    #[tokio::test]
    async fn test_ten_mib_transfer_end_to_end() {
        let ((a, a_rx), (b, b_rx)) = memory_pair(CHANNEL_COUNT);
        let (send_events, _send_events_rx) = mpsc::unbounded_channel();
        let (recv_events, _recv_events_rx) = mpsc::unbounded_channel();
        let scratch = tempfile::tempdir().unwrap();

        let payload = pseudo_random_payload(10 * 1024 * 1024);
        let (sender, _send_handle) = FileSender::new(
            &a,
            "S1",
            "r.bin",
            Some("bin".to_string()),
            Bytes::from(payload.clone()),
            send_events,
        );
        // 10 MiB / 64 KiB with no partial tail.
        assert_eq!(sender.metadata().total_chunks, 160);
        let declared = sender.metadata().checksum.clone();

        let (receiver, _recv_handle) = FileReceiver::new(&b, scratch.path(), recv_events);

        let recv_task = tokio::spawn(receiver.run(b_rx));
        let send_task = tokio::spawn(sender.run(a_rx));

        send_task.await.unwrap().unwrap();
        let received = recv_task.await.unwrap().unwrap();

        assert_eq!(received.transfer_id, "S1");
        assert_eq!(received.size, payload.len() as u64);
        assert_eq!(received.checksum, declared);
        assert_eq!(std::fs::read(&received.path).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_exact_chunk_multiple_end_to_end() {
        let ((a, a_rx), (b, b_rx)) = memory_pair(CHANNEL_COUNT);
        let (send_events, _tx_rx) = mpsc::unbounded_channel();
        let (recv_events, _rx_rx) = mpsc::unbounded_channel();
        let scratch = tempfile::tempdir().unwrap();

        // Exactly two chunks, no tail.
        let payload = pseudo_random_payload(2 * CHUNK_SIZE);
        let (sender, _h1) = FileSender::new(
            &a,
            "S2",
            "even.bin",
            None,
            Bytes::from(payload.clone()),
            send_events,
        );
        assert_eq!(sender.metadata().total_chunks, 2);

        let (receiver, _h2) = FileReceiver::new(&b, scratch.path(), recv_events);

        let recv_task = tokio::spawn(receiver.run(b_rx));
        tokio::spawn(sender.run(a_rx)).await.unwrap().unwrap();

        let received = recv_task.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&received.path).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_zero_byte_transfer_end_to_end() {
        let ((a, a_rx), (b, b_rx)) = memory_pair(CHANNEL_COUNT);
        let (send_events, _tx_rx) = mpsc::unbounded_channel();
        let (recv_events, _rx_rx) = mpsc::unbounded_channel();
        let scratch = tempfile::tempdir().unwrap();

        let (sender, _h1) =
            FileSender::new(&a, "S3", "empty.bin", None, Bytes::new(), send_events);
        let (receiver, _h2) = FileReceiver::new(&b, scratch.path(), recv_events);

        let recv_task = tokio::spawn(receiver.run(b_rx));
        tokio::spawn(sender.run(a_rx)).await.unwrap().unwrap();

        let received = recv_task.await.unwrap().unwrap();
        assert_eq!(received.size, 0);
    }

    #[tokio::test]
    async fn test_split_reassemble_law() {
        let payload = pseudo_random_payload(1_000_003); // ragged tail
        let total = chunking::chunk_count(payload.len() as u64, CHUNK_SIZE);

        let mut store = ChunkStore::new(total);
        for (i, window) in payload.chunks(CHUNK_SIZE).enumerate() {
            store.insert(i as u32, Bytes::copy_from_slice(window));
        }

        assert_eq!(store.reassemble().unwrap(), payload);
    }
}
