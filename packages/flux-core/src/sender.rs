//! # Transfer Sender
//!
//! Driver for the sending side of a transfer:
//!
//! ```text
//! idle → metadata sent → (await ACK) → sending chunks → complete sent
//!      → (await SUCCESS | FAILED) → done
//! ```
//!
//! Chunks are emitted in strictly ascending index order and fanned out
//! across the data channels as `index % channel_count`; the receiver may
//! therefore observe out-of-order arrival across channels, but never within
//! one. Before each chunk the aggregate buffered-byte count is checked
//! against the high watermark; when it trips, the pump parks until a drain
//! notification brings the aggregate back under the low watermark. Control
//! frames are never gated.

use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::chunking::{checksum_hex, chunk_count, CHUNK_SIZE};
use crate::error::{Error, Result};
use crate::frame::{Frame, TransferMetadata, CONTROL_CHANNEL};
use crate::progress::{ProgressMeter, TransferEvent};
use crate::transport::{ChannelTransport, ConnectionState, TransportEvent};

/// Pause chunk dispatch when aggregate buffered bytes exceed this.
pub const HIGH_WATERMARK: u64 = 16 * 1024 * 1024;

/// Resume chunk dispatch once aggregate buffered bytes drop below this.
pub const LOW_WATERMARK: u64 = 4 * 1024 * 1024;

/// Handle for cancelling a running transfer from outside its driver task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Request cancellation. The driver sends `TRANSFER_CANCEL`, tears down
    /// local state, and reports `cancelled` to the consumer.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Control-path signals a sender cares about, distilled from the raw
/// transport event stream.
enum Control {
    Ack,
    Success,
    Failed(String),
    Cancel,
    Drained,
}

fn control_signal(event: TransportEvent) -> Result<Option<Control>> {
    match event {
        TransportEvent::Inbound { channel, data } => {
            if channel != CONTROL_CHANNEL {
                return Ok(None);
            }
            match Frame::decode(&data) {
                Ok(Frame::Ack { .. }) => Ok(Some(Control::Ack)),
                Ok(Frame::Success { .. }) => Ok(Some(Control::Success)),
                Ok(Frame::Failed { reason }) => Ok(Some(Control::Failed(reason))),
                Ok(Frame::Cancel { .. }) => Ok(Some(Control::Cancel)),
                Ok(other) => {
                    tracing::debug!(frame = other.kind(), "Ignoring frame on sender control path");
                    Ok(None)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping undecodable control frame");
                    Ok(None)
                }
            }
        }
        TransportEvent::BufferDrained { .. } => Ok(Some(Control::Drained)),
        TransportEvent::ChannelClosed(CONTROL_CHANNEL) => Err(Error::TransportClosed),
        TransportEvent::StateChanged(ConnectionState::Disconnected) => Err(Error::TransportClosed),
        TransportEvent::StateChanged(ConnectionState::Failed(reason)) => {
            Err(Error::TransferFailed(reason))
        }
        _ => Ok(None),
    }
}

/// The sending side of one file transfer.
pub struct FileSender {
    transport: Weak<dyn ChannelTransport>,
    meta: TransferMetadata,
    payload: Bytes,
    chunk_size: usize,
    events: mpsc::UnboundedSender<TransferEvent>,
    cancel_rx: watch::Receiver<bool>,
}

impl FileSender {
    /// Prepare a transfer of `payload` with the default chunk size.
    ///
    /// The transport is held weakly: it outlives the transfer and is never
    /// kept alive by it.
    pub fn new<T: ChannelTransport + 'static>(
        transport: &Arc<T>,
        transfer_id: impl Into<String>,
        file_name: impl Into<String>,
        file_type: Option<String>,
        payload: Bytes,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> (Self, CancelHandle) {
        Self::with_chunk_size(
            transport, transfer_id, file_name, file_type, payload, events, CHUNK_SIZE,
        )
    }

    /// Prepare a transfer with an explicit chunk size.
    pub fn with_chunk_size<T: ChannelTransport + 'static>(
        transport: &Arc<T>,
        transfer_id: impl Into<String>,
        file_name: impl Into<String>,
        file_type: Option<String>,
        payload: Bytes,
        events: mpsc::UnboundedSender<TransferEvent>,
        chunk_size: usize,
    ) -> (Self, CancelHandle) {
        let meta = TransferMetadata {
            transfer_id: transfer_id.into(),
            file_name: file_name.into(),
            file_size: payload.len() as u64,
            file_type,
            total_chunks: chunk_count(payload.len() as u64, chunk_size),
            checksum: checksum_hex(&payload),
        };

        let (handle, cancel_rx) = CancelHandle::new();
        let sender = Self {
            transport: Arc::downgrade(transport) as Weak<dyn ChannelTransport>,
            meta,
            payload,
            chunk_size,
            events,
            cancel_rx,
        };
        (sender, handle)
    }

    /// The metadata this sender will announce.
    pub fn metadata(&self) -> &TransferMetadata {
        &self.meta
    }

    /// Run the transfer to a terminal state.
    ///
    /// `transport_events` is this endpoint's transport event stream; the
    /// sender consumes control frames from channel 0 and drain
    /// notifications from every channel.
    pub async fn run(
        self,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<()> {
        let FileSender {
            transport,
            meta,
            payload,
            chunk_size,
            events,
            cancel_rx,
        } = self;

        let transfer_id = meta.transfer_id.clone();
        let total_chunks = meta.total_chunks;
        let mut cancel = cancel_rx;
        let mut cancel_alive = true;
        let mut meter = ProgressMeter::new(meta.file_size);

        let upgrade = |weak: &Weak<dyn ChannelTransport>| {
            weak.upgrade().ok_or(Error::TransportClosed)
        };

        let emit = |event: TransferEvent| {
            let _ = events.send(event);
        };

        let local_cancel = || -> Result<()> {
            if let Some(t) = transport.upgrade() {
                if let Ok(raw) = (Frame::Cancel {
                    transfer_id: transfer_id.clone(),
                })
                .encode()
                {
                    let _ = t.send(CONTROL_CHANNEL, raw);
                }
            }
            tracing::info!(transfer_id = %transfer_id, "Transfer cancelled locally");
            emit(TransferEvent::Cancelled {
                transfer_id: transfer_id.clone(),
            });
            Err(Error::Cancelled)
        };

        let remote_cancel = || -> Result<()> {
            tracing::info!(transfer_id = %transfer_id, "Transfer cancelled by peer");
            emit(TransferEvent::Cancelled {
                transfer_id: transfer_id.clone(),
            });
            Err(Error::Cancelled)
        };

        let remote_failed = |reason: String| -> Result<()> {
            tracing::warn!(transfer_id = %transfer_id, reason = %reason, "Peer reported failure");
            emit(TransferEvent::Failed {
                transfer_id: transfer_id.clone(),
                reason: reason.clone(),
            });
            Err(Error::TransferFailed(reason))
        };

        let channel_count = upgrade(&transport)?.channel_count();
        if channel_count == 0 {
            return Err(Error::TransportSend {
                channel: 0,
                reason: "no channels open".to_string(),
            });
        }

        // ── Announce ──────────────────────────────────────────────────────
        upgrade(&transport)?.send(CONTROL_CHANNEL, Frame::Metadata(meta.clone()).encode()?)?;
        tracing::debug!(
            transfer_id = %transfer_id,
            size = meta.file_size,
            chunks = total_chunks,
            "Metadata sent, awaiting ACK"
        );

        // ── Await ACK ─────────────────────────────────────────────────────
        loop {
            tokio::select! {
                res = cancel.changed(), if cancel_alive => match res {
                    Ok(()) if *cancel.borrow() => return local_cancel(),
                    Ok(()) => {}
                    Err(_) => cancel_alive = false,
                },
                ev = transport_events.recv() => {
                    match control_signal(ev.ok_or(Error::EventStreamEnded)?)? {
                        Some(Control::Ack) => break,
                        Some(Control::Failed(reason)) => return remote_failed(reason),
                        Some(Control::Cancel) => return remote_cancel(),
                        _ => {}
                    }
                }
            }
        }

        // ── Chunk pump ────────────────────────────────────────────────────
        for index in 0..total_chunks {
            if *cancel.borrow() {
                return local_cancel();
            }

            // Absorb any control traffic that arrived between chunks.
            loop {
                match transport_events.try_recv() {
                    Ok(ev) => match control_signal(ev)? {
                        Some(Control::Failed(reason)) => return remote_failed(reason),
                        Some(Control::Cancel) => return remote_cancel(),
                        _ => {}
                    },
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        return Err(Error::EventStreamEnded)
                    }
                }
            }

            // Backpressure gate: park until the aggregate drains.
            while upgrade(&transport)?.total_buffered() > HIGH_WATERMARK {
                tracing::trace!(transfer_id = %transfer_id, index, "Paused on high watermark");
                tokio::select! {
                    res = cancel.changed(), if cancel_alive => match res {
                        Ok(()) if *cancel.borrow() => return local_cancel(),
                        Ok(()) => {}
                        Err(_) => cancel_alive = false,
                    },
                    ev = transport_events.recv() => {
                        match control_signal(ev.ok_or(Error::EventStreamEnded)?)? {
                            Some(Control::Drained) => {
                                if upgrade(&transport)?.total_buffered() < LOW_WATERMARK {
                                    break;
                                }
                            }
                            Some(Control::Failed(reason)) => return remote_failed(reason),
                            Some(Control::Cancel) => return remote_cancel(),
                            _ => {}
                        }
                    }
                }
            }

            let start = index as usize * chunk_size;
            let end = (start + chunk_size).min(payload.len());
            let channel = index as usize % channel_count;
            upgrade(&transport)?.send(
                channel,
                Frame::Chunk {
                    index,
                    data: payload.slice(start..end),
                }
                .encode()?,
            )?;

            // Report once per channel-wide batch, then yield the task.
            if (index + 1) % channel_count as u32 == 0 || index + 1 == total_chunks {
                let (bytes, speed) = meter.record(end as u64);
                emit(TransferEvent::Progress {
                    transfer_id: transfer_id.clone(),
                    bytes_transferred: bytes,
                    total_bytes: meta.file_size,
                    speed_bps: speed,
                });
                tokio::task::yield_now().await;
            }
        }

        // ── Completion handshake ──────────────────────────────────────────
        upgrade(&transport)?.send(
            CONTROL_CHANNEL,
            Frame::Complete {
                checksum: meta.checksum.clone(),
            }
            .encode()?,
        )?;
        tracing::debug!(transfer_id = %transfer_id, "All chunks submitted, awaiting verdict");

        loop {
            tokio::select! {
                res = cancel.changed(), if cancel_alive => match res {
                    Ok(()) if *cancel.borrow() => return local_cancel(),
                    Ok(()) => {}
                    Err(_) => cancel_alive = false,
                },
                ev = transport_events.recv() => {
                    match control_signal(ev.ok_or(Error::EventStreamEnded)?)? {
                        Some(Control::Success) => {
                            tracing::info!(
                                transfer_id = %transfer_id,
                                size = meta.file_size,
                                "Transfer complete"
                            );
                            emit(TransferEvent::Completed {
                                transfer_id: transfer_id.clone(),
                                file_name: meta.file_name.clone(),
                                total_bytes: meta.file_size,
                                path: None,
                            });
                            return Ok(());
                        }
                        Some(Control::Failed(reason)) => return remote_failed(reason),
                        Some(Control::Cancel) => return remote_cancel(),
                        _ => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_pair;

    fn collect_frames(
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Vec<(usize, Frame)> {
        let mut frames = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let TransportEvent::Inbound { channel, data } = ev {
                frames.push((channel, Frame::decode(&data).unwrap()));
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_sender_emits_metadata_then_waits_for_ack() {
        let ((a, a_rx), (b, mut b_rx)) = memory_pair(4);
        let (event_tx, _event_rx) = mpsc::unbounded_channel();

        let payload = Bytes::from(vec![7u8; 24]);
        let (sender, _handle) = FileSender::with_chunk_size(
            &a, "sess-1", "r.bin", None, payload.clone(), event_tx, 8,
        );
        assert_eq!(sender.metadata().total_chunks, 3);

        let driver = tokio::spawn(sender.run(a_rx));
        tokio::task::yield_now().await;

        // Only metadata so far — chunks must wait for the ACK.
        let frames = collect_frames(&mut b_rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], (CONTROL_CHANNEL, Frame::Metadata(_))));

        // ACK, then the chunk stream plus completion should flow.
        b.send(
            CONTROL_CHANNEL,
            Frame::Ack {
                transfer_id: "sess-1".to_string(),
            }
            .encode()
            .unwrap(),
        )
        .unwrap();

        // Let the pump run, then deliver the verdict.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let frames = collect_frames(&mut b_rx);
        let chunk_indices: Vec<u32> = frames
            .iter()
            .filter_map(|(_, f)| match f {
                Frame::Chunk { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(chunk_indices, vec![0, 1, 2]);
        assert!(frames
            .iter()
            .any(|(ch, f)| *ch == CONTROL_CHANNEL && matches!(f, Frame::Complete { .. })));

        b.send(
            CONTROL_CHANNEL,
            Frame::Success {
                transfer_id: "sess-1".to_string(),
            }
            .encode()
            .unwrap(),
        )
        .unwrap();

        driver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_chunks_fan_out_round_robin() {
        let ((a, a_rx), (b, mut b_rx)) = memory_pair(4);
        let (event_tx, _event_rx) = mpsc::unbounded_channel();

        // 6 chunks over 4 channels: 0,1,2,3,0,1
        let payload = Bytes::from(vec![1u8; 6 * 8]);
        let (sender, _handle) =
            FileSender::with_chunk_size(&a, "sess-2", "f.bin", None, payload, event_tx, 8);

        let driver = tokio::spawn(sender.run(a_rx));
        tokio::task::yield_now().await;
        b.send(
            CONTROL_CHANNEL,
            Frame::Ack {
                transfer_id: "sess-2".to_string(),
            }
            .encode()
            .unwrap(),
        )
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let channels: Vec<usize> = collect_frames(&mut b_rx)
            .into_iter()
            .filter_map(|(ch, f)| matches!(f, Frame::Chunk { .. }).then_some(ch))
            .collect();
        assert_eq!(channels, vec![0, 1, 2, 3, 0, 1]);

        b.send(
            CONTROL_CHANNEL,
            Frame::Success {
                transfer_id: "sess-2".to_string(),
            }
            .encode()
            .unwrap(),
        )
        .unwrap();
        driver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_zero_byte_transfer_sends_no_chunks() {
        let ((a, a_rx), (b, mut b_rx)) = memory_pair(4);
        let (event_tx, _event_rx) = mpsc::unbounded_channel();

        let (sender, _handle) =
            FileSender::new(&a, "sess-3", "empty.bin", None, Bytes::new(), event_tx);
        assert_eq!(sender.metadata().total_chunks, 0);

        let driver = tokio::spawn(sender.run(a_rx));
        tokio::task::yield_now().await;
        b.send(
            CONTROL_CHANNEL,
            Frame::Ack {
                transfer_id: "sess-3".to_string(),
            }
            .encode()
            .unwrap(),
        )
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let frames = collect_frames(&mut b_rx);
        assert!(frames.iter().all(|(_, f)| !matches!(f, Frame::Chunk { .. })));
        assert!(frames.iter().any(|(_, f)| matches!(f, Frame::Complete { .. })));

        b.send(
            CONTROL_CHANNEL,
            Frame::Success {
                transfer_id: "sess-3".to_string(),
            }
            .encode()
            .unwrap(),
        )
        .unwrap();
        driver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_backpressure_pauses_until_drain() {
        let ((a, a_rx), (b, mut b_rx)) = memory_pair(2);
        let (event_tx, _event_rx) = mpsc::unbounded_channel();

        let payload = Bytes::from(vec![9u8; 4 * 8]);
        let (sender, _handle) =
            FileSender::with_chunk_size(&a, "sess-4", "slow.bin", None, payload, event_tx, 8);

        // Pretend the browser buffers are saturated before the pump starts.
        a.set_buffered(0, HIGH_WATERMARK + 1);

        let driver = tokio::spawn(sender.run(a_rx));
        tokio::task::yield_now().await;
        b.send(
            CONTROL_CHANNEL,
            Frame::Ack {
                transfer_id: "sess-4".to_string(),
            }
            .encode()
            .unwrap(),
        )
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Nothing but the metadata escaped: the pump is parked.
        let frames = collect_frames(&mut b_rx);
        assert!(frames.iter().all(|(_, f)| !matches!(f, Frame::Chunk { .. })));

        // Drain below the low watermark; the pump resumes.
        a.drain(0);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let chunk_count = collect_frames(&mut b_rx)
            .iter()
            .filter(|(_, f)| matches!(f, Frame::Chunk { .. }))
            .count();
        assert_eq!(chunk_count, 4);

        b.send(
            CONTROL_CHANNEL,
            Frame::Success {
                transfer_id: "sess-4".to_string(),
            }
            .encode()
            .unwrap(),
        )
        .unwrap();
        driver.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_local_cancel_sends_cancel_frame() {
        let ((a, a_rx), (_b, mut b_rx)) = memory_pair(4);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let payload = Bytes::from(vec![1u8; 64]);
        let (sender, handle) =
            FileSender::with_chunk_size(&a, "sess-5", "c.bin", None, payload, event_tx, 8);

        let driver = tokio::spawn(sender.run(a_rx));
        tokio::task::yield_now().await;

        // Cancel while the sender is still waiting for the ACK.
        handle.cancel();
        let result = driver.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));

        let frames = collect_frames(&mut b_rx);
        assert!(frames
            .iter()
            .any(|(ch, f)| *ch == CONTROL_CHANNEL && matches!(f, Frame::Cancel { .. })));

        let mut saw_cancelled = false;
        while let Ok(ev) = event_rx.try_recv() {
            if matches!(ev, TransferEvent::Cancelled { .. }) {
                saw_cancelled = true;
            }
        }
        assert!(saw_cancelled);
    }

    #[tokio::test]
    async fn test_remote_failure_surfaces_reason() {
        let ((a, a_rx), (b, _b_rx)) = memory_pair(4);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let payload = Bytes::from(vec![1u8; 16]);
        let (sender, _handle) =
            FileSender::with_chunk_size(&a, "sess-6", "f.bin", None, payload, event_tx, 8);

        let driver = tokio::spawn(sender.run(a_rx));
        tokio::task::yield_now().await;

        b.send(
            CONTROL_CHANNEL,
            Frame::Failed {
                reason: "Checksum mismatch".to_string(),
            }
            .encode()
            .unwrap(),
        )
        .unwrap();

        let result = driver.await.unwrap();
        match result {
            Err(Error::TransferFailed(reason)) => assert_eq!(reason, "Checksum mismatch"),
            other => panic!("Expected failure, got {:?}", other),
        }

        let mut saw_failed = false;
        while let Ok(ev) = event_rx.try_recv() {
            if let TransferEvent::Failed { reason, .. } = ev {
                assert_eq!(reason, "Checksum mismatch");
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn test_progress_is_monotone_and_bounded() {
        let ((a, a_rx), (b, _b_rx)) = memory_pair(4);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();

        let payload = Bytes::from(vec![3u8; 100]);
        let (sender, _handle) =
            FileSender::with_chunk_size(&a, "sess-7", "p.bin", None, payload, event_tx, 8);

        let driver = tokio::spawn(sender.run(a_rx));
        tokio::task::yield_now().await;
        b.send(
            CONTROL_CHANNEL,
            Frame::Ack {
                transfer_id: "sess-7".to_string(),
            }
            .encode()
            .unwrap(),
        )
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        b.send(
            CONTROL_CHANNEL,
            Frame::Success {
                transfer_id: "sess-7".to_string(),
            }
            .encode()
            .unwrap(),
        )
        .unwrap();
        driver.await.unwrap().unwrap();

        let mut last = 0u64;
        let mut reports = 0;
        while let Ok(ev) = event_rx.try_recv() {
            if let TransferEvent::Progress {
                bytes_transferred,
                total_bytes,
                ..
            } = ev
            {
                assert!(bytes_transferred >= last);
                assert!(bytes_transferred <= total_bytes);
                last = bytes_transferred;
                reports += 1;
            }
        }
        assert!(reports > 0);
        assert_eq!(last, 100);
    }

    #[tokio::test]
    async fn test_transport_dropped_mid_transfer() {
        let ((a, a_rx), (b, _b_rx)) = memory_pair(4);
        let (event_tx, _event_rx) = mpsc::unbounded_channel();

        let payload = Bytes::from(vec![1u8; 16]);
        let (sender, _handle) =
            FileSender::with_chunk_size(&a, "sess-8", "d.bin", None, payload, event_tx, 8);

        let driver = tokio::spawn(sender.run(a_rx));
        tokio::task::yield_now().await;

        // Drop the only strong reference to the transport.
        drop(a);
        b.send(
            CONTROL_CHANNEL,
            Frame::Ack {
                transfer_id: "sess-8".to_string(),
            }
            .encode()
            .unwrap(),
        )
        .unwrap();

        let result = driver.await.unwrap();
        assert!(matches!(result, Err(Error::TransportClosed)));
    }
}
