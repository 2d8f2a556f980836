//! # Transfer Receiver
//!
//! Driver for the receiving side of a transfer:
//!
//! ```text
//! idle → (on FILE_METADATA) → receiving → (on FILE_COMPLETE) → verifying → done
//! ```
//!
//! Chunks may arrive out of order across channels and are collected by
//! index, first occurrence winning. On `FILE_COMPLETE` the receiver checks
//! that every index `0 … N-1` is present, reassembles in index order,
//! verifies the whole-payload SHA-256 case-insensitively, persists the
//! result to a scratch path, and replies `TRANSFER_SUCCESS`. Any gap or
//! digest mismatch is fatal to the transfer, reported via
//! `TRANSFER_FAILED`, and leaves the signaling connection untouched.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch};

use crate::chunking::{checksum_hex, checksums_match, ChunkStore};
use crate::error::{Error, Result};
use crate::frame::{Frame, CONTROL_CHANNEL};
use crate::progress::{ProgressMeter, TransferEvent};
use crate::sender::CancelHandle;
use crate::transport::{ChannelTransport, ConnectionState, TransportEvent};

/// A completed, verified, persisted transfer.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub transfer_id: String,
    pub file_name: String,
    pub size: u64,
    pub checksum: String,
    /// Scratch path holding the reassembled payload.
    pub path: PathBuf,
}

/// The receiving side of one file transfer.
pub struct FileReceiver {
    transport: Weak<dyn ChannelTransport>,
    scratch_dir: PathBuf,
    events: mpsc::UnboundedSender<TransferEvent>,
    cancel_rx: watch::Receiver<bool>,
}

impl FileReceiver {
    /// Prepare a receiver that persists completed payloads under
    /// `scratch_dir`. The transport is held weakly, as on the sending side.
    pub fn new<T: ChannelTransport + 'static>(
        transport: &Arc<T>,
        scratch_dir: impl Into<PathBuf>,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> (Self, CancelHandle) {
        let (handle, cancel_rx) = CancelHandle::new();
        let receiver = Self {
            transport: Arc::downgrade(transport) as Weak<dyn ChannelTransport>,
            scratch_dir: scratch_dir.into(),
            events,
            cancel_rx,
        };
        (receiver, handle)
    }

    /// Run the transfer to a terminal state, returning the persisted file.
    pub async fn run(
        self,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<ReceivedFile> {
        let FileReceiver {
            transport,
            scratch_dir,
            events,
            cancel_rx,
        } = self;

        let mut cancel = cancel_rx;
        let mut cancel_alive = true;

        let send_control = |frame: Frame| -> Result<()> {
            let t = transport.upgrade().ok_or(Error::TransportClosed)?;
            t.send(CONTROL_CHANNEL, frame.encode()?)
        };

        let emit = |event: TransferEvent| {
            let _ = events.send(event);
        };

        // ── Await metadata ────────────────────────────────────────────────
        let meta = loop {
            tokio::select! {
                res = cancel.changed(), if cancel_alive => match res {
                    Ok(()) if *cancel.borrow() => {
                        return cancelled_before_metadata(&transport, &emit);
                    }
                    Ok(()) => {}
                    Err(_) => cancel_alive = false,
                },
                ev = transport_events.recv() => {
                    match inbound_frame(ev.ok_or(Error::EventStreamEnded)?)? {
                        Some(Frame::Metadata(meta)) => break meta,
                        Some(Frame::Cancel { transfer_id }) => {
                            tracing::info!(transfer_id = %transfer_id, "Cancelled before metadata");
                            return Err(Error::Cancelled);
                        }
                        Some(other) => {
                            tracing::debug!(frame = other.kind(), "Ignoring frame before metadata");
                        }
                        None => {}
                    }
                }
            }
        };

        let transfer_id = meta.transfer_id.clone();
        tracing::debug!(
            transfer_id = %transfer_id,
            file = %meta.file_name,
            size = meta.file_size,
            chunks = meta.total_chunks,
            "Receiving transfer"
        );

        send_control(Frame::Ack {
            transfer_id: transfer_id.clone(),
        })?;

        // ── Collect chunks ────────────────────────────────────────────────
        let mut store = ChunkStore::new(meta.total_chunks);
        let mut meter = ProgressMeter::new(meta.file_size);

        let declared = loop {
            tokio::select! {
                res = cancel.changed(), if cancel_alive => match res {
                    Ok(()) if *cancel.borrow() => {
                        let _ = send_control(Frame::Cancel {
                            transfer_id: transfer_id.clone(),
                        });
                        emit(TransferEvent::Cancelled {
                            transfer_id: transfer_id.clone(),
                        });
                        return Err(Error::Cancelled);
                    }
                    Ok(()) => {}
                    Err(_) => cancel_alive = false,
                },
                ev = transport_events.recv() => {
                    match inbound_frame(ev.ok_or(Error::EventStreamEnded)?)? {
                        Some(Frame::Chunk { index, data }) => {
                            if store.insert(index, data) > 0 {
                                let (bytes, speed) = meter.record(store.received_bytes());
                                emit(TransferEvent::Progress {
                                    transfer_id: transfer_id.clone(),
                                    bytes_transferred: bytes,
                                    total_bytes: meta.file_size,
                                    speed_bps: speed,
                                });
                            }
                        }
                        Some(Frame::Complete { checksum }) => break checksum,
                        Some(Frame::Cancel { .. }) => {
                            tracing::info!(transfer_id = %transfer_id, "Cancelled by peer");
                            emit(TransferEvent::Cancelled {
                                transfer_id: transfer_id.clone(),
                            });
                            return Err(Error::Cancelled);
                        }
                        Some(Frame::Failed { reason }) => {
                            emit(TransferEvent::Failed {
                                transfer_id: transfer_id.clone(),
                                reason: reason.clone(),
                            });
                            return Err(Error::TransferFailed(reason));
                        }
                        Some(other) => {
                            tracing::debug!(frame = other.kind(), "Ignoring frame while receiving");
                        }
                        None => {}
                    }
                }
            }
        };

        // ── Verify ────────────────────────────────────────────────────────
        if let Some(missing) = store.first_missing() {
            let reason = format!("Missing chunk {}", missing);
            tracing::warn!(transfer_id = %transfer_id, %reason, "Coverage check failed");
            let _ = send_control(Frame::Failed {
                reason: reason.clone(),
            });
            emit(TransferEvent::Failed {
                transfer_id: transfer_id.clone(),
                reason,
            });
            return Err(Error::MissingChunk(missing));
        }

        let payload = store.reassemble()?;
        let actual = checksum_hex(&payload);
        if !checksums_match(&actual, &declared) {
            let reason = "Checksum mismatch".to_string();
            tracing::warn!(
                transfer_id = %transfer_id,
                expected = %declared,
                actual = %actual,
                "Digest verification failed"
            );
            let _ = send_control(Frame::Failed {
                reason: reason.clone(),
            });
            emit(TransferEvent::Failed {
                transfer_id: transfer_id.clone(),
                reason,
            });
            return Err(Error::ChecksumMismatch);
        }

        // ── Persist and acknowledge ───────────────────────────────────────
        let path = scratch_path(&scratch_dir, &transfer_id, &meta.file_name);
        tokio::fs::create_dir_all(&scratch_dir).await?;
        tokio::fs::write(&path, &payload).await?;

        send_control(Frame::Success {
            transfer_id: transfer_id.clone(),
        })?;
        tracing::info!(
            transfer_id = %transfer_id,
            size = payload.len(),
            path = %path.display(),
            "Transfer verified and persisted"
        );
        emit(TransferEvent::Completed {
            transfer_id: transfer_id.clone(),
            file_name: meta.file_name.clone(),
            total_bytes: meta.file_size,
            path: Some(path.display().to_string()),
        });

        Ok(ReceivedFile {
            transfer_id,
            file_name: meta.file_name,
            size: payload.len() as u64,
            checksum: actual,
            path,
        })
    }
}

fn cancelled_before_metadata(
    transport: &Weak<dyn ChannelTransport>,
    emit: &impl Fn(TransferEvent),
) -> Result<ReceivedFile> {
    if let Some(t) = transport.upgrade() {
        if let Ok(raw) = (Frame::Cancel {
            transfer_id: String::new(),
        })
        .encode()
        {
            let _ = t.send(CONTROL_CHANNEL, raw);
        }
    }
    emit(TransferEvent::Cancelled {
        transfer_id: String::new(),
    });
    Err(Error::Cancelled)
}

/// Extract a decoded frame from a transport event, failing on transport
/// death. Control frames are only honored from channel 0; chunk frames are
/// accepted from every channel.
fn inbound_frame(event: TransportEvent) -> Result<Option<Frame>> {
    match event {
        TransportEvent::Inbound { channel, data } => match Frame::decode(&data) {
            Ok(frame) => {
                if frame.is_control() && channel != CONTROL_CHANNEL {
                    tracing::warn!(
                        frame = frame.kind(),
                        channel,
                        "Control frame off channel 0, dropping"
                    );
                    return Ok(None);
                }
                Ok(Some(frame))
            }
            Err(e) => {
                tracing::warn!(channel, error = %e, "Dropping undecodable frame");
                Ok(None)
            }
        },
        TransportEvent::ChannelClosed(CONTROL_CHANNEL) => Err(Error::TransportClosed),
        TransportEvent::StateChanged(ConnectionState::Disconnected) => Err(Error::TransportClosed),
        TransportEvent::StateChanged(ConnectionState::Failed(reason)) => {
            Err(Error::TransferFailed(reason))
        }
        _ => Ok(None),
    }
}

/// Scratch filename: transfer id plus the sanitized original name, so
/// nothing in the metadata can escape the scratch directory.
fn scratch_path(dir: &Path, transfer_id: &str, file_name: &str) -> PathBuf {
    let safe_name = Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("payload.bin");
    dir.join(format!("{}-{}", transfer_id, safe_name))
}
