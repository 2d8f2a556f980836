//! # Transport Adapter
//!
//! Abstraction over the ordered reliable datagram transport the transfer
//! protocol runs on. The adapter owns N parallel binary channels, reports
//! per-channel buffered bytes for backpressure, and delivers inbound frames
//! tagged with their channel index.
//!
//! The concrete adapter wraps whatever datachannel library the host
//! application uses; it is the only code that knows about that library.
//! Everything in this crate talks to the `ChannelTransport` trait and a
//! `TransportEvent` stream. `MemoryTransport` provides an in-process
//! loopback pair for tests.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Connection-level state reported by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed(String),
}

/// Events delivered by the transport adapter to the transfer endpoint.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A data channel finished negotiating and is ready for frames.
    ChannelOpened(usize),
    /// A data channel closed.
    ChannelClosed(usize),
    /// An inbound frame with the channel it arrived on.
    Inbound { channel: usize, data: Bytes },
    /// The channel's send buffer drained below its threshold.
    BufferDrained { channel: usize, buffered: u64 },
    /// The underlying peer connection changed state.
    StateChanged(ConnectionState),
}

/// Capability set the transfer protocol requires from a transport.
///
/// Transfers hold this behind a `Weak` handle: the transport outlives the
/// transfer and must never be kept alive by it.
pub trait ChannelTransport: Send + Sync {
    /// Number of parallel channels that were opened.
    fn channel_count(&self) -> usize;

    /// Enqueue a binary frame on the given channel.
    fn send(&self, channel: usize, data: Bytes) -> Result<()>;

    /// Bytes currently buffered on one channel.
    fn buffered_amount(&self, channel: usize) -> u64;

    /// Aggregate buffered bytes across all channels.
    fn total_buffered(&self) -> u64 {
        (0..self.channel_count())
            .map(|i| self.buffered_amount(i))
            .sum()
    }
}

// ----------------------------------------------------------------------------
// In-memory loopback transport
// ----------------------------------------------------------------------------

/// In-process loopback transport: frames sent on one endpoint surface as
/// `Inbound` events on the peer endpoint's stream.
///
/// Delivery is immediate and ordered per channel, so the buffered-bytes
/// counters never grow on their own; tests drive them through
/// [`MemoryTransport::set_buffered`] and [`MemoryTransport::drain`] to
/// exercise the sender's watermark logic.
pub struct MemoryTransport {
    channels: usize,
    /// Delivers frames to the peer endpoint's event stream.
    peer_tx: mpsc::UnboundedSender<TransportEvent>,
    /// Delivers drain notifications to this endpoint's own stream.
    local_tx: mpsc::UnboundedSender<TransportEvent>,
    buffered: Mutex<Vec<u64>>,
}

impl MemoryTransport {
    /// Simulate the channel's send buffer filling up.
    pub fn set_buffered(&self, channel: usize, amount: u64) {
        self.buffered.lock()[channel] = amount;
    }

    /// Simulate the browser draining a channel's send buffer, emitting the
    /// `BufferDrained` event the sender's backpressure loop waits on.
    pub fn drain(&self, channel: usize) {
        self.buffered.lock()[channel] = 0;
        let _ = self.local_tx.send(TransportEvent::BufferDrained {
            channel,
            buffered: 0,
        });
    }
}

impl ChannelTransport for MemoryTransport {
    fn channel_count(&self) -> usize {
        self.channels
    }

    fn send(&self, channel: usize, data: Bytes) -> Result<()> {
        if channel >= self.channels {
            return Err(Error::TransportSend {
                channel,
                reason: format!("only {} channels open", self.channels),
            });
        }
        self.peer_tx
            .send(TransportEvent::Inbound { channel, data })
            .map_err(|_| Error::TransportClosed)
    }

    fn buffered_amount(&self, channel: usize) -> u64 {
        self.buffered.lock().get(channel).copied().unwrap_or(0)
    }
}

/// One side of a loopback pair: the transport handle plus the event stream
/// a transfer endpoint consumes.
pub type MemoryEndpoint = (Arc<MemoryTransport>, mpsc::UnboundedReceiver<TransportEvent>);

/// Create a connected loopback pair with `channels` channels per side.
///
/// Both event streams are pre-seeded with `ChannelOpened` for every channel
/// and a `Connected` state change, matching what a real adapter emits once
/// in-band negotiation finishes.
pub fn memory_pair(channels: usize) -> (MemoryEndpoint, MemoryEndpoint) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    for tx in [&a_tx, &b_tx] {
        for i in 0..channels {
            let _ = tx.send(TransportEvent::ChannelOpened(i));
        }
        let _ = tx.send(TransportEvent::StateChanged(ConnectionState::Connected));
    }

    let a = Arc::new(MemoryTransport {
        channels,
        peer_tx: b_tx,
        local_tx: a_tx,
        buffered: Mutex::new(vec![0; channels]),
    });
    let b = Arc::new(MemoryTransport {
        channels,
        peer_tx: a.local_tx.clone(),
        local_tx: a.peer_tx.clone(),
        buffered: Mutex::new(vec![0; channels]),
    });

    ((a, a_rx), (b, b_rx))
}
