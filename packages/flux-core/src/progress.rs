//! # Progress Accounting
//!
//! Monotone progress reports and the event stream surfaced to the embedding
//! application. Both endpoints emit `TransferEvent`s: the sender as chunk
//! batches are dispatched, the receiver as chunks arrive.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Events emitted by a transfer endpoint for the application layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TransferEvent {
    /// Periodic progress update. `bytes_transferred` never decreases and
    /// never exceeds `total_bytes`.
    Progress {
        transfer_id: String,
        bytes_transferred: u64,
        total_bytes: u64,
        speed_bps: u64,
    },

    /// Transfer finished and, on the receiving side, was persisted.
    Completed {
        transfer_id: String,
        file_name: String,
        total_bytes: u64,
        /// Scratch path of the reassembled payload (receiver only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    /// Transfer failed with a human-readable reason.
    Failed { transfer_id: String, reason: String },

    /// Transfer was cancelled by either side.
    Cancelled { transfer_id: String },
}

/// Tracks transferred bytes against a known total, clamping reports so the
/// sequence stays monotone and bounded.
#[derive(Debug)]
pub struct ProgressMeter {
    started: Instant,
    total: u64,
    reported: u64,
}

impl ProgressMeter {
    pub fn new(total: u64) -> Self {
        Self {
            started: Instant::now(),
            total,
            reported: 0,
        }
    }

    /// Record the current byte count and return `(bytes, speed_bps)` for
    /// the next progress report.
    pub fn record(&mut self, bytes: u64) -> (u64, u64) {
        self.reported = self.reported.max(bytes.min(self.total));
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            (self.reported as f64 / elapsed) as u64
        } else {
            0
        };
        (self.reported, speed)
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_is_monotone() {
        let mut meter = ProgressMeter::new(100);
        let (a, _) = meter.record(40);
        let (b, _) = meter.record(30); // stale, must not regress
        let (c, _) = meter.record(90);

        assert_eq!(a, 40);
        assert_eq!(b, 40);
        assert_eq!(c, 90);
    }

    #[test]
    fn test_meter_clamps_to_total() {
        let mut meter = ProgressMeter::new(100);
        let (bytes, _) = meter.record(250);
        assert_eq!(bytes, 100);
    }

    #[test]
    fn test_event_serialization() {
        let event = TransferEvent::Progress {
            transfer_id: "sess-1".to_string(),
            bytes_transferred: 65536,
            total_bytes: 131072,
            speed_bps: 1024,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"progress\""));
        assert!(json.contains("\"bytesTransferred\":65536"));

        let parsed: TransferEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            TransferEvent::Progress { total_bytes, .. } => assert_eq!(total_bytes, 131072),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_completed_path_optional() {
        let event = TransferEvent::Completed {
            transfer_id: "sess-1".to_string(),
            file_name: "r.bin".to_string(),
            total_bytes: 10,
            path: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("path"));
    }
}
