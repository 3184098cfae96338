//! Per-stream statistics

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Counters for one streaming session
///
/// Counters accumulate across restarts within a session; `started_at` marks
/// the most recent start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamStats {
    /// Frame packets received from the phone
    pub frames_received: u64,
    /// Frames released by the sequencer
    pub frames_forwarded: u64,
    /// Pictures produced by the decoder
    pub frames_decoded: u64,
    /// Frames written to the virtual device
    pub frames_written: u64,
    /// Payload bytes received
    pub bytes_received: u64,
    /// Frames discarded as duplicates or out of order
    pub duplicates: u64,
    /// Sequence gaps detected
    pub gaps: u64,
    /// Delta frames discarded while waiting for a keyframe
    pub discarded_deltas: u64,
    /// Frames the decoder rejected
    pub decode_errors: u64,
    /// Frames the device rejected
    pub write_errors: u64,
    /// Frames lost to backpressure
    pub frames_dropped: u64,
    /// Keyframe requests sent
    pub keyframe_requests: u64,
    /// Stream restarts issued by recovery
    pub restarts: u64,
    /// When streaming last started
    #[serde(skip)]
    pub started_at: Option<Instant>,
}

impl StreamStats {
    /// Time since the stream started, zero if it never did
    pub fn elapsed(&self) -> Duration {
        self.started_at
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    /// Average frames written per second
    pub fn fps(&self) -> f64 {
        per_second(self.frames_written as f64, self.elapsed())
    }

    /// Average received bitrate in kbit/s
    pub fn bitrate_kbps(&self) -> f64 {
        per_second(self.bytes_received as f64 * 8.0 / 1000.0, self.elapsed())
    }

    /// Fraction of received frames that never reached the device
    pub fn drop_rate(&self) -> f64 {
        if self.frames_received == 0 {
            return 0.0;
        }
        let lost = self.frames_received.saturating_sub(self.frames_written);
        lost as f64 / self.frames_received as f64
    }
}

fn per_second(value: f64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        value / secs
    } else {
        0.0
    }
}
