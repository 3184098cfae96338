//! Configuration types and defaults

use camlink_core::{CamLinkError, RecoveryConfig, ResolutionPolicy, SequencerConfig};
use camlink_media::{DecodeConfig, WriterConfig};
use std::time::Duration;

/// Session actor tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for a `streaming` status after sending `start`
    pub start_timeout: Duration,
    /// How long to wait for a `stopped` status after sending `stop`
    pub stop_timeout: Duration,
    /// Interval at which deadlines and keyframe freshness are checked
    pub tick_interval: Duration,
    /// Pending commands per session
    pub command_capacity: usize,
    /// Buffered events per subscriber
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(3),
            tick_interval: Duration::from_millis(100),
            command_capacity: 64,
            event_capacity: 100,
        }
    }
}

/// Everything needed to run the bridge
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    /// How requested resolutions are matched to a camera's list
    pub resolution_policy: ResolutionPolicy,
    /// Frame sequencer settings
    pub sequencer: SequencerConfig,
    /// Keyframe request and restart policy
    pub recovery: RecoveryConfig,
    /// Decoder settings
    pub decode: DecodeConfig,
    /// Virtual device settings
    pub writer: WriterConfig,
    /// Session actor settings
    pub session: SessionConfig,
}

impl BridgeConfig {
    /// Smaller queues and tighter deadlines, for interactive use
    pub fn low_latency() -> Self {
        let mut config = Self::default();
        config.decode.queue_capacity = 2;
        config.writer.queue_capacity = 1;
        config.writer.write_timeout = Duration::from_millis(100);
        config.sequencer.max_keyframe_interval = Duration::from_millis(1500);
        config.recovery.backoff_window = Duration::from_millis(500);
        config.recovery.request_deadline = Duration::from_millis(1500);
        config
    }

    /// Use a different v4l2loopback device node
    pub fn with_device(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.writer.device_path = Some(path.into());
        self
    }

    /// Reject settings the bridge cannot run with
    pub fn validate(&self) -> Result<(), CamLinkError> {
        let checks: [(bool, &str); 9] = [
            (
                self.sequencer.max_keyframe_interval.is_zero(),
                "sequencer.max_keyframe_interval must be non-zero",
            ),
            (
                self.recovery.request_deadline.is_zero(),
                "recovery.request_deadline must be non-zero",
            ),
            (
                self.decode.error_threshold == 0,
                "decode.error_threshold must be at least 1",
            ),
            (
                self.decode.queue_capacity == 0,
                "decode.queue_capacity must be at least 1",
            ),
            (
                self.writer.queue_capacity == 0,
                "writer.queue_capacity must be at least 1",
            ),
            (
                self.writer.write_timeout.is_zero(),
                "writer.write_timeout must be non-zero",
            ),
            (
                self.session.tick_interval.is_zero(),
                "session.tick_interval must be non-zero",
            ),
            (
                self.session.command_capacity == 0,
                "session.command_capacity must be at least 1",
            ),
            (
                self.session.event_capacity == 0,
                "session.event_capacity must be at least 1",
            ),
        ];

        match checks.iter().find(|(invalid, _)| *invalid) {
            Some((_, reason)) => Err(CamLinkError::InvalidState {
                expected: "valid bridge configuration".to_string(),
                actual: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}
