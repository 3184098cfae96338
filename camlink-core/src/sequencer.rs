//! Frame sequencing and decodability enforcement
//!
//! The sequencer decides, for every incoming frame, whether it may reach the
//! decoder. It never buffers or reorders: a frame is either forwarded at once or
//! discarded. Gaps, protocol violations and stale keyframes are surfaced as
//! [`SequencerEvent`]s for the recovery controller.
//!
//! Decision rules, applied in order:
//!
//! 1. `sequence <= last` is a duplicate or reorder and is discarded.
//! 2. `sequence > last + 1` records a gap and arms resync.
//! 3. Configuration data is accepted and clears "awaiting configuration".
//! 4. A keyframe needs configuration; it clears resync.
//! 5. A delta frame needs configuration and no pending resync.
//! 6. `last` becomes `max(last, sequence)` for every frame that got past rule 1.

use crate::frame::Frame;
use crate::protocol::FrameType;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sequencer tuning
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Longest allowed interval between accepted keyframes while streaming
    pub max_keyframe_interval: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_keyframe_interval: Duration::from_secs(2),
        }
    }
}

/// Why a frame was not forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Sequence number at or below the last seen
    Duplicate,
    /// Keyframe before any configuration data
    MissingConfiguration,
    /// Delta frame while configuration or a resync keyframe is pending
    AwaitingResync,
}

/// Outcome for a single frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Hand the frame to the decoder
    Forward,
    /// Drop the frame
    Discard(DiscardReason),
}

/// Conditions the recovery controller must react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencerEvent {
    /// One or more sequence numbers were skipped
    Gap {
        /// Number of missing frames
        missing: u64,
        /// Sequence number that revealed the gap
        at_sequence: u64,
    },
    /// A keyframe arrived before configuration data
    ConfigurationViolation {
        /// Offending sequence number
        sequence: u64,
    },
    /// No keyframe accepted within the configured interval
    StaleKeyframe {
        /// Time since the last accepted keyframe (or epoch start)
        since: Duration,
    },
}

/// Result of processing one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerOutcome {
    /// Forward or discard
    pub disposition: Disposition,
    /// Events raised while processing this frame
    pub events: Vec<SequencerEvent>,
}

impl SequencerOutcome {
    /// Whether the frame should reach the decoder
    pub fn is_forwarded(&self) -> bool {
        self.disposition == Disposition::Forward
    }
}

/// Running counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequencerStats {
    /// Frames presented to the sequencer
    pub received: u64,
    /// Frames forwarded to the decoder
    pub forwarded: u64,
    /// Duplicate or reordered frames
    pub duplicates: u64,
    /// Gap events
    pub gaps: u64,
    /// Sum of missing frames over all gaps
    pub missing_frames: u64,
    /// Delta frames dropped while waiting for config or resync
    pub discarded_deltas: u64,
    /// Keyframes dropped because configuration was missing
    pub configuration_violations: u64,
}

/// Per-session frame sequencer
#[derive(Debug)]
pub struct FrameSequencer {
    config: SequencerConfig,
    last_sequence: Option<u64>,
    awaiting_config: bool,
    awaiting_resync: bool,
    epoch: u64,
    epoch_started_at: Option<Instant>,
    last_keyframe_at: Option<Instant>,
    configuration: Option<bytes::Bytes>,
    stats: SequencerStats,
}

impl FrameSequencer {
    /// Create a sequencer; call [`start_epoch`](Self::start_epoch) before use
    pub fn new(config: SequencerConfig) -> Self {
        Self {
            config,
            last_sequence: None,
            awaiting_config: true,
            awaiting_resync: true,
            epoch: 0,
            epoch_started_at: None,
            last_keyframe_at: None,
            configuration: None,
            stats: SequencerStats::default(),
        }
    }

    /// Begin a new stream epoch (start or restart)
    ///
    /// Sequence tracking restarts and both configuration and a keyframe are
    /// required again before delta frames pass.
    pub fn start_epoch(&mut self, now: Instant) {
        self.epoch += 1;
        self.last_sequence = None;
        self.awaiting_config = true;
        self.awaiting_resync = true;
        self.epoch_started_at = Some(now);
        self.last_keyframe_at = None;
        self.configuration = None;
        debug!("Sequencer epoch {} started", self.epoch);
    }

    /// Require a keyframe before further delta frames
    ///
    /// Returns `false` when resync was already armed; the epoch only advances on
    /// a fresh arming.
    pub fn arm_resync(&mut self) -> bool {
        if self.awaiting_resync {
            return false;
        }
        self.awaiting_resync = true;
        self.epoch += 1;
        debug!("Resync armed, epoch {}", self.epoch);
        true
    }

    /// Require fresh configuration data and a keyframe, e.g. after the last
    /// configuration was lost before reaching the decoder
    pub fn require_configuration(&mut self) {
        self.awaiting_config = true;
        self.configuration = None;
        self.arm_resync();
    }

    /// Apply the decision rules to one frame
    pub fn process(&mut self, frame: &Frame, now: Instant) -> SequencerOutcome {
        let seq = frame.sequence;
        let mut events = Vec::new();
        self.stats.received += 1;

        if let Some(last) = self.last_sequence {
            if seq <= last {
                self.stats.duplicates += 1;
                debug!("Discarding frame {} (last seen {})", seq, last);
                return SequencerOutcome {
                    disposition: Disposition::Discard(DiscardReason::Duplicate),
                    events,
                };
            }
            if seq > last + 1 {
                let missing = seq - last - 1;
                self.stats.gaps += 1;
                self.stats.missing_frames += missing;
                warn!(
                    "Sequence gap: {} frame(s) missing before {}",
                    missing, seq
                );
                self.arm_resync();
                events.push(SequencerEvent::Gap {
                    missing,
                    at_sequence: seq,
                });
            }
        }

        let disposition = match frame.frame_type {
            FrameType::ConfigData => {
                self.awaiting_config = false;
                self.configuration = Some(frame.payload.clone());
                Disposition::Forward
            }
            FrameType::KeyFrame if self.awaiting_config => {
                self.stats.configuration_violations += 1;
                warn!("Keyframe {} arrived before configuration data", seq);
                events.push(SequencerEvent::ConfigurationViolation { sequence: seq });
                Disposition::Discard(DiscardReason::MissingConfiguration)
            }
            FrameType::KeyFrame => {
                self.awaiting_resync = false;
                self.last_keyframe_at = Some(now);
                Disposition::Forward
            }
            FrameType::DeltaFrame if self.awaiting_config || self.awaiting_resync => {
                self.stats.discarded_deltas += 1;
                Disposition::Discard(DiscardReason::AwaitingResync)
            }
            FrameType::DeltaFrame => Disposition::Forward,
        };

        self.last_sequence = Some(self.last_sequence.map_or(seq, |last| last.max(seq)));
        if disposition == Disposition::Forward {
            self.stats.forwarded += 1;
        }

        SequencerOutcome {
            disposition,
            events,
        }
    }

    /// Check the keyframe interval; call periodically while streaming
    pub fn check_freshness(&self, now: Instant) -> Option<SequencerEvent> {
        let reference = self.last_keyframe_at.or(self.epoch_started_at)?;
        let since = now.saturating_duration_since(reference);
        (since > self.config.max_keyframe_interval).then_some(SequencerEvent::StaleKeyframe { since })
    }

    /// Current epoch
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Highest sequence number seen this epoch
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Whether configuration data is still required
    pub fn is_awaiting_config(&self) -> bool {
        self.awaiting_config
    }

    /// Whether a keyframe is required before delta frames
    pub fn is_awaiting_resync(&self) -> bool {
        self.awaiting_resync
    }

    /// Last accepted configuration payload
    pub fn configuration(&self) -> Option<&bytes::Bytes> {
        self.configuration.as_ref()
    }

    /// Counters
    pub fn stats(&self) -> &SequencerStats {
        &self.stats
    }
}
