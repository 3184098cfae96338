//! Error recovery controller
//!
//! Turns gap, stale-keyframe and decoder-fault triggers into keyframe
//! requests, and escalates to a stream restart when a request goes
//! unanswered. Time is passed in by the caller so the controller stays a pure
//! state machine.

use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Recovery tuning
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Minimum spacing between keyframe requests for the same trigger
    pub backoff_window: Duration,
    /// How long a keyframe request may stay unanswered before restarting
    pub request_deadline: Duration,
    /// Restarts attempted before the session fails
    pub max_restarts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            backoff_window: Duration::from_secs(1),
            request_deadline: Duration::from_secs(2),
            max_restarts: 3,
        }
    }
}

/// What prompted recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryTrigger {
    /// Sequence gap, or a critical frame lost to queue overflow
    Gap,
    /// Keyframe interval exceeded
    StaleKeyframe,
    /// Decoder hit its consecutive error threshold
    DecoderFaulted,
}

impl RecoveryTrigger {
    fn index(self) -> usize {
        match self {
            RecoveryTrigger::Gap => 0,
            RecoveryTrigger::StaleKeyframe => 1,
            RecoveryTrigger::DecoderFaulted => 2,
        }
    }

    /// Short name for logs and events
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryTrigger::Gap => "gap",
            RecoveryTrigger::StaleKeyframe => "stale_keyframe",
            RecoveryTrigger::DecoderFaulted => "decoder_faulted",
        }
    }
}

/// Action the session must carry out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Send an empty settings packet to force a keyframe
    RequestKeyframe {
        /// Trigger behind the request
        trigger: RecoveryTrigger,
    },
    /// Stop and start the stream with unchanged settings
    Restart {
        /// 1-based attempt number
        attempt: u32,
    },
    /// Give up; the session enters its error state
    Fatal {
        /// Restarts that were attempted
        attempts: u32,
    },
}

/// Running counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Keyframe requests issued
    pub keyframe_requests: u64,
    /// Triggers suppressed by the backoff window
    pub suppressed: u64,
    /// Restarts issued
    pub restarts: u64,
}

/// Per-session recovery state machine
#[derive(Debug)]
pub struct RecoveryController {
    config: RecoveryConfig,
    last_request: [Option<Instant>; 3],
    deadline: Option<Instant>,
    restart_attempts: u32,
    exhausted: bool,
    stats: RecoveryStats,
}

impl RecoveryController {
    /// Create an idle controller
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            last_request: [None; 3],
            deadline: None,
            restart_attempts: 0,
            exhausted: false,
            stats: RecoveryStats::default(),
        }
    }

    /// Forget all recovery state; used when the user starts a new stream
    pub fn reset(&mut self) {
        self.last_request = [None; 3];
        self.deadline = None;
        self.restart_attempts = 0;
        self.exhausted = false;
    }

    /// React to a trigger
    pub fn on_trigger(&mut self, trigger: RecoveryTrigger, now: Instant) -> Option<RecoveryAction> {
        if self.exhausted {
            return None;
        }
        let slot = &mut self.last_request[trigger.index()];
        if let Some(previous) = *slot {
            if now.saturating_duration_since(previous) < self.config.backoff_window {
                self.stats.suppressed += 1;
                debug!("Keyframe request for {} suppressed by backoff", trigger.as_str());
                return None;
            }
        }
        *slot = Some(now);
        if self.deadline.is_none() {
            self.deadline = Some(now + self.config.request_deadline);
        }
        self.stats.keyframe_requests += 1;
        warn!("Requesting keyframe after {}", trigger.as_str());
        Some(RecoveryAction::RequestKeyframe { trigger })
    }

    /// Configuration data or a keyframe was accepted
    pub fn on_recovery_frame(&mut self) {
        if self.deadline.take().is_some() {
            debug!("Outstanding keyframe request satisfied");
        }
        if self.restart_attempts > 0 {
            debug!("Stream recovered after {} restart(s)", self.restart_attempts);
            self.restart_attempts = 0;
        }
    }

    /// Check the outstanding deadline
    pub fn poll(&mut self, now: Instant) -> Option<RecoveryAction> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        if self.restart_attempts < self.config.max_restarts {
            self.restart_attempts += 1;
            self.stats.restarts += 1;
            self.deadline = Some(now + self.config.request_deadline);
            warn!(
                "Keyframe request unanswered, restart attempt {}/{}",
                self.restart_attempts, self.config.max_restarts
            );
            Some(RecoveryAction::Restart {
                attempt: self.restart_attempts,
            })
        } else {
            self.deadline = None;
            self.exhausted = true;
            error!(
                "Recovery exhausted after {} restart attempt(s)",
                self.restart_attempts
            );
            Some(RecoveryAction::Fatal {
                attempts: self.restart_attempts,
            })
        }
    }

    /// Whether a keyframe request is waiting for an answer
    pub fn has_outstanding_request(&self) -> bool {
        self.deadline.is_some()
    }

    /// Restart attempts since the last recovery
    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts
    }

    /// Counters
    pub fn stats(&self) -> &RecoveryStats {
        &self.stats
    }
}
