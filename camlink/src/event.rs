//! Session events broadcast to subscribers

use crate::session::{SessionFailure, SessionState};
use camlink_core::{NegotiatedSettings, RecoveryTrigger};

/// Something that happened to one device's session
#[derive(Debug, Clone)]
pub struct SessionEvent {
    /// Device the session belongs to
    pub device_id: String,
    /// What happened
    pub kind: SessionEventKind,
}

/// Kinds of session events
#[derive(Debug, Clone)]
pub enum SessionEventKind {
    /// The session moved to a new state
    StateChanged {
        /// Previous state
        from: SessionState,
        /// New state
        to: SessionState,
    },
    /// The phone announced (or re-announced) its cameras
    CapabilitiesUpdated {
        /// Number of cameras announced
        cameras: usize,
    },
    /// A start request was accepted and sent
    StreamRequested {
        /// Settings sent to the phone
        settings: NegotiatedSettings,
    },
    /// Settings were changed mid-stream
    SettingsChanged {
        /// Settings now in effect
        settings: NegotiatedSettings,
    },
    /// A keyframe was requested from the phone
    KeyframeRequested {
        /// Recovery trigger, or `None` for an explicit request
        trigger: Option<RecoveryTrigger>,
    },
    /// The stream was restarted to recover
    StreamRestarted {
        /// 1-based restart attempt
        attempt: u32,
    },
    /// The session entered its error state
    Failed {
        /// Why
        failure: SessionFailure,
    },
    /// The phone disconnected; the session is gone
    Disconnected,
}

impl SessionEventKind {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEventKind::StateChanged { .. } => "state_changed",
            SessionEventKind::CapabilitiesUpdated { .. } => "capabilities_updated",
            SessionEventKind::StreamRequested { .. } => "stream_requested",
            SessionEventKind::SettingsChanged { .. } => "settings_changed",
            SessionEventKind::KeyframeRequested { .. } => "keyframe_requested",
            SessionEventKind::StreamRestarted { .. } => "stream_restarted",
            SessionEventKind::Failed { .. } => "failed",
            SessionEventKind::Disconnected => "disconnected",
        }
    }

    /// Check if this is a recovery-related event
    pub fn is_recovery_event(&self) -> bool {
        matches!(
            self,
            SessionEventKind::KeyframeRequested { trigger: Some(_) }
                | SessionEventKind::StreamRestarted { .. }
        )
    }

    /// Check if this is an error event
    pub fn is_error_event(&self) -> bool {
        matches!(self, SessionEventKind::Failed { .. })
    }
}
