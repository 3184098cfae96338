//! Per-device session state machine
//!
//! [`SessionCore`] owns the capability registry, frame sequencer and recovery
//! controller for one phone and decides every transition. It performs no I/O:
//! each input returns the [`SessionAction`]s the owning actor must carry out,
//! in order.
//!
//! ```text
//! Disconnected -> CapabilityKnown -> Starting -> Streaming -> Stopping -> Stopped
//!                                       |           |            |
//!                                       +---------> Error <------+
//! ```

use crate::config::BridgeConfig;
use crate::event::SessionEventKind;
use bytes::Bytes;
use camlink_core::{
    CamLinkError, CapabilityRegistry, CapabilitySet, CoreResult, Frame, FrameHeader, FrameSequencer,
    FrameType, NegotiatedSettings, Packet, PacketBody, RecoveryAction, RecoveryController,
    RecoveryTrigger, SequencerEvent, StatusReport, StopRequest, StreamRequest, StreamSettings,
    StreamingStatus,
};
use camlink_core::protocol::{
    PACKET_TYPE_CAMERA_CAPABILITY, PACKET_TYPE_CAMERA_FRAME, PACKET_TYPE_CAMERA_STATUS,
};
use camlink_diagnostics::StreamStats;
use camlink_media::{PipelineEventKind, PipelineStats, PushOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No capabilities known
    Disconnected,
    /// Capabilities announced, no stream requested
    CapabilityKnown,
    /// Start sent, waiting for the phone to report streaming
    Starting,
    /// Frames are flowing
    Streaming,
    /// Stop sent, waiting for the phone to confirm
    Stopping,
    /// Stream stopped
    Stopped,
    /// Stream failed; a new start or a disconnect leaves this state
    Error,
}

impl SessionState {
    /// State name for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::CapabilityKnown => "capability_known",
            SessionState::Starting => "starting",
            SessionState::Streaming => "streaming",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Error => "error",
        }
    }

    /// Whether a stream is requested or running
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Streaming)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session entered [`SessionState::Error`]
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionFailure {
    /// The phone reported a camera error
    #[error("Remote camera error: {0}")]
    RemoteCamera(String),

    /// Keyframe requests and restarts did not bring the stream back
    #[error("Recovery exhausted after {attempts} restart attempt(s)")]
    RecoveryExhausted {
        /// Restarts attempted
        attempts: u32,
    },

    /// The phone never reported streaming
    #[error("Stream did not start in time")]
    StartTimedOut,

    /// The virtual device could not be configured
    #[error("Output device configuration failed: {0}")]
    DeviceConfiguration(String),

    /// No decoder could be created
    #[error("Decoder unavailable: {0}")]
    DecoderUnavailable(String),
}

/// Side effect requested by the session
#[derive(Debug, Clone)]
pub enum SessionAction {
    /// Send a control packet to the phone
    Send(Packet),
    /// Start a media pipeline tagged with `generation`
    SpawnPipeline {
        /// Generation for the pipeline's events
        generation: u64,
    },
    /// Submit a frame to the running pipeline
    Forward(Frame),
    /// Stop the pipeline, blank and close the device
    ReleasePipeline,
    /// Publish an event to subscribers
    Emit(SessionEventKind),
}

/// A parsed inbound camera packet
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Capability announcement
    Capability(CapabilitySet),
    /// Status report
    Status(StatusReport),
    /// Frame header with its bulk payload, if one arrived
    Frame(FrameHeader, Option<Bytes>),
}

impl Inbound {
    /// Interpret a packet received from the phone
    pub fn from_packet(packet: &Packet, payload: Option<Bytes>) -> CoreResult<Self> {
        match packet.packet_type.as_str() {
            PACKET_TYPE_CAMERA_CAPABILITY => Ok(Inbound::Capability(packet.body_as()?)),
            PACKET_TYPE_CAMERA_STATUS => Ok(Inbound::Status(packet.body_as()?)),
            PACKET_TYPE_CAMERA_FRAME => Ok(Inbound::Frame(packet.body_as()?, payload)),
            _ => Err(CamLinkError::UnexpectedPacketType {
                packet_type: packet.packet_type.clone(),
            }),
        }
    }

    /// Whether this is a capability announcement
    pub fn is_capability(&self) -> bool {
        matches!(self, Inbound::Capability(_))
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Device identifier
    pub device_id: String,
    /// Unique id of this session
    pub session_id: Uuid,
    /// Current state
    pub state: SessionState,
    /// Settings of the requested or running stream
    pub negotiated: Option<NegotiatedSettings>,
    /// Announced capabilities
    pub capabilities: Option<CapabilitySet>,
    /// Last status the phone reported
    pub last_status: Option<StreamingStatus>,
    /// Reason for the error state
    pub failure: Option<SessionFailure>,
    /// Sequencer epoch
    pub epoch: u64,
    /// Stream counters
    pub stats: StreamStats,
    /// When the session was created
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MediaTotals {
    decoded: u64,
    decode_errors: u64,
    written: u64,
    write_errors: u64,
    dropped: u64,
}

impl MediaTotals {
    fn from_stats(stats: &PipelineStats) -> Self {
        Self {
            decoded: stats.decode.frames_decoded,
            decode_errors: stats.decode.decode_errors,
            written: stats.writer.frames_written,
            write_errors: stats.writer.write_errors,
            dropped: stats.frames_dropped(),
        }
    }

    fn add(&mut self, other: &MediaTotals) {
        self.decoded += other.decoded;
        self.decode_errors += other.decode_errors;
        self.written += other.written;
        self.write_errors += other.write_errors;
        self.dropped += other.dropped;
    }
}

/// State machine for one device
pub struct SessionCore {
    device_id: String,
    session_id: Uuid,
    config: BridgeConfig,
    state: SessionState,
    capabilities: CapabilityRegistry,
    negotiated: Option<NegotiatedSettings>,
    sequencer: FrameSequencer,
    recovery: RecoveryController,
    deadline: Option<Instant>,
    generation: u64,
    pipeline_active: bool,
    last_status: Option<StreamingStatus>,
    failure: Option<SessionFailure>,
    frames_received: u64,
    bytes_received: u64,
    explicit_keyframe_requests: u64,
    media_retired: MediaTotals,
    media_current: MediaTotals,
    started_at: Option<Instant>,
    created_at: DateTime<Utc>,
}

impl SessionCore {
    /// Create a session with no known capabilities
    pub fn new(device_id: impl Into<String>, config: BridgeConfig) -> Self {
        Self {
            device_id: device_id.into(),
            session_id: Uuid::new_v4(),
            capabilities: CapabilityRegistry::new(config.resolution_policy),
            sequencer: FrameSequencer::new(config.sequencer.clone()),
            recovery: RecoveryController::new(config.recovery.clone()),
            config,
            state: SessionState::Disconnected,
            negotiated: None,
            deadline: None,
            generation: 0,
            pipeline_active: false,
            last_status: None,
            failure: None,
            frames_received: 0,
            bytes_received: 0,
            explicit_keyframe_requests: 0,
            media_retired: MediaTotals::default(),
            media_current: MediaTotals::default(),
            started_at: None,
            created_at: Utc::now(),
        }
    }

    /// Device identifier
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Generation of the current media pipeline
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Settings of the requested or running stream
    pub fn negotiated(&self) -> Option<&NegotiatedSettings> {
        self.negotiated.as_ref()
    }

    /// Reason for the error state
    pub fn failure(&self) -> Option<&SessionFailure> {
        self.failure.as_ref()
    }

    /// Dispatch a parsed inbound packet
    pub fn on_inbound(&mut self, inbound: Inbound, now: Instant) -> Vec<SessionAction> {
        match inbound {
            Inbound::Capability(capabilities) => self.on_capabilities(capabilities),
            Inbound::Status(report) => self.on_status(report),
            Inbound::Frame(header, payload) => self.on_frame(&header, payload, now),
        }
    }

    /// Parse and dispatch a raw packet
    pub fn on_packet(
        &mut self,
        packet: &Packet,
        payload: Option<Bytes>,
        now: Instant,
    ) -> CoreResult<Vec<SessionAction>> {
        let inbound = Inbound::from_packet(packet, payload)?;
        Ok(self.on_inbound(inbound, now))
    }

    /// Store announced capabilities
    pub fn on_capabilities(&mut self, capabilities: CapabilitySet) -> Vec<SessionAction> {
        let cameras = capabilities.cameras.len();
        info!(
            "Device {} announced {} camera(s)",
            self.device_id, cameras
        );
        self.capabilities.update(capabilities);

        let mut actions = vec![SessionAction::Emit(SessionEventKind::CapabilitiesUpdated {
            cameras,
        })];
        if self.state == SessionState::Disconnected {
            self.transition(SessionState::CapabilityKnown, &mut actions);
        }
        actions
    }

    /// Validate and send a start request
    ///
    /// An active stream is stopped first. Nothing changes when validation
    /// fails.
    pub fn start(
        &mut self,
        request: &StreamRequest,
        now: Instant,
    ) -> CoreResult<(NegotiatedSettings, Vec<SessionAction>)> {
        if self.state == SessionState::Stopping {
            return Err(self.invalid_state("capability_known, stopped, error or an active stream"));
        }
        let negotiated = self.capabilities.validate(request)?;

        let mut actions = Vec::new();
        if self.state.is_active() {
            info!("Stopping current stream on {} before starting another", self.device_id);
            actions.push(SessionAction::Send(StopRequest {}.to_packet()?));
            self.release_pipeline(&mut actions);
        }

        actions.push(SessionAction::Send(negotiated.to_request().to_packet()?));
        self.recovery.reset();
        self.failure = None;
        self.negotiated = Some(negotiated.clone());
        self.begin_stream(now, &mut actions);
        actions.push(SessionAction::Emit(SessionEventKind::StreamRequested {
            settings: negotiated.clone(),
        }));
        info!(
            "Requested camera {} at {} {}fps {}kbps from {}",
            negotiated.camera_id,
            negotiated.resolution,
            negotiated.fps,
            negotiated.bitrate,
            self.device_id
        );
        Ok((negotiated, actions))
    }

    /// Stop the stream; a no-op unless one is active
    pub fn stop(&mut self, now: Instant) -> CoreResult<Vec<SessionAction>> {
        let mut actions = Vec::new();
        if !self.state.is_active() {
            debug!("Stop ignored in state {}", self.state);
            return Ok(actions);
        }
        actions.push(SessionAction::Send(StopRequest {}.to_packet()?));
        self.release_pipeline(&mut actions);
        self.deadline = Some(now + self.config.session.stop_timeout);
        self.transition(SessionState::Stopping, &mut actions);
        Ok(actions)
    }

    /// Apply a partial settings update while streaming
    pub fn change_settings(
        &mut self,
        settings: &StreamSettings,
    ) -> CoreResult<(NegotiatedSettings, Vec<SessionAction>)> {
        let current = self.streaming_settings()?;
        let updated = self.capabilities.validate_update(current, settings)?;

        let actions = vec![
            SessionAction::Send(settings.to_packet()?),
            SessionAction::Emit(SessionEventKind::SettingsChanged {
                settings: updated.clone(),
            }),
        ];
        self.sequencer.arm_resync();
        self.negotiated = Some(updated.clone());
        info!("Settings changed on {}", self.device_id);
        Ok((updated, actions))
    }

    /// Ask the phone for a keyframe while streaming
    pub fn request_keyframe(&mut self) -> CoreResult<Vec<SessionAction>> {
        self.streaming_settings()?;
        self.sequencer.arm_resync();
        self.explicit_keyframe_requests += 1;
        Ok(vec![
            SessionAction::Send(StreamSettings::keyframe_request().to_packet()?),
            SessionAction::Emit(SessionEventKind::KeyframeRequested { trigger: None }),
        ])
    }

    /// The transport lost the device
    pub fn disconnect(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        self.release_pipeline(&mut actions);
        self.capabilities.clear();
        self.negotiated = None;
        self.deadline = None;
        self.recovery.reset();
        self.transition(SessionState::Disconnected, &mut actions);
        actions.push(SessionAction::Emit(SessionEventKind::Disconnected));
        actions
    }

    /// Drive a phone status report
    pub fn on_status(&mut self, report: StatusReport) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        self.last_status = Some(report.status);

        match (self.state, report.status) {
            (SessionState::Starting, StreamingStatus::Streaming) => {
                self.deadline = None;
                self.transition(SessionState::Streaming, &mut actions);
            }
            (
                SessionState::Starting | SessionState::Streaming | SessionState::Stopping,
                StreamingStatus::Error,
            ) => {
                let message = report
                    .error
                    .unwrap_or_else(|| "camera error".to_string());
                self.fail(SessionFailure::RemoteCamera(message), false, &mut actions);
            }
            (SessionState::Stopping, StreamingStatus::Stopped) => {
                self.deadline = None;
                self.transition(SessionState::Stopped, &mut actions);
            }
            (SessionState::Streaming, StreamingStatus::Stopped) => {
                info!("Device {} stopped streaming on its own", self.device_id);
                self.release_pipeline(&mut actions);
                self.transition(SessionState::Stopped, &mut actions);
            }
            (state, status) => {
                debug!("Status {:?} ignored in state {}", status, state);
            }
        }
        actions
    }

    /// Route one frame through the sequencer
    pub fn on_frame(
        &mut self,
        header: &FrameHeader,
        payload: Option<Bytes>,
        now: Instant,
    ) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if !self.state.is_active() {
            debug!(
                "Frame {} discarded in state {}",
                header.sequence_number, self.state
            );
            return actions;
        }

        self.frames_received += 1;
        let payload = payload.unwrap_or_default();
        self.bytes_received += payload.len() as u64;
        let frame = match Frame::from_header(header, payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Discarding frame from {}: {}", self.device_id, e);
                return actions;
            }
        };

        // the phone may send its first frames before the streaming status
        if self.state == SessionState::Starting {
            debug!("Frame {} confirms the stream on {}", frame.sequence, self.device_id);
            self.deadline = None;
            self.transition(SessionState::Streaming, &mut actions);
        }

        let outcome = self.sequencer.process(&frame, now);
        for event in &outcome.events {
            match event {
                SequencerEvent::Gap { .. } => {
                    self.trigger(RecoveryTrigger::Gap, now, &mut actions);
                }
                SequencerEvent::ConfigurationViolation { sequence } => {
                    debug!("Configuration violation at {} counted", sequence);
                }
                SequencerEvent::StaleKeyframe { .. } => {
                    self.trigger(RecoveryTrigger::StaleKeyframe, now, &mut actions);
                }
            }
        }

        if outcome.is_forwarded() {
            if frame.frame_type.is_recovery_point() {
                self.recovery.on_recovery_frame();
            }
            actions.push(SessionAction::Forward(frame));
        }
        actions
    }

    /// React to the decode queue losing a frame
    ///
    /// A refused configuration or keyframe is handled like a sequence gap. A
    /// delta lost to eviction breaks the reference chain, so later deltas are
    /// held until the next keyframe.
    pub fn on_submit_outcome(
        &mut self,
        frame_type: FrameType,
        outcome: PushOutcome,
        now: Instant,
    ) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        match outcome {
            PushOutcome::Overflow => {
                warn!(
                    "Decode queue full, {:?} frame lost on {}",
                    frame_type, self.device_id
                );
                match frame_type {
                    FrameType::ConfigData => self.sequencer.require_configuration(),
                    FrameType::KeyFrame | FrameType::DeltaFrame => {
                        self.sequencer.arm_resync();
                    }
                }
                self.trigger(RecoveryTrigger::Gap, now, &mut actions);
            }
            PushOutcome::EvictedOldest | PushOutcome::DroppedIncoming
                if frame_type == FrameType::DeltaFrame =>
            {
                debug!("Delta frame dropped under backpressure on {}", self.device_id);
                if self.sequencer.arm_resync() {
                    self.trigger(RecoveryTrigger::Gap, now, &mut actions);
                }
            }
            _ => {}
        }
        actions
    }

    /// Handle a report from the current pipeline
    pub fn on_pipeline_event(
        &mut self,
        kind: PipelineEventKind,
        now: Instant,
    ) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if !self.pipeline_active {
            return actions;
        }
        match kind {
            PipelineEventKind::DecoderFaulted => {
                // the decoder restores its last configuration at the next keyframe
                self.sequencer.arm_resync();
                self.trigger(RecoveryTrigger::DecoderFaulted, now, &mut actions);
            }
            PipelineEventKind::DecoderUnavailable { reason } => {
                self.fail(SessionFailure::DecoderUnavailable(reason), true, &mut actions);
            }
            PipelineEventKind::SinkFailed { reason } => {
                self.fail(SessionFailure::DeviceConfiguration(reason), true, &mut actions);
            }
        }
        actions
    }

    /// Run deadlines, keyframe freshness and recovery escalation
    pub fn tick(&mut self, now: Instant) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        let expired = self.deadline.is_some_and(|deadline| now >= deadline);

        match self.state {
            SessionState::Starting if expired => {
                warn!("Device {} did not start streaming in time", self.device_id);
                self.fail(SessionFailure::StartTimedOut, true, &mut actions);
            }
            SessionState::Stopping if expired => {
                debug!("Stop not confirmed by {}, assuming stopped", self.device_id);
                self.deadline = None;
                self.transition(SessionState::Stopped, &mut actions);
            }
            SessionState::Streaming => {
                if let Some(SequencerEvent::StaleKeyframe { since }) =
                    self.sequencer.check_freshness(now)
                {
                    debug!("No keyframe from {} for {:?}", self.device_id, since);
                    self.trigger(RecoveryTrigger::StaleKeyframe, now, &mut actions);
                }
                if let Some(action) = self.recovery.poll(now) {
                    self.apply_recovery(action, now, &mut actions);
                }
            }
            _ => {}
        }
        actions
    }

    /// Latest counters of the running pipeline
    pub fn update_media_stats(&mut self, stats: &PipelineStats) {
        self.media_current = MediaTotals::from_stats(stats);
    }

    /// Final counters of a released pipeline
    pub fn retire_media_stats(&mut self, stats: &PipelineStats) {
        self.media_retired.add(&MediaTotals::from_stats(stats));
        self.media_current = MediaTotals::default();
    }

    /// Combined counters
    pub fn stats(&self) -> StreamStats {
        let sequencer = self.sequencer.stats();
        let recovery = self.recovery.stats();
        let mut media = MediaTotals::default();
        media.add(&self.media_retired);
        media.add(&self.media_current);
        StreamStats {
            frames_received: self.frames_received,
            frames_forwarded: sequencer.forwarded,
            frames_decoded: media.decoded,
            frames_written: media.written,
            bytes_received: self.bytes_received,
            duplicates: sequencer.duplicates,
            gaps: sequencer.gaps,
            discarded_deltas: sequencer.discarded_deltas,
            decode_errors: media.decode_errors,
            write_errors: media.write_errors,
            frames_dropped: media.dropped,
            keyframe_requests: recovery.keyframe_requests + self.explicit_keyframe_requests,
            restarts: recovery.restarts,
            started_at: self.started_at,
        }
    }

    /// Point-in-time view
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            device_id: self.device_id.clone(),
            session_id: self.session_id,
            state: self.state,
            negotiated: self.negotiated.clone(),
            capabilities: self.capabilities.capabilities().cloned(),
            last_status: self.last_status,
            failure: self.failure.clone(),
            epoch: self.sequencer.epoch(),
            stats: self.stats(),
            created_at: self.created_at,
        }
    }

    fn streaming_settings(&self) -> CoreResult<&NegotiatedSettings> {
        match (&self.negotiated, self.state) {
            (Some(settings), SessionState::Streaming) => Ok(settings),
            _ => Err(self.invalid_state("streaming")),
        }
    }

    fn invalid_state(&self, expected: &str) -> CamLinkError {
        CamLinkError::InvalidState {
            expected: expected.to_string(),
            actual: self.state.to_string(),
        }
    }

    fn begin_stream(&mut self, now: Instant, actions: &mut Vec<SessionAction>) {
        self.generation += 1;
        self.pipeline_active = true;
        actions.push(SessionAction::SpawnPipeline {
            generation: self.generation,
        });
        self.sequencer.start_epoch(now);
        self.started_at = Some(now);
        self.deadline = Some(now + self.config.session.start_timeout);
        self.transition(SessionState::Starting, actions);
    }

    fn release_pipeline(&mut self, actions: &mut Vec<SessionAction>) {
        if self.pipeline_active {
            self.pipeline_active = false;
            actions.push(SessionAction::ReleasePipeline);
        }
    }

    fn trigger(&mut self, trigger: RecoveryTrigger, now: Instant, actions: &mut Vec<SessionAction>) {
        if let Some(action) = self.recovery.on_trigger(trigger, now) {
            self.apply_recovery(action, now, actions);
        }
    }

    fn apply_recovery(
        &mut self,
        action: RecoveryAction,
        now: Instant,
        actions: &mut Vec<SessionAction>,
    ) {
        match action {
            RecoveryAction::RequestKeyframe { trigger } => {
                match StreamSettings::keyframe_request().to_packet() {
                    Ok(packet) => actions.push(SessionAction::Send(packet)),
                    Err(e) => error!("Failed to build keyframe request: {}", e),
                }
                actions.push(SessionAction::Emit(SessionEventKind::KeyframeRequested {
                    trigger: Some(trigger),
                }));
            }
            RecoveryAction::Restart { attempt } => {
                let Some(settings) = self.negotiated.clone() else {
                    return;
                };
                warn!("Restarting stream on {} (attempt {})", self.device_id, attempt);
                match restart_packets(&settings) {
                    Ok((stop, start)) => {
                        actions.push(SessionAction::Send(stop));
                        self.release_pipeline(actions);
                        actions.push(SessionAction::Send(start));
                        self.begin_stream(now, actions);
                        actions.push(SessionAction::Emit(SessionEventKind::StreamRestarted {
                            attempt,
                        }));
                    }
                    Err(e) => error!("Failed to build restart packets: {}", e),
                }
            }
            RecoveryAction::Fatal { attempts } => {
                self.fail(SessionFailure::RecoveryExhausted { attempts }, true, actions);
            }
        }
    }

    /// Enter the error state, releasing the pipeline
    fn fail(&mut self, failure: SessionFailure, send_stop: bool, actions: &mut Vec<SessionAction>) {
        error!("Session {} failed: {}", self.device_id, failure);
        if send_stop {
            match StopRequest {}.to_packet() {
                Ok(packet) => actions.push(SessionAction::Send(packet)),
                Err(e) => error!("Failed to build stop request: {}", e),
            }
        }
        self.release_pipeline(actions);
        self.deadline = None;
        self.failure = Some(failure.clone());
        self.transition(SessionState::Error, actions);
        actions.push(SessionAction::Emit(SessionEventKind::Failed { failure }));
    }

    fn transition(&mut self, to: SessionState, actions: &mut Vec<SessionAction>) {
        let from = self.state;
        if from == to {
            return;
        }
        info!("Session {}: {} -> {}", self.device_id, from, to);
        self.state = to;
        actions.push(SessionAction::Emit(SessionEventKind::StateChanged { from, to }));
    }
}

fn restart_packets(settings: &NegotiatedSettings) -> CoreResult<(Packet, Packet)> {
    Ok((StopRequest {}.to_packet()?, settings.to_request().to_packet()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camlink_core::{CameraDescriptor, CameraFacing, NegotiationError, Resolution};
    use std::time::Duration;

    fn capabilities() -> CapabilitySet {
        CapabilitySet {
            cameras: vec![
                CameraDescriptor {
                    id: 0,
                    name: "Back".to_string(),
                    facing: CameraFacing::Back,
                    max_resolution: Resolution::p1080(),
                    resolutions: vec![Resolution::p480(), Resolution::p720(), Resolution::p1080()],
                },
                CameraDescriptor {
                    id: 1,
                    name: "Front".to_string(),
                    facing: CameraFacing::Front,
                    max_resolution: Resolution::p720(),
                    resolutions: vec![Resolution::p480(), Resolution::p720()],
                },
            ],
            supported_codecs: vec!["h264".to_string()],
            audio_supported: false,
            max_resolution: Resolution::p1080(),
            max_bitrate: 8000,
            max_fps: 60,
        }
    }

    fn header(frame_type: FrameType, sequence: u64) -> (FrameHeader, Option<Bytes>) {
        let payload = match frame_type {
            FrameType::ConfigData => {
                Bytes::from_static(&[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xce])
            }
            FrameType::KeyFrame => Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]),
            FrameType::DeltaFrame => Bytes::from_static(&[0, 0, 0, 1, 0x41, 0x9a]),
        };
        (
            FrameHeader {
                frame_type,
                timestamp_us: sequence * 33_333,
                sequence_number: sequence,
                size: payload.len() as u64,
            },
            Some(payload),
        )
    }

    fn feed(
        core: &mut SessionCore,
        frame_type: FrameType,
        sequence: u64,
        now: Instant,
    ) -> Vec<SessionAction> {
        let (header, payload) = header(frame_type, sequence);
        core.on_frame(&header, payload, now)
    }

    fn forwarded(actions: &[SessionAction]) -> Vec<u64> {
        actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::Forward(frame) => Some(frame.sequence),
                _ => None,
            })
            .collect()
    }

    fn sent(actions: &[SessionAction]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::Send(packet) => Some(packet.packet_type.clone()),
                _ => None,
            })
            .collect()
    }

    fn keyframe_requests(actions: &[SessionAction]) -> usize {
        actions
            .iter()
            .filter(|a| {
                matches!(a, SessionAction::Send(p)
                    if p.packet_type == "cconnect.camera.settings" && p.body == serde_json::json!({}))
            })
            .count()
    }

    fn streaming(now: Instant) -> SessionCore {
        let mut core = SessionCore::new("phone-1", BridgeConfig::default());
        core.on_capabilities(capabilities());
        let request = StreamRequest {
            camera_id: 1,
            resolution: Resolution::p720(),
            fps: 30,
            bitrate: 2000,
            codec: "h264".to_string(),
        };
        core.start(&request, now).unwrap();
        core.on_status(StatusReport::streaming(1, Resolution::p720(), 30, 2000));
        assert_eq!(core.state(), SessionState::Streaming);
        core
    }

    #[test]
    fn test_capability_moves_to_capability_known() {
        let mut core = SessionCore::new("phone-1", BridgeConfig::default());
        assert_eq!(core.state(), SessionState::Disconnected);
        let actions = core.on_capabilities(capabilities());
        assert_eq!(core.state(), SessionState::CapabilityKnown);
        assert!(actions.iter().any(|a| matches!(
            a,
            SessionAction::Emit(SessionEventKind::StateChanged {
                to: SessionState::CapabilityKnown,
                ..
            })
        )));
    }

    #[test]
    fn test_start_accepts_matching_request() {
        let now = Instant::now();
        let mut core = SessionCore::new("phone-1", BridgeConfig::default());
        core.on_capabilities(capabilities());

        let request = StreamRequest {
            camera_id: 1,
            resolution: Resolution::p720(),
            fps: 30,
            bitrate: 2000,
            codec: "h264".to_string(),
        };
        let (negotiated, actions) = core.start(&request, now).unwrap();
        assert_eq!(negotiated.to_request(), request);
        assert_eq!(core.state(), SessionState::Starting);
        assert_eq!(sent(&actions), vec!["cconnect.camera.start"]);
        assert!(actions
            .iter()
            .any(|a| matches!(a, SessionAction::SpawnPipeline { generation: 1 })));
    }

    #[test]
    fn test_rejected_start_changes_nothing() {
        let now = Instant::now();
        let mut core = SessionCore::new("phone-1", BridgeConfig::default());
        let err = core.start(&StreamRequest::hd(0), now).unwrap_err();
        assert!(matches!(
            err,
            CamLinkError::Negotiation(NegotiationError::CapabilitiesUnknown)
        ));

        core.on_capabilities(capabilities());
        let mut request = StreamRequest::hd(1);
        request.resolution = Resolution::p1080();
        assert!(core.start(&request, now).is_err());
        assert_eq!(core.state(), SessionState::CapabilityKnown);
        assert_eq!(core.generation(), 0);
    }

    #[test]
    fn test_clean_stream_forwards_every_frame() {
        let now = Instant::now();
        let mut core = streaming(now);
        let mut actions = Vec::new();
        actions.extend(feed(&mut core, FrameType::ConfigData, 0, now));
        actions.extend(feed(&mut core, FrameType::KeyFrame, 1, now));
        actions.extend(feed(&mut core, FrameType::DeltaFrame, 2, now));
        actions.extend(feed(&mut core, FrameType::DeltaFrame, 3, now));

        assert_eq!(forwarded(&actions), vec![0, 1, 2, 3]);
        assert!(sent(&actions).is_empty());
        assert_eq!(core.stats().frames_forwarded, 4);
    }

    #[test]
    fn test_gap_discards_and_requests_one_keyframe() {
        let now = Instant::now();
        let mut core = streaming(now);
        let mut actions = Vec::new();
        actions.extend(feed(&mut core, FrameType::ConfigData, 0, now));
        actions.extend(feed(&mut core, FrameType::KeyFrame, 1, now));
        actions.extend(feed(&mut core, FrameType::DeltaFrame, 3, now));

        assert_eq!(forwarded(&actions), vec![0, 1]);
        assert_eq!(keyframe_requests(&actions), 1);
        assert_eq!(core.stats().gaps, 1);
    }

    #[test]
    fn test_settings_change_holds_deltas_until_keyframe() {
        let now = Instant::now();
        let mut core = streaming(now);
        feed(&mut core, FrameType::ConfigData, 0, now);
        feed(&mut core, FrameType::KeyFrame, 1, now);

        let (updated, actions) = core
            .change_settings(&StreamSettings::change_resolution(Resolution::p480()))
            .unwrap();
        assert_eq!(updated.resolution, Resolution::p480());
        assert_eq!(sent(&actions), vec!["cconnect.camera.settings"]);

        let mut actions = Vec::new();
        actions.extend(feed(&mut core, FrameType::DeltaFrame, 2, now));
        actions.extend(feed(&mut core, FrameType::DeltaFrame, 3, now));
        actions.extend(feed(&mut core, FrameType::KeyFrame, 4, now));
        actions.extend(feed(&mut core, FrameType::DeltaFrame, 5, now));
        assert_eq!(forwarded(&actions), vec![4, 5]);
    }

    #[test]
    fn test_settings_change_validated() {
        let now = Instant::now();
        let mut core = streaming(now);
        let err = core
            .change_settings(&StreamSettings::change_resolution(Resolution::p1080()))
            .unwrap_err();
        assert_eq!(err.error_code(), "NEGOTIATION_FAILED");
        assert_eq!(core.negotiated().unwrap().resolution, Resolution::p720());
    }

    #[test]
    fn test_decoder_fault_requests_keyframe_and_keeps_order() {
        let now = Instant::now();
        let mut core = streaming(now);
        let mut all = Vec::new();
        all.extend(feed(&mut core, FrameType::ConfigData, 0, now));
        all.extend(feed(&mut core, FrameType::KeyFrame, 1, now));
        all.extend(feed(&mut core, FrameType::DeltaFrame, 2, now));

        let actions = core.on_pipeline_event(PipelineEventKind::DecoderFaulted, now);
        assert_eq!(keyframe_requests(&actions), 1);
        assert!(forwarded(&actions).is_empty());
        assert_eq!(core.state(), SessionState::Streaming);
        all.extend(actions);

        all.extend(feed(&mut core, FrameType::DeltaFrame, 3, now));
        all.extend(feed(&mut core, FrameType::KeyFrame, 4, now));
        all.extend(feed(&mut core, FrameType::DeltaFrame, 5, now));

        let sequences = forwarded(&all);
        assert_eq!(sequences, vec![0, 1, 2, 4, 5]);
        assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_repeated_decoder_fault_within_backoff_requests_once() {
        let now = Instant::now();
        let mut core = streaming(now);
        feed(&mut core, FrameType::ConfigData, 0, now);
        feed(&mut core, FrameType::KeyFrame, 1, now);

        let first = core.on_pipeline_event(PipelineEventKind::DecoderFaulted, now);
        let second = core.on_pipeline_event(
            PipelineEventKind::DecoderFaulted,
            now + Duration::from_millis(200),
        );
        assert_eq!(keyframe_requests(&first), 1);
        assert_eq!(keyframe_requests(&second), 0);
        assert_eq!(core.stats().keyframe_requests, 1);
        assert_eq!(core.stats().restarts, 0);
    }

    #[test]
    fn test_frames_before_streaming_status_confirm_the_stream() {
        let now = Instant::now();
        let mut core = SessionCore::new("phone-1", BridgeConfig::default());
        core.on_capabilities(capabilities());
        core.start(&StreamRequest::hd(1), now).unwrap();
        assert_eq!(core.state(), SessionState::Starting);

        let mut actions = Vec::new();
        actions.extend(feed(&mut core, FrameType::ConfigData, 0, now));
        assert_eq!(core.state(), SessionState::Streaming);
        actions.extend(feed(&mut core, FrameType::KeyFrame, 1, now));
        actions.extend(core.on_status(StatusReport::streaming(1, Resolution::p720(), 30, 2000)));
        for sequence in 2..6 {
            actions.extend(feed(&mut core, FrameType::DeltaFrame, sequence, now));
        }

        assert_eq!(forwarded(&actions), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(keyframe_requests(&actions), 0);

        // no start deadline remains once frames flow
        core.tick(now + Duration::from_secs(10));
        assert_ne!(core.state(), SessionState::Error);
    }

    #[test]
    fn test_evicted_delta_holds_deltas_until_keyframe() {
        let now = Instant::now();
        let mut core = streaming(now);
        feed(&mut core, FrameType::ConfigData, 0, now);
        feed(&mut core, FrameType::KeyFrame, 1, now);
        feed(&mut core, FrameType::DeltaFrame, 2, now);

        let actions = core.on_submit_outcome(FrameType::DeltaFrame, PushOutcome::EvictedOldest, now);
        assert_eq!(keyframe_requests(&actions), 1);

        let mut actions = Vec::new();
        actions.extend(feed(&mut core, FrameType::DeltaFrame, 3, now));
        actions.extend(feed(&mut core, FrameType::KeyFrame, 4, now));
        actions.extend(feed(&mut core, FrameType::DeltaFrame, 5, now));
        assert_eq!(forwarded(&actions), vec![4, 5]);
    }

    #[test]
    fn test_eviction_behind_a_keyframe_does_not_resync() {
        let now = Instant::now();
        let mut core = streaming(now);
        feed(&mut core, FrameType::ConfigData, 0, now);
        feed(&mut core, FrameType::KeyFrame, 1, now);

        let actions = core.on_submit_outcome(FrameType::KeyFrame, PushOutcome::EvictedOldest, now);
        assert!(actions.is_empty());
        assert_eq!(forwarded(&feed(&mut core, FrameType::DeltaFrame, 2, now)), vec![2]);
    }

    #[test]
    fn test_disconnect_releases_and_ignores_frames() {
        let now = Instant::now();
        let mut core = streaming(now);
        feed(&mut core, FrameType::ConfigData, 0, now);

        let actions = core.disconnect();
        assert!(actions
            .iter()
            .any(|a| matches!(a, SessionAction::ReleasePipeline)));
        assert_eq!(core.state(), SessionState::Disconnected);
        assert!(core.snapshot().capabilities.is_none());

        assert!(feed(&mut core, FrameType::KeyFrame, 1, now).is_empty());
        core.on_capabilities(capabilities());
        assert_eq!(core.state(), SessionState::CapabilityKnown);
    }

    #[test]
    fn test_remote_error_surfaces_text() {
        let now = Instant::now();
        let mut core = streaming(now);
        let actions = core.on_status(StatusReport::error("Camera in use by another app"));
        assert_eq!(core.state(), SessionState::Error);
        assert_eq!(
            core.failure(),
            Some(&SessionFailure::RemoteCamera(
                "Camera in use by another app".to_string()
            ))
        );
        assert!(actions
            .iter()
            .any(|a| matches!(a, SessionAction::ReleasePipeline)));
        assert!(sent(&actions).is_empty());

        // a new start leaves the error state
        core.start(&StreamRequest::hd(0), now).unwrap();
        assert_eq!(core.state(), SessionState::Starting);
        assert!(core.failure().is_none());
    }

    #[test]
    fn test_stop_then_timeout_is_stopped() {
        let now = Instant::now();
        let mut core = streaming(now);
        let actions = core.stop(now).unwrap();
        assert_eq!(sent(&actions), vec!["cconnect.camera.stop"]);
        assert_eq!(core.state(), SessionState::Stopping);

        assert!(core.tick(now + Duration::from_secs(1)).is_empty());
        core.tick(now + Duration::from_secs(4));
        assert_eq!(core.state(), SessionState::Stopped);

        assert!(core.stop(now).unwrap().is_empty());
    }

    #[test]
    fn test_start_timeout_fails_session() {
        let now = Instant::now();
        let mut core = SessionCore::new("phone-1", BridgeConfig::default());
        core.on_capabilities(capabilities());
        core.start(&StreamRequest::hd(0), now).unwrap();

        core.tick(now + Duration::from_secs(6));
        assert_eq!(core.state(), SessionState::Error);
        assert_eq!(core.failure(), Some(&SessionFailure::StartTimedOut));
    }

    #[test]
    fn test_restart_stops_active_stream_first() {
        let now = Instant::now();
        let mut core = streaming(now);
        let (_, actions) = core.start(&StreamRequest::hd(0), now).unwrap();
        assert_eq!(
            sent(&actions),
            vec!["cconnect.camera.stop", "cconnect.camera.start"]
        );
        let release = actions
            .iter()
            .position(|a| matches!(a, SessionAction::ReleasePipeline))
            .unwrap();
        let spawn = actions
            .iter()
            .position(|a| matches!(a, SessionAction::SpawnPipeline { .. }))
            .unwrap();
        assert!(release < spawn);
        assert_eq!(core.generation(), 2);
    }

    #[test]
    fn test_unanswered_keyframe_request_restarts_then_fails() {
        let now = Instant::now();
        let mut core = streaming(now);
        feed(&mut core, FrameType::ConfigData, 0, now);
        feed(&mut core, FrameType::KeyFrame, 1, now);
        feed(&mut core, FrameType::DeltaFrame, 3, now);

        let mut t = now;
        let mut restarts = 0;
        for _ in 0..3 {
            t += Duration::from_millis(2100);
            let actions = core.tick(t);
            if actions.iter().any(|a| {
                matches!(
                    a,
                    SessionAction::Emit(SessionEventKind::StreamRestarted { .. })
                )
            }) {
                restarts += 1;
            }
            assert_eq!(core.state(), SessionState::Starting);
            core.on_status(StatusReport::streaming(1, Resolution::p720(), 30, 2000));
        }
        assert_eq!(restarts, 3);

        t += Duration::from_millis(2100);
        core.tick(t);
        assert_eq!(core.state(), SessionState::Error);
        assert_eq!(
            core.failure(),
            Some(&SessionFailure::RecoveryExhausted { attempts: 3 })
        );
    }

    #[test]
    fn test_config_overflow_requires_new_configuration() {
        let now = Instant::now();
        let mut core = streaming(now);
        feed(&mut core, FrameType::ConfigData, 0, now);

        let actions = core.on_submit_outcome(FrameType::ConfigData, PushOutcome::Overflow, now);
        assert_eq!(keyframe_requests(&actions), 1);
        let actions = feed(&mut core, FrameType::KeyFrame, 1, now);
        assert!(forwarded(&actions).is_empty());

        assert!(core
            .on_submit_outcome(FrameType::DeltaFrame, PushOutcome::EvictedOldest, now)
            .is_empty());
    }

    #[test]
    fn test_stale_pipeline_events_after_release_ignored() {
        let now = Instant::now();
        let mut core = streaming(now);
        core.stop(now).unwrap();
        let actions = core.on_pipeline_event(
            PipelineEventKind::SinkFailed {
                reason: "busy".to_string(),
            },
            now,
        );
        assert!(actions.is_empty());
        assert_eq!(core.state(), SessionState::Stopping);
    }

    #[test]
    fn test_sink_failure_is_fatal() {
        let now = Instant::now();
        let mut core = streaming(now);
        let actions = core.on_pipeline_event(
            PipelineEventKind::SinkFailed {
                reason: "VIDIOC_S_FMT rejected".to_string(),
            },
            now,
        );
        assert_eq!(core.state(), SessionState::Error);
        assert_eq!(sent(&actions), vec!["cconnect.camera.stop"]);
        assert!(matches!(
            core.failure(),
            Some(SessionFailure::DeviceConfiguration(_))
        ));
    }

    #[test]
    fn test_frame_size_mismatch_reveals_gap() {
        let now = Instant::now();
        let mut core = streaming(now);
        feed(&mut core, FrameType::ConfigData, 0, now);
        feed(&mut core, FrameType::KeyFrame, 1, now);

        let (mut bad, payload) = header(FrameType::DeltaFrame, 2);
        bad.size += 1;
        assert!(core.on_frame(&bad, payload, now).is_empty());

        let actions = feed(&mut core, FrameType::DeltaFrame, 3, now);
        assert!(forwarded(&actions).is_empty());
        assert_eq!(keyframe_requests(&actions), 1);
    }

    #[test]
    fn test_inbound_rejects_outbound_packet_types() {
        let packet = StopRequest {}.to_packet().unwrap();
        assert!(matches!(
            Inbound::from_packet(&packet, None),
            Err(CamLinkError::UnexpectedPacketType { .. })
        ));
    }
}
