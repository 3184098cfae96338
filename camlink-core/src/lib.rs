//! # camlink Core
//!
//! Wire protocol and stream-control logic for the camlink camera bridge.
//! This crate holds everything that decides *what* happens to a phone's H.264
//! stream: capability negotiation, per-frame sequencing and the recovery
//! policy. It performs no I/O; callers pass in packets, frames and the current
//! time, and act on the decisions returned.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod capability;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod recovery;
pub mod sequencer;

// Re-export main types
pub use capability::{CapabilityRegistry, NegotiatedSettings, ResolutionPolicy};
pub use error::{CamLinkError, CoreResult, NegotiationError};
pub use frame::Frame;
pub use protocol::{
    CameraDescriptor, CameraFacing, CapabilitySet, FrameHeader, FramePriority, FrameType, Packet,
    PacketBody, Resolution, StatusReport, StopRequest, StreamRequest, StreamSettings,
    StreamingStatus,
};
pub use recovery::{RecoveryAction, RecoveryConfig, RecoveryController, RecoveryStats, RecoveryTrigger};
pub use sequencer::{
    DiscardReason, Disposition, FrameSequencer, SequencerConfig, SequencerEvent, SequencerOutcome,
    SequencerStats,
};
