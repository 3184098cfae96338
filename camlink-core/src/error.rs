//! Error types for the camlink bridge

use std::time::Duration;
use thiserror::Error;

/// Main error type for camlink operations
#[derive(Error, Debug)]
pub enum CamLinkError {
    /// Stream request or settings update rejected against the announced capabilities
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Packet body could not be interpreted
    #[error("Invalid packet {packet_type}: {reason}")]
    InvalidPacket {
        /// Packet type string
        packet_type: String,
        /// Reason the body was rejected
        reason: String,
    },

    /// Packet type is not part of the camera protocol
    #[error("Unexpected packet type: {packet_type}")]
    UnexpectedPacketType {
        /// Packet type string
        packet_type: String,
    },

    /// Operation not allowed in the current session state
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Frame header and payload disagree
    #[error("Invalid frame {sequence}: {reason}")]
    InvalidFrame {
        /// Sequence number from the header
        sequence: u64,
        /// Reason the frame was rejected
        reason: String,
    },

    /// No session exists for the device
    #[error("Session not found for device {device_id}")]
    SessionNotFound {
        /// Device identifier
        device_id: String,
    },

    /// Session actor has already shut down
    #[error("Session closed for device {device_id}")]
    SessionClosed {
        /// Device identifier
        device_id: String,
    },

    /// Outbound packet could not be delivered
    #[error("Transport error: {reason}")]
    Transport {
        /// Reason for transport error
        reason: String,
    },

    /// Media processing error
    #[error("Media processing error: {reason}")]
    MediaProcessing {
        /// Reason for media error
        reason: String,
    },

    /// Connection to the device was lost
    #[error("Connection lost to device {device_id}")]
    ConnectionLost {
        /// Device identifier
        device_id: String,
    },

    /// Phone reported a camera failure
    #[error("Remote camera error: {message}")]
    RemoteCamera {
        /// Error text as reported by the phone
        message: String,
    },

    /// Operation timed out
    #[error("Operation timed out after {duration:?}")]
    Timeout {
        /// Duration after which timeout occurred
        duration: Duration,
    },

    /// JSON (de)serialization error
    #[error("Serialization error: {source}")]
    Serialization {
        /// Underlying serde_json error
        #[from]
        source: serde_json::Error,
    },
}

impl CamLinkError {
    /// Whether the session can continue after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            CamLinkError::Negotiation(_)
            | CamLinkError::InvalidPacket { .. }
            | CamLinkError::UnexpectedPacketType { .. }
            | CamLinkError::InvalidState { .. }
            | CamLinkError::InvalidFrame { .. }
            | CamLinkError::Transport { .. }
            | CamLinkError::Timeout { .. }
            | CamLinkError::Serialization { .. } => true,
            CamLinkError::SessionNotFound { .. }
            | CamLinkError::SessionClosed { .. }
            | CamLinkError::MediaProcessing { .. }
            | CamLinkError::ConnectionLost { .. }
            | CamLinkError::RemoteCamera { .. } => false,
        }
    }

    /// Get error code for programmatic handling
    pub fn error_code(&self) -> &'static str {
        match self {
            CamLinkError::Negotiation(_) => "NEGOTIATION_FAILED",
            CamLinkError::InvalidPacket { .. } => "INVALID_PACKET",
            CamLinkError::UnexpectedPacketType { .. } => "UNEXPECTED_PACKET_TYPE",
            CamLinkError::InvalidState { .. } => "INVALID_STATE",
            CamLinkError::InvalidFrame { .. } => "INVALID_FRAME",
            CamLinkError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            CamLinkError::SessionClosed { .. } => "SESSION_CLOSED",
            CamLinkError::Transport { .. } => "TRANSPORT_ERROR",
            CamLinkError::MediaProcessing { .. } => "MEDIA_PROCESSING_ERROR",
            CamLinkError::ConnectionLost { .. } => "CONNECTION_LOST",
            CamLinkError::RemoteCamera { .. } => "REMOTE_CAMERA_ERROR",
            CamLinkError::Timeout { .. } => "TIMEOUT",
            CamLinkError::Serialization { .. } => "SERIALIZATION_ERROR",
        }
    }
}

/// Reasons a stream request or settings update is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// No capability announcement has been received yet
    #[error("camera capabilities are not known yet")]
    CapabilitiesUnknown,

    /// Codec is not H.264 or not advertised by the phone
    #[error("unsupported codec {codec}")]
    UnsupportedCodec {
        /// Requested codec
        codec: String,
    },

    /// Camera id is not in the announced camera list
    #[error("unknown camera {camera_id}")]
    UnknownCamera {
        /// Requested camera id
        camera_id: u32,
    },

    /// Resolution is not in the camera's supported list
    #[error("camera {camera_id} does not support {width}x{height}")]
    UnsupportedResolution {
        /// Camera id
        camera_id: u32,
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
    },

    /// Resolution exceeds the camera or device maximum
    #[error("{width}x{height} exceeds maximum {max_width}x{max_height}")]
    ResolutionExceedsMaximum {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
        /// Maximum width
        max_width: u32,
        /// Maximum height
        max_height: u32,
    },

    /// Frame rate is zero or above the advertised maximum
    #[error("frame rate {fps} outside 1..={max}")]
    InvalidFps {
        /// Requested frame rate
        fps: u32,
        /// Advertised maximum
        max: u32,
    },

    /// Bitrate is zero or above the advertised maximum
    #[error("bitrate {bitrate} kbps outside 1..={max}")]
    InvalidBitrate {
        /// Requested bitrate in kbps
        bitrate: u32,
        /// Advertised maximum in kbps
        max: u32,
    },
}

/// Result type alias for camlink operations
pub type CoreResult<T> = Result<T, CamLinkError>;
