//! Media processing error types and handling
//!
//! Errors raised by the decode pipeline, pixel conversion and the virtual
//! output device.

use camlink_core::CamLinkError;
use thiserror::Error;

/// Main error type for media processing operations
#[derive(Error, Debug)]
pub enum MediaError {
    /// I/O operation failed
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Codec initialization failed
    #[error("Codec initialization failed: {codec} - {reason}")]
    CodecInitializationFailed {
        /// Codec name
        codec: String,
        /// Failure reason
        reason: String,
    },

    /// Decoding operation failed
    #[error("Decoding failed: {codec} - {reason}")]
    DecodingFailed {
        /// Codec name
        codec: String,
        /// Failure reason
        reason: String,
    },

    /// Configuration data lacks SPS or PPS
    #[error("Invalid decoder configuration: {reason}")]
    InvalidConfigData {
        /// What is missing or malformed
        reason: String,
    },

    /// Output device could not be opened or its format set
    #[error("Device configuration failed for {device}: {reason}")]
    DeviceConfigurationFailed {
        /// Device path or sink name
        device: String,
        /// Failure reason
        reason: String,
    },

    /// Output device rejected a frame
    #[error("Device write failed for {device}: {reason}")]
    DeviceWriteFailed {
        /// Device path or sink name
        device: String,
        /// Failure reason
        reason: String,
    },

    /// Output device had no room for a frame
    #[error("Device busy: {device}")]
    DeviceBusy {
        /// Device path or sink name
        device: String,
    },

    /// Invalid frame data error
    #[error("Invalid frame data: expected {expected} bytes, got {actual}")]
    InvalidFrameData {
        /// Expected data size
        expected: usize,
        /// Actual data size
        actual: usize,
    },

    /// Invalid state for operation
    #[error("Invalid state: {message}")]
    InvalidState {
        /// State error message
        message: String,
    },
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

impl MediaError {
    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            MediaError::Io { .. } => true,
            MediaError::DecodingFailed { .. } => true,
            MediaError::DeviceWriteFailed { .. } => true,
            MediaError::DeviceBusy { .. } => true,
            MediaError::InvalidFrameData { .. } => true,
            MediaError::InvalidConfigData { .. } => true,
            MediaError::CodecInitializationFailed { .. } => false,
            MediaError::DeviceConfigurationFailed { .. } => false,
            MediaError::InvalidState { .. } => false,
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            MediaError::Io { .. } => ErrorCategory::System,
            MediaError::CodecInitializationFailed { .. } => ErrorCategory::Codec,
            MediaError::DecodingFailed { .. } => ErrorCategory::Codec,
            MediaError::InvalidConfigData { .. } => ErrorCategory::Format,
            MediaError::DeviceConfigurationFailed { .. } => ErrorCategory::Device,
            MediaError::DeviceWriteFailed { .. } => ErrorCategory::Device,
            MediaError::DeviceBusy { .. } => ErrorCategory::Device,
            MediaError::InvalidFrameData { .. } => ErrorCategory::Data,
            MediaError::InvalidState { .. } => ErrorCategory::State,
        }
    }
}

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// System-level errors (I/O, permissions, etc.)
    System,
    /// Codec-related errors
    Codec,
    /// Bitstream format errors
    Format,
    /// Data validation errors
    Data,
    /// Output device errors
    Device,
    /// State management errors
    State,
}

impl From<MediaError> for CamLinkError {
    fn from(err: MediaError) -> Self {
        CamLinkError::MediaProcessing {
            reason: err.to_string(),
        }
    }
}
