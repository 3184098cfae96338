//! H.264 decode pipeline
//!
//! [`DecodePipeline`] wraps an [`H264Backend`] with the configure/decode/fault
//! lifecycle the session relies on:
//!
//! ```text
//! Unconfigured --configure--> Configured --K consecutive errors--> Faulted
//!                                  ^                                  |
//!                                  +---configure, or keyframe with----+
//!                                      the last good configuration
//! ```

use crate::error::{MediaError, MediaResult};
use crate::image::I420Image;
use crate::nal;
use camlink_core::{Frame, FrameType};
use tracing::{debug, info, warn};

#[cfg(feature = "h264")]
use openh264::{decoder::Decoder, formats::YUVSource};

/// A synchronous H.264 decoder
///
/// Input is one Annex B access unit; output is a picture once the decoder has
/// one ready.
pub trait H264Backend {
    /// Feed one access unit
    fn decode(&mut self, data: &[u8]) -> MediaResult<Option<I420Image>>;

    /// Drop all decoder state so new parameter sets can be applied
    fn reset(&mut self) -> MediaResult<()>;

    /// Backend name for logs
    fn name(&self) -> &str;
}

/// openh264-backed decoder
#[cfg(feature = "h264")]
pub struct OpenH264Backend {
    decoder: Decoder,
}

#[cfg(feature = "h264")]
impl OpenH264Backend {
    /// Create a decoder instance
    pub fn new() -> MediaResult<Self> {
        Ok(Self {
            decoder: Self::create()?,
        })
    }

    fn create() -> MediaResult<Decoder> {
        Decoder::new().map_err(|e| MediaError::CodecInitializationFailed {
            codec: "H.264".to_string(),
            reason: format!("Failed to create H.264 decoder: {}", e),
        })
    }
}

#[cfg(feature = "h264")]
impl H264Backend for OpenH264Backend {
    fn decode(&mut self, data: &[u8]) -> MediaResult<Option<I420Image>> {
        let decoded = self
            .decoder
            .decode(data)
            .map_err(|e| MediaError::DecodingFailed {
                codec: "H.264".to_string(),
                reason: format!("H.264 decoding failed: {}", e),
            })?;

        match decoded {
            Some(yuv) => {
                let (width, height) = yuv.dimensions();
                let image = I420Image::from_strided(
                    width as u32,
                    height as u32,
                    (yuv.y(), yuv.u(), yuv.v()),
                    yuv.strides(),
                )?;
                Ok(Some(image))
            }
            None => Ok(None),
        }
    }

    fn reset(&mut self) -> MediaResult<()> {
        self.decoder = Self::create()?;
        Ok(())
    }

    fn name(&self) -> &str {
        "openh264"
    }
}

/// Decode pipeline tuning
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Consecutive decode errors that fault the pipeline
    pub error_threshold: u32,
    /// Frames the decode stage may queue
    pub queue_capacity: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            error_threshold: 3,
            queue_capacity: 3,
        }
    }
}

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// No configuration applied yet
    Unconfigured,
    /// Ready to decode
    Configured,
    /// Too many consecutive errors; waiting for configuration or a keyframe
    Faulted,
}

/// Result of feeding one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Configuration applied
    Configured,
    /// A picture is ready
    Picture(I420Image),
    /// Accepted, no picture yet
    Buffered,
    /// Decode error below the threshold
    Failed,
    /// This error reached the threshold; the pipeline is now faulted
    Faulted,
    /// Dropped without decoding (faulted or unconfigured)
    Discarded,
}

/// Decode counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Pictures produced
    pub frames_decoded: u64,
    /// Decode errors, including configuration failures
    pub decode_errors: u64,
    /// Frames dropped while faulted or unconfigured
    pub frames_discarded: u64,
    /// Transitions into the faulted state
    pub faults: u64,
}

/// Stateful wrapper around a decoder backend
pub struct DecodePipeline {
    backend: Box<dyn H264Backend>,
    config: DecodeConfig,
    state: DecodeState,
    config_attempted: bool,
    configuration: Option<Vec<u8>>,
    consecutive_errors: u32,
    stats: DecodeStats,
}

impl DecodePipeline {
    /// Wrap a backend
    pub fn new(backend: Box<dyn H264Backend>, config: DecodeConfig) -> Self {
        Self {
            backend,
            config,
            state: DecodeState::Unconfigured,
            config_attempted: false,
            configuration: None,
            consecutive_errors: 0,
            stats: DecodeStats::default(),
        }
    }

    /// Route a forwarded frame by type
    pub fn process(&mut self, frame: &Frame) -> DecodeOutcome {
        match frame.frame_type {
            FrameType::ConfigData => match self.configure(&frame.payload) {
                Ok(()) => DecodeOutcome::Configured,
                Err(e) => {
                    warn!("Configuration {} rejected: {}", frame.sequence, e);
                    self.record_error()
                }
            },
            FrameType::KeyFrame | FrameType::DeltaFrame => self.decode(frame),
        }
    }

    /// Apply SPS/PPS; resets the backend and clears a fault
    pub fn configure(&mut self, config: &[u8]) -> MediaResult<()> {
        self.config_attempted = true;
        nal::validate_config(config)?;
        self.backend.reset()?;
        if let Some(image) = self.backend.decode(config)? {
            debug!(
                "Decoder produced a {}x{} picture from configuration data",
                image.width, image.height
            );
        }
        if self.state != DecodeState::Configured {
            info!("Decoder {} configured", self.backend.name());
        }
        self.state = DecodeState::Configured;
        self.consecutive_errors = 0;
        self.configuration = Some(config.to_vec());
        Ok(())
    }

    /// Re-apply the last accepted configuration after a fault
    fn restore_configuration(&mut self) -> MediaResult<()> {
        let config = self
            .configuration
            .clone()
            .ok_or_else(|| MediaError::InvalidState {
                message: "no configuration to restore".to_string(),
            })?;
        self.configure(&config)
    }

    /// Decode a key or delta frame
    pub fn decode(&mut self, frame: &Frame) -> DecodeOutcome {
        match self.state {
            DecodeState::Unconfigured if self.config_attempted => {
                // configuration was forwarded but rejected
                self.record_error()
            }
            DecodeState::Unconfigured => {
                debug_assert!(
                    false,
                    "frame {} reached the decoder before configuration",
                    frame.sequence
                );
                self.stats.frames_discarded += 1;
                DecodeOutcome::Discarded
            }
            DecodeState::Faulted if frame.frame_type == FrameType::KeyFrame => {
                match self.restore_configuration() {
                    Ok(()) => {
                        info!("Decoder restored at keyframe {}", frame.sequence);
                        self.decode_configured(frame)
                    }
                    Err(e) => {
                        debug!("Keyframe {} discarded: {}", frame.sequence, e);
                        self.stats.frames_discarded += 1;
                        DecodeOutcome::Discarded
                    }
                }
            }
            DecodeState::Faulted => {
                self.stats.frames_discarded += 1;
                DecodeOutcome::Discarded
            }
            DecodeState::Configured => self.decode_configured(frame),
        }
    }

    fn decode_configured(&mut self, frame: &Frame) -> DecodeOutcome {
        match self.backend.decode(&frame.payload) {
            Ok(Some(image)) => {
                self.consecutive_errors = 0;
                self.stats.frames_decoded += 1;
                DecodeOutcome::Picture(image.with_timestamp(frame.timestamp_us))
            }
            Ok(None) => {
                self.consecutive_errors = 0;
                DecodeOutcome::Buffered
            }
            Err(e) => {
                debug!("Frame {} failed to decode: {}", frame.sequence, e);
                self.record_error()
            }
        }
    }

    fn record_error(&mut self) -> DecodeOutcome {
        self.stats.decode_errors += 1;
        self.consecutive_errors += 1;
        if self.state != DecodeState::Faulted
            && self.consecutive_errors >= self.config.error_threshold
        {
            self.state = DecodeState::Faulted;
            self.stats.faults += 1;
            warn!(
                "Decoder faulted after {} consecutive errors",
                self.consecutive_errors
            );
            return DecodeOutcome::Faulted;
        }
        DecodeOutcome::Failed
    }

    /// Current state
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Counters
    pub fn stats(&self) -> &DecodeStats {
        &self.stats
    }
}
