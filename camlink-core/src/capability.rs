//! Capability registry and stream negotiation
//!
//! Holds the most recent [`CapabilitySet`] announced by the phone and checks
//! stream requests against it. Nothing is sent to the phone from here; a
//! request that fails validation never leaves the desktop.

use crate::error::NegotiationError;
use crate::protocol::{
    CameraDescriptor, CapabilitySet, Resolution, StreamRequest, StreamSettings, CODEC_H264,
};
use tracing::debug;

/// How a requested resolution is matched against a camera's list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionPolicy {
    /// Only resolutions the camera lists are accepted
    #[default]
    ExactMatch,
    /// Unlisted resolutions are replaced by the closest listed one
    Nearest,
}

/// Stream parameters that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedSettings {
    /// Camera to stream from
    pub camera_id: u32,
    /// Resolution the phone will encode at
    pub resolution: Resolution,
    /// Frame rate
    pub fps: u32,
    /// Bitrate in kbps
    pub bitrate: u32,
    /// Codec string sent to the phone
    pub codec: String,
}

impl NegotiatedSettings {
    /// Start request carrying these settings
    pub fn to_request(&self) -> StreamRequest {
        StreamRequest {
            camera_id: self.camera_id,
            resolution: self.resolution,
            fps: self.fps,
            bitrate: self.bitrate,
            codec: self.codec.clone(),
        }
    }
}

/// Stores announced capabilities and validates requests against them
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: Option<CapabilitySet>,
    policy: ResolutionPolicy,
}

impl CapabilityRegistry {
    /// Create an empty registry
    pub fn new(policy: ResolutionPolicy) -> Self {
        Self {
            capabilities: None,
            policy,
        }
    }

    /// Replace stored capabilities wholesale
    pub fn update(&mut self, capabilities: CapabilitySet) {
        debug!(
            "Capabilities updated: {} camera(s), codecs {:?}",
            capabilities.cameras.len(),
            capabilities.supported_codecs
        );
        self.capabilities = Some(capabilities);
    }

    /// Forget stored capabilities
    pub fn clear(&mut self) {
        self.capabilities = None;
    }

    /// Whether an announcement has been received
    pub fn is_known(&self) -> bool {
        self.capabilities.is_some()
    }

    /// Current capabilities, if announced
    pub fn capabilities(&self) -> Option<&CapabilitySet> {
        self.capabilities.as_ref()
    }

    /// Announced cameras
    pub fn cameras(&self) -> &[CameraDescriptor] {
        self.capabilities
            .as_ref()
            .map(|c| c.cameras.as_slice())
            .unwrap_or(&[])
    }

    /// Look up a camera by id
    pub fn camera(&self, camera_id: u32) -> Option<&CameraDescriptor> {
        self.capabilities.as_ref()?.camera(camera_id)
    }

    /// Whether a camera id was announced
    pub fn has_camera(&self, camera_id: u32) -> bool {
        self.camera(camera_id).is_some()
    }

    /// Active resolution policy
    pub fn policy(&self) -> ResolutionPolicy {
        self.policy
    }

    /// Validate a start request
    pub fn validate(&self, request: &StreamRequest) -> Result<NegotiatedSettings, NegotiationError> {
        let caps = self
            .capabilities
            .as_ref()
            .ok_or(NegotiationError::CapabilitiesUnknown)?;

        if !request.codec.eq_ignore_ascii_case(CODEC_H264) || !caps.supports_codec(&request.codec)
        {
            return Err(NegotiationError::UnsupportedCodec {
                codec: request.codec.clone(),
            });
        }

        let camera = caps
            .camera(request.camera_id)
            .ok_or(NegotiationError::UnknownCamera {
                camera_id: request.camera_id,
            })?;

        let resolution = self.match_resolution(camera, request.resolution)?;
        for max in [&camera.max_resolution, &caps.max_resolution] {
            if !resolution.fits_within(max) {
                return Err(NegotiationError::ResolutionExceedsMaximum {
                    width: resolution.width,
                    height: resolution.height,
                    max_width: max.width,
                    max_height: max.height,
                });
            }
        }

        if request.fps == 0 || request.fps > caps.max_fps {
            return Err(NegotiationError::InvalidFps {
                fps: request.fps,
                max: caps.max_fps,
            });
        }
        if request.bitrate == 0 || request.bitrate > caps.max_bitrate {
            return Err(NegotiationError::InvalidBitrate {
                bitrate: request.bitrate,
                max: caps.max_bitrate,
            });
        }

        Ok(NegotiatedSettings {
            camera_id: camera.id,
            resolution,
            fps: request.fps,
            bitrate: request.bitrate,
            codec: CODEC_H264.to_string(),
        })
    }

    /// Merge a partial update into `current` and validate the result
    pub fn validate_update(
        &self,
        current: &NegotiatedSettings,
        update: &StreamSettings,
    ) -> Result<NegotiatedSettings, NegotiationError> {
        let request = StreamRequest {
            camera_id: update.camera_id.unwrap_or(current.camera_id),
            resolution: update.resolution.unwrap_or(current.resolution),
            fps: update.fps.unwrap_or(current.fps),
            bitrate: update.bitrate.unwrap_or(current.bitrate),
            codec: current.codec.clone(),
        };
        self.validate(&request)
    }

    fn match_resolution(
        &self,
        camera: &CameraDescriptor,
        requested: Resolution,
    ) -> Result<Resolution, NegotiationError> {
        if camera.supports(&requested) {
            return Ok(requested);
        }
        let unsupported = NegotiationError::UnsupportedResolution {
            camera_id: camera.id,
            width: requested.width,
            height: requested.height,
        };
        match self.policy {
            ResolutionPolicy::ExactMatch => Err(unsupported),
            ResolutionPolicy::Nearest => camera
                .resolutions
                .iter()
                // min_by_key keeps the first of equal candidates
                .min_by_key(|r| r.pixels().abs_diff(requested.pixels()))
                .copied()
                .ok_or(unsupported),
        }
    }
}
