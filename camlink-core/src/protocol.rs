//! Camera wire protocol
//!
//! Every control message is a JSON [`Packet`] whose `type` selects one of the
//! camera bodies below. Encoded frame bytes do not travel inside the JSON: a
//! [`FrameHeader`] packet announces `payloadSize` and the transport delivers the
//! bytes on its bulk channel alongside the header.

use crate::error::{CamLinkError, CoreResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Capability announcement (phone to desktop)
pub const PACKET_TYPE_CAMERA_CAPABILITY: &str = "cconnect.camera.capability";
/// Start request (desktop to phone)
pub const PACKET_TYPE_CAMERA_START: &str = "cconnect.camera.start";
/// Stop request (desktop to phone)
pub const PACKET_TYPE_CAMERA_STOP: &str = "cconnect.camera.stop";
/// Settings update or keyframe request (desktop to phone)
pub const PACKET_TYPE_CAMERA_SETTINGS: &str = "cconnect.camera.settings";
/// Frame header (phone to desktop)
pub const PACKET_TYPE_CAMERA_FRAME: &str = "cconnect.camera.frame";
/// Status report (phone to desktop)
pub const PACKET_TYPE_CAMERA_STATUS: &str = "cconnect.camera.status";

/// Codec identifier for H.264/AVC, the only codec the bridge accepts
pub const CODEC_H264: &str = "h264";

/// JSON packet envelope shared by all camera messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Packet id (milliseconds since the Unix epoch at creation)
    pub id: i64,
    /// Packet type string, one of the `PACKET_TYPE_CAMERA_*` constants
    #[serde(rename = "type")]
    pub packet_type: String,
    /// Type-specific body
    pub body: Value,
    /// Size of the bulk payload that follows, if any
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none", default)]
    pub payload_size: Option<i64>,
}

impl Packet {
    /// Create a packet with the current time as id
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        let id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
        }
    }

    /// Attach a bulk payload size
    pub fn with_payload_size(mut self, size: i64) -> Self {
        self.payload_size = Some(size);
        self
    }

    /// Whether this packet belongs to the camera protocol
    pub fn is_camera_packet(&self) -> bool {
        self.packet_type.starts_with("cconnect.camera.")
    }

    /// Serialize to the newline-terminated wire form
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Parse from the wire form, tolerating a trailing newline
    pub fn from_bytes(data: &[u8]) -> CoreResult<Self> {
        let trimmed = data.strip_suffix(b"\n").unwrap_or(data);
        Ok(serde_json::from_slice(trimmed)?)
    }

    /// Decode the body as a typed camera message
    pub fn body_as<T: PacketBody>(&self) -> CoreResult<T> {
        T::from_packet(self)
    }
}

/// A typed packet body bound to one packet type string
pub trait PacketBody: Serialize + DeserializeOwned {
    /// Packet type carried by this body
    const PACKET_TYPE: &'static str;

    /// Parse from a packet, checking the type string
    fn from_packet(packet: &Packet) -> CoreResult<Self> {
        if packet.packet_type != Self::PACKET_TYPE {
            return Err(CamLinkError::UnexpectedPacketType {
                packet_type: packet.packet_type.clone(),
            });
        }
        serde_json::from_value(packet.body.clone()).map_err(|e| CamLinkError::InvalidPacket {
            packet_type: packet.packet_type.clone(),
            reason: e.to_string(),
        })
    }

    /// Wrap into a packet
    fn to_packet(&self) -> CoreResult<Packet> {
        Ok(Packet::new(Self::PACKET_TYPE, serde_json::to_value(self)?))
    }
}

/// Video resolution in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Resolution {
    /// Create a resolution
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// 854x480
    pub const fn p480() -> Self {
        Self::new(854, 480)
    }

    /// 1280x720
    pub const fn p720() -> Self {
        Self::new(1280, 720)
    }

    /// 1920x1080
    pub const fn p1080() -> Self {
        Self::new(1920, 1080)
    }

    fn zero() -> Self {
        Self::new(0, 0)
    }

    /// Total pixel count
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether both dimensions fit inside `max`
    pub fn fits_within(&self, max: &Resolution) -> bool {
        self.width <= max.width && self.height <= max.height
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Camera facing direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    /// Selfie camera
    Front,
    /// Main camera
    #[default]
    Back,
    /// External camera attached to the phone
    External,
}

/// Drop priority of a frame when a stage queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FramePriority {
    /// May be dropped under backpressure
    Low,
    /// Must never be dropped silently
    Critical,
}

/// Kind of encoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    /// SPS/PPS decoder configuration
    #[serde(rename = "sps_pps")]
    ConfigData,
    /// IDR frame, decodable on its own
    #[serde(rename = "iframe")]
    KeyFrame,
    /// Frame that depends on earlier frames
    #[serde(rename = "pframe")]
    DeltaFrame,
}

impl FrameType {
    /// Map the single-byte frame type code used by binary framings
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::ConfigData),
            0x02 => Some(Self::KeyFrame),
            0x03 => Some(Self::DeltaFrame),
            _ => None,
        }
    }

    /// Single-byte frame type code
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::ConfigData => 0x01,
            Self::KeyFrame => 0x02,
            Self::DeltaFrame => 0x03,
        }
    }

    /// Whether this frame can start or restart decoding
    pub fn is_recovery_point(&self) -> bool {
        matches!(self, Self::ConfigData | Self::KeyFrame)
    }

    /// Drop priority under backpressure
    pub fn priority(&self) -> FramePriority {
        match self {
            Self::ConfigData | Self::KeyFrame => FramePriority::Critical,
            Self::DeltaFrame => FramePriority::Low,
        }
    }

    /// Whether a full queue may evict this frame
    pub fn can_drop(&self) -> bool {
        self.priority() == FramePriority::Low
    }
}

/// Streaming status reported by the phone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingStatus {
    /// Camera is opening
    Starting,
    /// Frames are flowing
    Streaming,
    /// Camera is closing
    Stopping,
    /// Camera is closed
    Stopped,
    /// Camera failed; see `error`
    Error,
}

/// One camera on the phone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraDescriptor {
    /// Camera id
    pub id: u32,
    /// Display name
    pub name: String,
    /// Facing direction
    pub facing: CameraFacing,
    /// Largest resolution this camera produces
    #[serde(rename = "maxResolution")]
    pub max_resolution: Resolution,
    /// Resolutions this camera can stream
    pub resolutions: Vec<Resolution>,
}

impl CameraDescriptor {
    /// Whether the camera lists `resolution`
    pub fn supports(&self, resolution: &Resolution) -> bool {
        self.resolutions.contains(resolution)
    }
}

/// Capability announcement body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySet {
    /// Available cameras
    pub cameras: Vec<CameraDescriptor>,
    /// Codecs the phone can encode
    #[serde(rename = "supportedCodecs")]
    pub supported_codecs: Vec<String>,
    /// Whether the phone can stream audio (unused by the bridge)
    #[serde(rename = "audioSupported", default)]
    pub audio_supported: bool,
    /// Device-wide resolution ceiling
    #[serde(rename = "maxResolution")]
    pub max_resolution: Resolution,
    /// Bitrate ceiling in kbps
    #[serde(rename = "maxBitrate")]
    pub max_bitrate: u32,
    /// Frame rate ceiling
    #[serde(rename = "maxFps")]
    pub max_fps: u32,
}

impl CapabilitySet {
    /// Look up a camera by id
    pub fn camera(&self, camera_id: u32) -> Option<&CameraDescriptor> {
        self.cameras.iter().find(|c| c.id == camera_id)
    }

    /// Whether the phone advertises `codec` (case-insensitive)
    pub fn supports_codec(&self, codec: &str) -> bool {
        self.supported_codecs
            .iter()
            .any(|c| c.eq_ignore_ascii_case(codec))
    }
}

impl PacketBody for CapabilitySet {
    const PACKET_TYPE: &'static str = PACKET_TYPE_CAMERA_CAPABILITY;
}

/// Start request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    /// Camera to open
    #[serde(rename = "cameraId")]
    pub camera_id: u32,
    /// Requested resolution
    pub resolution: Resolution,
    /// Requested frame rate
    pub fps: u32,
    /// Requested bitrate in kbps
    pub bitrate: u32,
    /// Requested codec
    pub codec: String,
}

impl StreamRequest {
    /// 720p at 30 fps and 2 Mbps H.264
    pub fn hd(camera_id: u32) -> Self {
        Self {
            camera_id,
            resolution: Resolution::p720(),
            fps: 30,
            bitrate: 2000,
            codec: CODEC_H264.to_string(),
        }
    }
}

impl PacketBody for StreamRequest {
    const PACKET_TYPE: &'static str = PACKET_TYPE_CAMERA_START;
}

/// Stop request body (always `{}`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StopRequest {}

impl PacketBody for StopRequest {
    const PACKET_TYPE: &'static str = PACKET_TYPE_CAMERA_STOP;
}

/// Settings update body; absent fields keep their current value
///
/// A body with every field absent asks the phone's encoder for a keyframe.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Switch camera
    #[serde(rename = "cameraId", skip_serializing_if = "Option::is_none", default)]
    pub camera_id: Option<u32>,
    /// Change resolution
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resolution: Option<Resolution>,
    /// Change frame rate
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fps: Option<u32>,
    /// Change bitrate in kbps
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bitrate: Option<u32>,
    /// Torch on or off
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub flash: Option<bool>,
    /// Autofocus on or off
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub autofocus: Option<bool>,
}

impl StreamSettings {
    /// The all-absent keyframe request
    pub fn keyframe_request() -> Self {
        Self::default()
    }

    /// Switch to another camera
    pub fn switch_camera(camera_id: u32) -> Self {
        Self {
            camera_id: Some(camera_id),
            ..Default::default()
        }
    }

    /// Change resolution only
    pub fn change_resolution(resolution: Resolution) -> Self {
        Self {
            resolution: Some(resolution),
            ..Default::default()
        }
    }

    /// Whether every field is absent
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl PacketBody for StreamSettings {
    const PACKET_TYPE: &'static str = PACKET_TYPE_CAMERA_SETTINGS;
}

/// Frame header body; the payload arrives on the bulk channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Frame kind
    #[serde(rename = "frameType")]
    pub frame_type: FrameType,
    /// Presentation timestamp in microseconds
    #[serde(rename = "timestampUs")]
    pub timestamp_us: u64,
    /// Per-session sequence number
    #[serde(rename = "sequenceNumber")]
    pub sequence_number: u64,
    /// Payload length in bytes
    pub size: u64,
}

impl FrameHeader {
    /// Wrap into a packet announcing the payload size
    pub fn to_frame_packet(&self) -> CoreResult<Packet> {
        Ok(self.to_packet()?.with_payload_size(self.size as i64))
    }
}

impl PacketBody for FrameHeader {
    const PACKET_TYPE: &'static str = PACKET_TYPE_CAMERA_FRAME;
}

/// Status report body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Current streaming status
    pub status: StreamingStatus,
    /// Active camera
    #[serde(rename = "cameraId", default)]
    pub camera_id: u32,
    /// Active resolution
    #[serde(default = "Resolution::zero")]
    pub resolution: Resolution,
    /// Active frame rate
    #[serde(default)]
    pub fps: u32,
    /// Active bitrate in kbps
    #[serde(default)]
    pub bitrate: u32,
    /// Error text when `status` is `error`
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl StatusReport {
    /// Streaming with the given parameters
    pub fn streaming(camera_id: u32, resolution: Resolution, fps: u32, bitrate: u32) -> Self {
        Self {
            status: StreamingStatus::Streaming,
            camera_id,
            resolution,
            fps,
            bitrate,
            error: None,
        }
    }

    /// Bare status with no stream parameters
    pub fn bare(status: StreamingStatus) -> Self {
        Self {
            status,
            camera_id: 0,
            resolution: Resolution::zero(),
            fps: 0,
            bitrate: 0,
            error: None,
        }
    }

    /// Error with a message
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::bare(StreamingStatus::Error)
        }
    }
}

impl PacketBody for StatusReport {
    const PACKET_TYPE: &'static str = PACKET_TYPE_CAMERA_STATUS;
}
