//! Encoded frames as they move from the transport into the pipeline

use crate::error::{CamLinkError, CoreResult};
use crate::protocol::{FrameHeader, FrameType};
use bytes::Bytes;

/// An encoded H.264 access unit with its header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind
    pub frame_type: FrameType,
    /// Per-session sequence number
    pub sequence: u64,
    /// Presentation timestamp in microseconds
    pub timestamp_us: u64,
    /// Annex B encoded bytes
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame directly
    pub fn new(frame_type: FrameType, sequence: u64, timestamp_us: u64, payload: Bytes) -> Self {
        Self {
            frame_type,
            sequence,
            timestamp_us,
            payload,
        }
    }

    /// Pair a header with its bulk payload, rejecting size mismatches
    pub fn from_header(header: &FrameHeader, payload: Bytes) -> CoreResult<Self> {
        if header.size != payload.len() as u64 {
            return Err(CamLinkError::InvalidFrame {
                sequence: header.sequence_number,
                reason: format!(
                    "header announces {} bytes, payload has {}",
                    header.size,
                    payload.len()
                ),
            });
        }
        if payload.is_empty() {
            return Err(CamLinkError::InvalidFrame {
                sequence: header.sequence_number,
                reason: "empty payload".to_string(),
            });
        }
        Ok(Self::new(
            header.frame_type,
            header.sequence_number,
            header.timestamp_us,
            payload,
        ))
    }

    /// Header describing this frame
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            frame_type: self.frame_type,
            timestamp_us: self.timestamp_us,
            sequence_number: self.sequence,
            size: self.payload.len() as u64,
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
