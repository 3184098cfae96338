//! # camlink Media
//!
//! H.264 decoding and virtual camera output for the camlink bridge.
//! Frames released by the sequencer are decoded on a dedicated thread,
//! converted from I420 to YUYV and written to a v4l2loopback device on a
//! second thread, with bounded queues between the stages.

#![warn(clippy::all)]

pub mod backend;
pub mod convert;
pub mod decoder;
pub mod error;
pub mod image;
pub mod nal;
pub mod pipeline;
pub mod queue;
pub mod sink;
pub mod writer;

// Re-export main types
pub use backend::{MediaBackend, SystemMediaBackend};
pub use convert::{black_yuyv, i420_to_yuyv, yuyv_frame_size};
#[cfg(feature = "h264")]
pub use decoder::OpenH264Backend;
pub use decoder::{
    DecodeConfig, DecodeOutcome, DecodePipeline, DecodeState, DecodeStats, H264Backend,
};
pub use error::{ErrorCategory, MediaError, MediaResult};
pub use image::I420Image;
pub use pipeline::{MediaPipeline, PipelineEvent, PipelineEventKind, PipelineStats};
pub use queue::{Droppable, PushOutcome, StageQueue};
pub use sink::{platform_sink, MemorySink, MemorySinkState, NullSink, VideoSink};
pub use writer::{DeviceWriter, WriterConfig, WriterStats};
