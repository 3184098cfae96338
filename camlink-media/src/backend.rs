//! Factories for decoders and output sinks

use crate::decoder::H264Backend;
use crate::error::MediaResult;
use crate::sink::{platform_sink, VideoSink};
use crate::writer::WriterConfig;

/// Creates the per-stream media resources
///
/// Decoders are created on the decode thread, so they need not be `Send`.
pub trait MediaBackend: Send + Sync {
    /// New decoder instance
    fn create_decoder(&self) -> MediaResult<Box<dyn H264Backend>>;

    /// New output sink; must not open the device yet
    fn create_sink(&self, config: &WriterConfig) -> MediaResult<Box<dyn VideoSink>>;
}

/// openh264 decoding and the platform sink
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMediaBackend;

impl MediaBackend for SystemMediaBackend {
    fn create_decoder(&self) -> MediaResult<Box<dyn H264Backend>> {
        #[cfg(feature = "h264")]
        {
            Ok(Box::new(crate::decoder::OpenH264Backend::new()?))
        }
        #[cfg(not(feature = "h264"))]
        {
            Err(crate::error::MediaError::CodecInitializationFailed {
                codec: "H.264".to_string(),
                reason: "built without the h264 feature".to_string(),
            })
        }
    }

    fn create_sink(&self, config: &WriterConfig) -> MediaResult<Box<dyn VideoSink>> {
        Ok(platform_sink(config.device_path.as_deref()))
    }
}
