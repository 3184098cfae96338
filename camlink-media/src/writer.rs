//! Virtual device writer
//!
//! Owns the output sink for one streaming session. The sink is configured
//! lazily from the first picture and reconfigured whenever the picture size
//! changes. On release the device is blanked with a black frame before it is
//! closed, so consumers never keep showing a frozen picture from a stream that
//! has ended.

use crate::convert::{black_yuyv, i420_to_yuyv_into, yuyv_frame_size};
use crate::error::{MediaError, MediaResult};
use crate::image::I420Image;
use crate::sink::VideoSink;
use camlink_core::Resolution;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Writer tuning
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// v4l2loopback device node; `None` discards output
    pub device_path: Option<PathBuf>,
    /// Longest a picture may wait for the sink before it is dropped
    pub write_timeout: Duration,
    /// Pictures the write stage may queue
    pub queue_capacity: usize,
    /// Write a black frame before closing the sink
    pub blank_on_release: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            device_path: Some(PathBuf::from("/dev/video10")),
            write_timeout: Duration::from_millis(200),
            queue_capacity: 2,
            blank_on_release: true,
        }
    }
}

/// Writer counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Frames the sink accepted
    pub frames_written: u64,
    /// Frames the sink rejected
    pub write_errors: u64,
    /// Frames dropped for waiting too long or finding the device busy
    pub frames_dropped: u64,
    /// Sink (re)configurations
    pub reconfigurations: u64,
}

/// Converts pictures to YUYV and writes them to a sink
pub struct DeviceWriter {
    sink: Box<dyn VideoSink>,
    config: WriterConfig,
    resolution: Option<Resolution>,
    buffer: Vec<u8>,
    released: bool,
    stats: WriterStats,
}

impl DeviceWriter {
    /// Wrap a sink; nothing is opened until the first picture
    pub fn new(sink: Box<dyn VideoSink>, config: WriterConfig) -> Self {
        Self {
            sink,
            config,
            resolution: None,
            buffer: Vec::new(),
            released: false,
            stats: WriterStats::default(),
        }
    }

    /// Write one picture
    ///
    /// Returns [`MediaError::DeviceConfigurationFailed`] when the sink cannot
    /// take the picture's format; that error is fatal for the session. Other
    /// errors only cost the current frame.
    pub fn write(&mut self, image: &I420Image) -> MediaResult<()> {
        if self.released {
            return Err(MediaError::InvalidState {
                message: "device writer already released".to_string(),
            });
        }

        let resolution = image.resolution();
        if self.resolution != Some(resolution) {
            self.reconfigure(resolution)?;
        }

        i420_to_yuyv_into(image, &mut self.buffer);
        match self.sink.write_frame(&self.buffer) {
            Ok(()) => {
                self.stats.frames_written += 1;
                Ok(())
            }
            Err(e @ MediaError::DeviceBusy { .. }) => {
                self.stats.frames_dropped += 1;
                Err(e)
            }
            Err(e) => {
                self.stats.write_errors += 1;
                debug!("Write to {} failed: {}", self.sink.describe(), e);
                Err(e)
            }
        }
    }

    fn reconfigure(&mut self, resolution: Resolution) -> MediaResult<()> {
        match self.resolution {
            Some(previous) => info!(
                "Reconfiguring {} from {} to {}",
                self.sink.describe(),
                previous,
                resolution
            ),
            None => info!("Configuring {} for YUYV {}", self.sink.describe(), resolution),
        }
        self.resolution = None;
        self.sink
            .configure(resolution)
            .map_err(|e| match e {
                MediaError::DeviceConfigurationFailed { .. } => e,
                other => MediaError::DeviceConfigurationFailed {
                    device: self.sink.describe(),
                    reason: other.to_string(),
                },
            })?;
        self.resolution = Some(resolution);
        self.buffer = vec![0u8; yuyv_frame_size(resolution.width, resolution.height)];
        self.stats.reconfigurations += 1;
        Ok(())
    }

    /// Count a picture that was dropped before reaching the sink
    pub fn record_dropped(&mut self) {
        self.stats.frames_dropped += 1;
    }

    /// Blank (if configured) and close the sink; safe to call repeatedly
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let (Some(resolution), true) = (self.resolution, self.config.blank_on_release) {
            if let Err(e) = self
                .sink
                .write_frame(&black_yuyv(resolution.width, resolution.height))
            {
                warn!("Failed to blank {}: {}", self.sink.describe(), e);
            }
        }
        if let Err(e) = self.sink.close() {
            warn!("Failed to close {}: {}", self.sink.describe(), e);
        }
        self.resolution = None;
        debug!("Device writer released");
    }

    /// Current sink resolution
    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    /// Write timeout from the configuration
    pub fn write_timeout(&self) -> Duration {
        self.config.write_timeout
    }

    /// Counters
    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }
}

impl Drop for DeviceWriter {
    fn drop(&mut self) {
        self.release();
    }
}
