//! Output sinks for converted frames
//!
//! A sink receives packed YUYV frames. The V4L2 loopback sink is the real
//! target on Linux; the null and memory sinks stand in where no device exists.

use crate::convert::yuyv_frame_size;
use crate::error::{MediaError, MediaResult};
use camlink_core::Resolution;
use parking_lot::Mutex;
use std::sync::Arc;

/// Destination for YUYV frames
pub trait VideoSink: Send {
    /// Open the device if needed and set its format to YUYV at `resolution`
    fn configure(&mut self, resolution: Resolution) -> MediaResult<()>;

    /// Write one frame of exactly `yuyv_frame_size` bytes
    fn write_frame(&mut self, data: &[u8]) -> MediaResult<()>;

    /// Release the device
    fn close(&mut self) -> MediaResult<()>;

    /// Device path or sink name for logs
    fn describe(&self) -> String;
}

/// Get the platform sink for a device path
pub fn platform_sink(device_path: Option<&std::path::Path>) -> Box<dyn VideoSink> {
    match device_path {
        #[cfg(target_os = "linux")]
        Some(path) => Box::new(v4l2::V4l2LoopbackSink::new(path)),
        #[cfg(not(target_os = "linux"))]
        Some(path) => {
            tracing::warn!(
                "V4L2 output is only available on Linux; discarding frames for {}",
                path.display()
            );
            Box::new(NullSink::default())
        }
        None => Box::new(NullSink::default()),
    }
}

#[cfg(target_os = "linux")]
pub mod v4l2 {
    //! v4l2loopback output device

    use super::VideoSink;
    use crate::convert::{yuyv_frame_size, yuyv_stride};
    use crate::error::{MediaError, MediaResult};
    use camlink_core::Resolution;
    use std::fs::{File, OpenOptions};
    use std::io::{ErrorKind, Write};
    use std::os::unix::fs::OpenOptionsExt;
    use std::path::{Path, PathBuf};
    use tracing::{debug, info};
    use v4l::format::FieldOrder;
    use v4l::video::Output;
    use v4l::{Device, Format, FourCC};

    /// Writes frames to a v4l2loopback device node
    ///
    /// The node is opened non-blocking: a write the device cannot take right
    /// away fails with [`MediaError::DeviceBusy`] instead of stalling.
    pub struct V4l2LoopbackSink {
        path: PathBuf,
        device: Option<Device>,
        output: Option<File>,
        frame_size: usize,
    }

    impl V4l2LoopbackSink {
        /// Sink for an existing device node such as `/dev/video10`
        pub fn new(path: impl AsRef<Path>) -> Self {
            Self {
                path: path.as_ref().to_path_buf(),
                device: None,
                output: None,
                frame_size: 0,
            }
        }

        fn config_error(&self, reason: impl std::fmt::Display) -> MediaError {
            MediaError::DeviceConfigurationFailed {
                device: self.path.display().to_string(),
                reason: reason.to_string(),
            }
        }
    }

    impl VideoSink for V4l2LoopbackSink {
        fn configure(&mut self, resolution: Resolution) -> MediaResult<()> {
            let device = match self.device.take() {
                Some(device) => device,
                None => Device::with_path(&self.path).map_err(|e| self.config_error(e))?,
            };

            let mut format = Format::new(resolution.width, resolution.height, FourCC::new(b"YUYV"));
            format.field_order = FieldOrder::Progressive;
            format.stride = yuyv_stride(resolution.width) as u32;
            format.size = yuyv_frame_size(resolution.width, resolution.height) as u32;

            let applied = Output::set_format(&device, &format).map_err(|e| self.config_error(e))?;
            if applied.fourcc != format.fourcc
                || applied.width != format.width
                || applied.height != format.height
            {
                return Err(self.config_error(format!(
                    "device applied {} {}x{} instead of YUYV {}",
                    applied.fourcc, applied.width, applied.height, resolution
                )));
            }
            debug!("{} format set to YUYV {}", self.path.display(), resolution);

            if self.output.is_none() {
                let file = OpenOptions::new()
                    .write(true)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(&self.path)
                    .map_err(|e| self.config_error(e))?;
                info!("Opened {} for output", self.path.display());
                self.output = Some(file);
            }
            self.device = Some(device);
            self.frame_size = yuyv_frame_size(resolution.width, resolution.height);
            Ok(())
        }

        fn write_frame(&mut self, data: &[u8]) -> MediaResult<()> {
            if data.len() != self.frame_size {
                return Err(MediaError::InvalidFrameData {
                    expected: self.frame_size,
                    actual: data.len(),
                });
            }
            let output = self.output.as_mut().ok_or_else(|| MediaError::InvalidState {
                message: format!("{} is not configured", self.path.display()),
            })?;
            output.write_all(data).map_err(|e| match e.kind() {
                ErrorKind::WouldBlock => MediaError::DeviceBusy {
                    device: self.path.display().to_string(),
                },
                _ => MediaError::DeviceWriteFailed {
                    device: self.path.display().to_string(),
                    reason: e.to_string(),
                },
            })
        }

        fn close(&mut self) -> MediaResult<()> {
            if self.output.take().is_some() {
                info!("Closed {}", self.path.display());
            }
            self.device = None;
            self.frame_size = 0;
            Ok(())
        }

        fn describe(&self) -> String {
            self.path.display().to_string()
        }
    }
}

/// Discards frames after checking their size
#[derive(Debug, Default)]
pub struct NullSink {
    frame_size: Option<usize>,
    frames: u64,
}

impl NullSink {
    /// Frames accepted so far
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl VideoSink for NullSink {
    fn configure(&mut self, resolution: Resolution) -> MediaResult<()> {
        self.frame_size = Some(yuyv_frame_size(resolution.width, resolution.height));
        Ok(())
    }

    fn write_frame(&mut self, data: &[u8]) -> MediaResult<()> {
        let expected = self.frame_size.ok_or_else(|| MediaError::InvalidState {
            message: "null sink is not configured".to_string(),
        })?;
        if data.len() != expected {
            return Err(MediaError::InvalidFrameData {
                expected,
                actual: data.len(),
            });
        }
        self.frames += 1;
        Ok(())
    }

    fn close(&mut self) -> MediaResult<()> {
        self.frame_size = None;
        Ok(())
    }

    fn describe(&self) -> String {
        "null".to_string()
    }
}

/// What a [`MemorySink`] has seen
#[derive(Debug, Default, Clone)]
pub struct MemorySinkState {
    /// Resolutions passed to `configure`, in order
    pub formats: Vec<Resolution>,
    /// Frames written, in order
    pub frames: Vec<Vec<u8>>,
    /// Number of `close` calls
    pub closes: u32,
}

/// Keeps written frames in memory, readable through a shared handle
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemorySink {
    /// Create a sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far
    pub fn snapshot(&self) -> MemorySinkState {
        self.state.lock().clone()
    }

    /// Last frame written
    pub fn last_frame(&self) -> Option<Vec<u8>> {
        self.state.lock().frames.last().cloned()
    }
}

impl VideoSink for MemorySink {
    fn configure(&mut self, resolution: Resolution) -> MediaResult<()> {
        self.state.lock().formats.push(resolution);
        Ok(())
    }

    fn write_frame(&mut self, data: &[u8]) -> MediaResult<()> {
        self.state.lock().frames.push(data.to_vec());
        Ok(())
    }

    fn close(&mut self) -> MediaResult<()> {
        self.state.lock().closes += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
