//! Decoded picture representation

use crate::error::{MediaError, MediaResult};
use camlink_core::Resolution;

/// A decoded planar 4:2:0 (I420) picture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I420Image {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Luma plane
    pub y: Vec<u8>,
    /// Cb plane
    pub u: Vec<u8>,
    /// Cr plane
    pub v: Vec<u8>,
    /// Bytes per luma row
    pub y_stride: usize,
    /// Bytes per chroma row
    pub uv_stride: usize,
    /// Presentation timestamp in microseconds
    pub timestamp_us: u64,
}

impl I420Image {
    /// Wrap planes, checking they are large enough for the given geometry
    pub fn new(
        width: u32,
        height: u32,
        y: Vec<u8>,
        u: Vec<u8>,
        v: Vec<u8>,
        y_stride: usize,
        uv_stride: usize,
    ) -> MediaResult<Self> {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));

        if y_stride < w || uv_stride < cw {
            return Err(MediaError::InvalidState {
                message: format!(
                    "stride {}/{} too small for {}x{}",
                    y_stride, uv_stride, width, height
                ),
            });
        }
        let y_needed = plane_len(y_stride, w, h);
        let uv_needed = plane_len(uv_stride, cw, ch);
        for (plane, needed) in [(&y, y_needed), (&u, uv_needed), (&v, uv_needed)] {
            if plane.len() < needed {
                return Err(MediaError::InvalidFrameData {
                    expected: needed,
                    actual: plane.len(),
                });
            }
        }

        Ok(Self {
            width,
            height,
            y,
            u,
            v,
            y_stride,
            uv_stride,
            timestamp_us: 0,
        })
    }

    /// Copy tightly packed planes out of strided decoder buffers
    pub fn from_strided(
        width: u32,
        height: u32,
        planes: (&[u8], &[u8], &[u8]),
        strides: (usize, usize, usize),
    ) -> MediaResult<Self> {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let y = pack_plane(planes.0, strides.0, w, h)?;
        let u = pack_plane(planes.1, strides.1, cw, ch)?;
        let v = pack_plane(planes.2, strides.2, cw, ch)?;
        Self::new(width, height, y, u, v, w, cw)
    }

    /// Solid black picture (BT.601 limited range)
    pub fn black(width: u32, height: u32) -> Self {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        Self {
            width,
            height,
            y: vec![16; w * h],
            u: vec![128; cw * ch],
            v: vec![128; cw * ch],
            y_stride: w,
            uv_stride: cw,
            timestamp_us: 0,
        }
    }

    /// Attach a presentation timestamp
    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// Picture dimensions
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

fn plane_len(stride: usize, width: usize, rows: usize) -> usize {
    if rows == 0 {
        0
    } else {
        stride * (rows - 1) + width
    }
}

fn pack_plane(src: &[u8], stride: usize, width: usize, rows: usize) -> MediaResult<Vec<u8>> {
    let needed = plane_len(stride, width, rows);
    if src.len() < needed || stride < width {
        return Err(MediaError::InvalidFrameData {
            expected: needed,
            actual: src.len(),
        });
    }
    let mut out = Vec::with_capacity(width * rows);
    for row in 0..rows {
        let start = row * stride;
        out.extend_from_slice(&src[start..start + width]);
    }
    Ok(out)
}
