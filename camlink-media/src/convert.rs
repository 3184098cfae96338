//! Pixel format conversion for the output device

use crate::image::I420Image;

/// Bytes per YUYV row; pixels are packed in pairs
pub fn yuyv_stride(width: u32) -> usize {
    (width as usize).div_ceil(2) * 4
}

/// Size of one YUYV frame in bytes
pub fn yuyv_frame_size(width: u32, height: u32) -> usize {
    yuyv_stride(width) * height as usize
}

/// Convert planar I420 to packed YUYV (4:2:2)
///
/// Each output pair is `Y0 U Y1 V`. Chroma rows are shared by two luma rows,
/// so the vertical 2:1 subsampling is undone by repetition. An odd final
/// column repeats its luma sample.
pub fn i420_to_yuyv(image: &I420Image) -> Vec<u8> {
    let mut out = vec![0u8; yuyv_frame_size(image.width, image.height)];
    i420_to_yuyv_into(image, &mut out);
    out
}

/// Convert into an existing buffer of [`yuyv_frame_size`] bytes
///
/// An empty picture leaves `out` untouched.
pub fn i420_to_yuyv_into(image: &I420Image, out: &mut [u8]) {
    if image.width == 0 || image.height == 0 {
        return;
    }
    let width = image.width as usize;
    let stride = yuyv_stride(image.width);

    for (row, dst) in out
        .chunks_exact_mut(stride)
        .take(image.height as usize)
        .enumerate()
    {
        let y_row = &image.y[row * image.y_stride..];
        let u_row = &image.u[(row / 2) * image.uv_stride..];
        let v_row = &image.v[(row / 2) * image.uv_stride..];

        for (pair, px) in dst.chunks_exact_mut(4).enumerate() {
            let x0 = pair * 2;
            let x1 = (x0 + 1).min(width - 1);
            px[0] = y_row[x0];
            px[1] = u_row[pair];
            px[2] = y_row[x1];
            px[3] = v_row[pair];
        }
    }
}

/// A black YUYV frame
pub fn black_yuyv(width: u32, height: u32) -> Vec<u8> {
    let mut out = vec![0u8; yuyv_frame_size(width, height)];
    for px in out.chunks_exact_mut(4) {
        px.copy_from_slice(&[16, 128, 16, 128]);
    }
    out
}
