//! Pixel format conversion
//!
//! Software conversions between the camera's NV21 layout, the codec's
//! planar I420 layout and grayscale. All routines require even dimensions.

use crate::error::{AppError, Result};
use crate::video::format::{PixelFormat, Resolution};

/// YUV420P (I420) buffer with separate Y, U, V planes
pub struct Yuv420pBuffer {
    data: Vec<u8>,
    resolution: Resolution,
    u_offset: usize,
    v_offset: usize,
}

impl Yuv420pBuffer {
    pub fn new(resolution: Resolution) -> Self {
        let y_size = resolution.pixels() as usize;
        let uv_size = y_size / 4;
        Self {
            data: vec![0u8; y_size + uv_size * 2],
            resolution,
            u_offset: y_size,
            v_offset: y_size + uv_size,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn y_plane(&self) -> &[u8] {
        &self.data[..self.u_offset]
    }

    pub fn u_plane(&self) -> &[u8] {
        &self.data[self.u_offset..self.v_offset]
    }

    pub fn v_plane(&self) -> &[u8] {
        &self.data[self.v_offset..]
    }

    /// Mutable (Y, U, V) planes at once
    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        let (y, uv) = self.data.split_at_mut(self.u_offset);
        let (u, v) = uv.split_at_mut(self.v_offset - self.u_offset);
        (y, u, v)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Pack strided planes (as handed out by a decoder) into this buffer
    pub fn copy_from_strided(
        &mut self,
        y: &[u8],
        u: &[u8],
        v: &[u8],
        strides: (usize, usize, usize),
    ) -> Result<()> {
        let w = self.resolution.width as usize;
        let h = self.resolution.height as usize;
        let (cw, ch) = (w / 2, h / 2);
        if strides.0 < w || strides.1 < cw || strides.2 < cw {
            return Err(AppError::Runtime(format!(
                "Plane strides {:?} smaller than {}x{}",
                strides, w, h
            )));
        }
        if y.len() < strides.0 * (h - 1) + w
            || u.len() < strides.1 * (ch - 1) + cw
            || v.len() < strides.2 * (ch - 1) + cw
        {
            return Err(AppError::Runtime("Decoded planes are truncated".to_string()));
        }

        let (dy, du, dv) = self.planes_mut();
        for row in 0..h {
            dy[row * w..(row + 1) * w].copy_from_slice(&y[row * strides.0..row * strides.0 + w]);
        }
        for row in 0..ch {
            du[row * cw..(row + 1) * cw].copy_from_slice(&u[row * strides.1..row * strides.1 + cw]);
            dv[row * cw..(row + 1) * cw].copy_from_slice(&v[row * strides.2..row * strides.2 + cw]);
        }
        Ok(())
    }
}

/// Reusable converter between two raw formats at a fixed resolution
pub struct PixelConverter {
    src_format: PixelFormat,
    dst_format: PixelFormat,
    resolution: Resolution,
    output_buffer: Vec<u8>,
}

impl PixelConverter {
    pub fn new(src_format: PixelFormat, dst_format: PixelFormat, resolution: Resolution) -> Result<Self> {
        if !resolution.is_valid() {
            return Err(AppError::Config(format!(
                "Resolution {} must be non-zero and even",
                resolution
            )));
        }
        let supported = matches!(
            (src_format, dst_format),
            (PixelFormat::Nv21, PixelFormat::Yuv420p)
                | (PixelFormat::Yuv420p, PixelFormat::Nv21)
                | (PixelFormat::Nv21, PixelFormat::Grayscale)
                | (PixelFormat::Yuv420p, PixelFormat::Grayscale)
        ) || src_format == dst_format;
        if !supported {
            return Err(AppError::UnsupportedFormat(format!(
                "Unsupported conversion: {} → {}",
                src_format, dst_format
            )));
        }
        Ok(Self {
            src_format,
            dst_format,
            resolution,
            output_buffer: vec![0u8; dst_format.frame_size(resolution)],
        })
    }

    pub fn nv21_to_yuv420p(resolution: Resolution) -> Result<Self> {
        Self::new(PixelFormat::Nv21, PixelFormat::Yuv420p, resolution)
    }

    pub fn yuv420p_to_nv21(resolution: Resolution) -> Result<Self> {
        Self::new(PixelFormat::Yuv420p, PixelFormat::Nv21, resolution)
    }

    pub fn yuv420p_to_gray(resolution: Resolution) -> Result<Self> {
        Self::new(PixelFormat::Yuv420p, PixelFormat::Grayscale, resolution)
    }

    /// Convert a frame and return a reference to the reused output buffer
    pub fn convert(&mut self, input: &[u8]) -> Result<&[u8]> {
        let expected = self.src_format.frame_size(self.resolution);
        if input.len() < expected {
            return Err(AppError::InvalidArgs(format!(
                "Input buffer too small: {} < {}",
                input.len(),
                expected
            )));
        }
        let input = &input[..expected];
        let y_size = self.resolution.pixels() as usize;

        match (self.src_format, self.dst_format) {
            (PixelFormat::Nv21, PixelFormat::Yuv420p) => {
                nv21_to_i420(input, &mut self.output_buffer, y_size);
            }
            (PixelFormat::Yuv420p, PixelFormat::Nv21) => {
                i420_to_nv21(input, &mut self.output_buffer, y_size);
            }
            (_, PixelFormat::Grayscale) => {
                // luma plane comes first in both 4:2:0 layouts
                self.output_buffer.copy_from_slice(&input[..y_size]);
            }
            _ => self.output_buffer.copy_from_slice(input),
        }
        Ok(&self.output_buffer)
    }

    pub fn output_len(&self) -> usize {
        self.output_buffer.len()
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn dst_format(&self) -> PixelFormat {
        self.dst_format
    }
}

fn nv21_to_i420(nv21: &[u8], i420: &mut [u8], y_size: usize) {
    let uv_size = y_size / 4;
    let (y, uv) = i420.split_at_mut(y_size);
    let (u, v) = uv.split_at_mut(uv_size);
    y.copy_from_slice(&nv21[..y_size]);
    // NV21 chroma is interleaved V,U
    for (i, pair) in nv21[y_size..].chunks_exact(2).enumerate() {
        v[i] = pair[0];
        u[i] = pair[1];
    }
}

fn i420_to_nv21(i420: &[u8], nv21: &mut [u8], y_size: usize) {
    let uv_size = y_size / 4;
    nv21[..y_size].copy_from_slice(&i420[..y_size]);
    let u = &i420[y_size..y_size + uv_size];
    let v = &i420[y_size + uv_size..y_size + uv_size * 2];
    for (i, pair) in nv21[y_size..].chunks_exact_mut(2).enumerate() {
        pair[0] = v[i];
        pair[1] = u[i];
    }
}

/// RGB to BT.601 YUV, clamped to 0..=255
pub fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = -0.14713 * r - 0.28886 * g + 0.436 * b + 128.0;
    let v = 0.615 * r - 0.51499 * g - 0.10001 * b + 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    (clamp(y), clamp(u), clamp(v))
}

pub fn yuv420p_buffer_size(resolution: Resolution) -> usize {
    PixelFormat::Yuv420p.frame_size(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nv21_4x2() -> Vec<u8> {
        // 8 luma bytes, then V0 U0 V1 U1
        vec![1, 2, 3, 4, 5, 6, 7, 8, 10, 20, 11, 21]
    }

    #[test]
    fn test_nv21_to_i420_and_back() {
        let res = Resolution::new(4, 2);
        let mut to_i420 = PixelConverter::nv21_to_yuv420p(res).unwrap();
        let i420 = to_i420.convert(&nv21_4x2()).unwrap().to_vec();
        assert_eq!(i420, vec![1, 2, 3, 4, 5, 6, 7, 8, 20, 21, 10, 11]);

        let mut back = PixelConverter::yuv420p_to_nv21(res).unwrap();
        assert_eq!(back.convert(&i420).unwrap(), nv21_4x2().as_slice());
    }

    #[test]
    fn test_gray_takes_luma() {
        let mut conv = PixelConverter::new(PixelFormat::Nv21, PixelFormat::Grayscale, Resolution::new(4, 2)).unwrap();
        assert_eq!(conv.convert(&nv21_4x2()).unwrap(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(conv.output_len(), 8);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(PixelConverter::new(PixelFormat::Rgb888, PixelFormat::Nv21, Resolution::VGA).is_err());
        assert!(PixelConverter::nv21_to_yuv420p(Resolution::new(3, 2)).is_err());
        let mut conv = PixelConverter::nv21_to_yuv420p(Resolution::new(4, 2)).unwrap();
        assert!(conv.convert(&[0; 4]).is_err());
    }

    #[test]
    fn test_copy_from_strided() {
        let mut buf = Yuv420pBuffer::new(Resolution::new(2, 2));
        let y = [1, 2, 0, 0, 3, 4];
        buf.copy_from_strided(&y, &[9], &[8], (4, 1, 1)).unwrap();
        assert_eq!(buf.as_bytes(), &[1, 2, 3, 4, 9, 8]);
        assert_eq!(buf.u_plane(), &[9]);
        assert_eq!(buf.v_plane(), &[8]);
    }

    #[test]
    fn test_rgb_to_yuv() {
        assert_eq!(rgb_to_yuv(255, 255, 255), (255, 128, 128));
        assert_eq!(rgb_to_yuv(0, 0, 0), (0, 128, 128));
    }
}
