//! Raw media buffers and images

use bytes::Bytes;

use super::format::{PixelFormat, Resolution};
use crate::error::{AppError, Result};

/// Who must release a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ownership {
    /// Caller owns the memory and drops it when done
    #[default]
    Caller,
    /// Borrowed from a driver/library ring; must be handed back through the
    /// producer's free call exactly once
    Library,
    /// Empty buffer, nothing to release
    None,
}

/// Ownership-tagged byte buffer holding one media unit
#[derive(Debug, Clone, Default)]
pub struct MediaBuffer {
    data: Bytes,
    ownership: Ownership,
}

impl MediaBuffer {
    pub fn new(data: Bytes, ownership: Ownership) -> Self {
        let ownership = if data.is_empty() { Ownership::None } else { ownership };
        Self { data, ownership }
    }

    pub fn owned(data: impl Into<Bytes>) -> Self {
        Self::new(data.into(), Ownership::Caller)
    }

    pub fn empty() -> Self {
        Self {
            data: Bytes::new(),
            ownership: Ownership::None,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Cheap clone of the underlying bytes
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }
}

/// A raw (pre-encode or decoded) picture
#[derive(Debug, Clone)]
pub struct Image {
    data: Vec<u8>,
    resolution: Resolution,
    format: PixelFormat,
    ownership: Ownership,
}

impl Image {
    /// Wrap a caller-owned pixel buffer, checking its size against the format
    pub fn new(data: Vec<u8>, resolution: Resolution, format: PixelFormat) -> Result<Self> {
        let expected = format.frame_size(resolution);
        if data.len() < expected {
            return Err(AppError::InvalidArgs(format!(
                "{} {} image needs {} bytes, got {}",
                resolution,
                format,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            data,
            resolution,
            format,
            ownership: Ownership::Caller,
        })
    }

    /// Zero-filled image (black luma, zero chroma for YUV)
    pub fn zeroed(resolution: Resolution, format: PixelFormat) -> Self {
        Self {
            data: vec![0; format.frame_size(resolution)],
            resolution,
            format,
            ownership: Ownership::Caller,
        }
    }

    /// Tag the image as borrowed from a hardware ring buffer
    pub fn borrowed(mut self) -> Self {
        self.ownership = Ownership::Library;
        self
    }

    /// Caller-owned copy, safe to keep after the source buffer is freed
    pub fn to_owned_image(&self) -> Self {
        Self {
            ownership: Ownership::Caller,
            ..self.clone()
        }
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// True when `other` would need a differently configured codec channel
    pub fn same_geometry(&self, resolution: Resolution, format: PixelFormat) -> bool {
        self.resolution == resolution && self.format == format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_size_check() {
        assert!(Image::new(vec![0; 10], Resolution::new(4, 4), PixelFormat::Nv21).is_err());
        let img = Image::new(vec![0; 24], Resolution::new(4, 4), PixelFormat::Nv21).unwrap();
        assert_eq!(img.data_size(), 24);
        assert_eq!(img.ownership(), Ownership::Caller);
        assert_eq!(img.borrowed().ownership(), Ownership::Library);
    }

    #[test]
    fn test_media_buffer_ownership() {
        assert_eq!(MediaBuffer::owned(vec![1u8, 2]).ownership(), Ownership::Caller);
        assert_eq!(MediaBuffer::owned(Vec::<u8>::new()).ownership(), Ownership::None);
        assert!(MediaBuffer::empty().is_empty());
    }
}
