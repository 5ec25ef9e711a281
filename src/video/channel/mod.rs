//! Codec channel abstraction
//!
//! A codec channel owns one encode or decode context bound to a slot of a
//! fixed-size [`ChannelPool`]. Input is pushed and output popped
//! separately so hardware backends can pipeline; the software backend in
//! [`software`] completes each push synchronously and queues the result.
//!
//! Geometry is fixed for the lifetime of an open channel. Callers that see
//! an input with a different size or format must `close()` and `open()`
//! again before pushing it.

pub mod pool;
pub mod software;

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::video::format::{CodecType, PixelFormat, Resolution};
use crate::video::frame::Image;
use crate::video::nal;

pub use pool::{ChannelPool, ChannelSlot, DECODE_POOL, ENCODE_POOL};
pub use software::{SoftwareDecodeChannel, SoftwareEncodeChannel};

/// Parameters identifying one channel instantiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecChannelConfig {
    pub width: u32,
    pub height: u32,
    /// Raw side format: encoder input or decoder output
    pub pixel_format: PixelFormat,
    pub codec: CodecType,
    /// Target bitrate in bps (encode only)
    pub bitrate: u32,
    /// Frames between IDR pictures (encode only)
    pub gop: u32,
    pub input_fps: u32,
    pub output_fps: u32,
}

impl CodecChannelConfig {
    pub fn encode(
        codec: CodecType,
        resolution: Resolution,
        pixel_format: PixelFormat,
        bitrate: u32,
        gop: u32,
        fps: u32,
    ) -> Self {
        Self {
            width: resolution.width,
            height: resolution.height,
            pixel_format,
            codec,
            bitrate,
            gop,
            input_fps: fps,
            output_fps: fps,
        }
    }

    /// Decoder config; a zero resolution means "learn it from the stream"
    pub fn decode(codec: CodecType, resolution: Resolution, pixel_format: PixelFormat) -> Self {
        Self {
            width: resolution.width,
            height: resolution.height,
            pixel_format,
            codec,
            bitrate: 0,
            gop: 0,
            input_fps: 0,
            output_fps: 0,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Same config with a different input geometry
    pub fn with_geometry(&self, resolution: Resolution, pixel_format: PixelFormat) -> Self {
        Self {
            width: resolution.width,
            height: resolution.height,
            pixel_format,
            ..self.clone()
        }
    }

    /// Whether `image` can be pushed without reinitializing the channel
    pub fn matches(&self, image: &Image) -> bool {
        image.same_geometry(self.resolution(), self.pixel_format)
    }

    /// Reject configurations no backend can honour
    pub fn validate_encode(&self) -> Result<()> {
        if !self.resolution().is_valid() {
            return Err(AppError::Config(format!(
                "Encoder resolution {} must be non-zero and even",
                self.resolution()
            )));
        }
        if self.bitrate == 0 {
            return Err(AppError::Config("Encoder bitrate must be positive".to_string()));
        }
        if self.input_fps == 0 {
            return Err(AppError::Config("Encoder frame rate must be positive".to_string()));
        }
        Ok(())
    }
}

/// One logical encoded packet, possibly made of several driver fragments
#[derive(Debug, Clone, Default)]
pub struct EncodedOutput {
    /// Fragments in stream order, each carrying its own Annex-B start code
    pub fragments: Vec<Bytes>,
    pub key_frame: bool,
    pub resolution: Resolution,
}

impl EncodedOutput {
    /// Build from an Annex-B buffer, one fragment per NAL unit
    pub fn from_annexb(data: &[u8], resolution: Resolution) -> Self {
        let nals = nal::split_annexb(data);
        let key_frame = nals.iter().any(|n| nal::h264_type(n) == nal::nal_type::IDR_SLICE);
        let fragments = nals
            .into_iter()
            .map(|n| {
                let mut buf = BytesMut::with_capacity(n.len() + nal::START_CODE.len());
                buf.extend_from_slice(&nal::START_CODE);
                buf.extend_from_slice(n);
                buf.freeze()
            })
            .collect();
        Self {
            fragments,
            key_frame,
            resolution,
        }
    }

    /// Fragment count; more than two means parameter sets rode along
    pub fn nalu_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.iter().all(|f| f.is_empty())
    }

    pub fn len(&self) -> usize {
        self.fragments.iter().map(Bytes::len).sum()
    }

    /// Concatenate fragments in order into one packet payload
    pub fn concat(&self) -> Bytes {
        if self.fragments.len() == 1 {
            return self.fragments[0].clone();
        }
        let mut out = BytesMut::with_capacity(self.len());
        for fragment in &self.fragments {
            out.extend_from_slice(fragment);
        }
        out.freeze()
    }
}

/// One encode or decode context
pub trait HardwareCodecChannel: Send {
    type Input: ?Sized;
    type Output;

    /// Slot index held in the pool, `None` while closed
    fn channel_id(&self) -> Option<u32>;

    /// Allocate the channel; `ResourceBusy` if the pool is exhausted
    fn open(&mut self, config: &CodecChannelConfig) -> Result<()>;

    /// Queue one input unit, waiting up to `timeout` for room
    fn push(&mut self, input: &Self::Input, timeout: Duration) -> Result<()>;

    /// Next output unit, `Ok(None)` if nothing is ready within `timeout`
    fn pop(&mut self, timeout: Duration) -> Result<Option<Self::Output>>;

    /// Hand a popped unit back to the driver
    fn free(&mut self, output: Self::Output) {
        drop(output);
    }

    /// Tear the channel down; calling it on a closed channel is a no-op
    fn close(&mut self) -> Result<()>;

    fn config(&self) -> Option<&CodecChannelConfig>;

    fn is_open(&self) -> bool {
        self.config().is_some()
    }
}

pub type EncodeChannel = dyn HardwareCodecChannel<Input = Image, Output = EncodedOutput>;
pub type DecodeChannel = dyn HardwareCodecChannel<Input = [u8], Output = Image>;

/// Creates encode channels; lets callers swap the backend
pub type EncodeChannelFactory = Arc<dyn Fn() -> Box<EncodeChannel> + Send + Sync>;
pub type DecodeChannelFactory = Arc<dyn Fn() -> Box<DecodeChannel> + Send + Sync>;

pub fn software_encode_factory() -> EncodeChannelFactory {
    Arc::new(|| Box::new(SoftwareEncodeChannel::new()) as Box<EncodeChannel>)
}

pub fn software_decode_factory() -> DecodeChannelFactory {
    Arc::new(|| Box::new(SoftwareDecodeChannel::new()) as Box<DecodeChannel>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_encoded_output_is_empty() {
        let output = EncodedOutput::default();
        assert!(output.is_empty());
        assert_eq!(output.nalu_count(), 0);
        assert_eq!(output.resolution, Resolution::new(0, 0));
        assert!(!output.resolution.is_valid());
    }

    #[test]
    fn test_encoded_output_fragments() {
        let data = [
            0, 0, 0, 1, 0x67, 0x42, 0, 0x1e, //
            0, 0, 0, 1, 0x68, 0xce, //
            0, 0, 1, 0x65, 0x88, 0x80,
        ];
        let out = EncodedOutput::from_annexb(&data, Resolution::VGA);
        assert_eq!(out.nalu_count(), 3);
        assert!(out.key_frame);
        assert_eq!(&out.fragments[2][..], &[0, 0, 0, 1, 0x65, 0x88, 0x80]);
        let joined = out.concat();
        assert_eq!(nal::nal_types(&joined), vec![7, 8, 5]);
        assert_eq!(joined.len(), out.len());
    }

    #[test]
    fn test_config_geometry() {
        let cfg = CodecChannelConfig::encode(
            CodecType::H264,
            Resolution::VGA,
            PixelFormat::Nv21,
            1_000_000,
            30,
            30,
        );
        assert!(cfg.validate_encode().is_ok());
        assert!(cfg.matches(&Image::zeroed(Resolution::VGA, PixelFormat::Nv21)));
        assert!(!cfg.matches(&Image::zeroed(Resolution::QVGA, PixelFormat::Nv21)));

        let moved = cfg.with_geometry(Resolution::QVGA, PixelFormat::Nv21);
        assert_eq!(moved.resolution(), Resolution::QVGA);
        assert_eq!(moved.bitrate, 1_000_000);

        let bad = cfg.with_geometry(Resolution::new(641, 480), PixelFormat::Nv21);
        assert!(matches!(bad.validate_encode(), Err(AppError::Config(_))));
    }
}
