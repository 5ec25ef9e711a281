//! openh264-backed codec channels
//!
//! Stand-ins for the SoC encoder/decoder: they take a slot from the same
//! pools, keep the same geometry rules and report a full output queue as
//! a timeout, but do the work synchronously inside `push`.

use std::collections::VecDeque;
use std::time::Duration;

use openh264::decoder::{Decoder as H264Decoder, DecoderConfig};
use openh264::encoder::{
    BitRate, Encoder as H264Encoder, EncoderConfig as H264Config, FrameRate, RateControlMode,
};
use openh264::formats::{YUVSlices, YUVSource};
use openh264::OpenH264API;
use tracing::{debug, info, trace};

use super::pool::{ChannelPool, ChannelSlot, DECODE_POOL, ENCODE_POOL};
use super::{CodecChannelConfig, EncodedOutput, HardwareCodecChannel};
use crate::error::{AppError, Result};
use crate::video::convert::{PixelConverter, Yuv420pBuffer};
use crate::video::format::{CodecType, PixelFormat, Resolution};
use crate::video::frame::Image;
use crate::video::nal;

/// Output units a channel buffers before push reports a timeout
const QUEUE_DEPTH: usize = 4;

fn h265_unsupported() -> AppError {
    AppError::NotImplemented("H.265 is not available on the software codec".to_string())
}

pub struct SoftwareEncodeChannel {
    pool: &'static ChannelPool,
    slot: Option<ChannelSlot<'static>>,
    config: Option<CodecChannelConfig>,
    encoder: Option<H264Encoder>,
    converter: Option<PixelConverter>,
    queue: VecDeque<EncodedOutput>,
    frames: u64,
}

// SAFETY: the openh264 handle is only reached through `&mut self`, so it
// is never used from two threads at once.
unsafe impl Send for SoftwareEncodeChannel {}

impl SoftwareEncodeChannel {
    pub fn new() -> Self {
        Self::with_pool(&ENCODE_POOL)
    }

    pub fn with_pool(pool: &'static ChannelPool) -> Self {
        Self {
            pool,
            slot: None,
            config: None,
            encoder: None,
            converter: None,
            queue: VecDeque::with_capacity(QUEUE_DEPTH),
            frames: 0,
        }
    }

    fn to_i420<'a>(&'a mut self, image: &'a Image) -> Result<&'a [u8]> {
        match self.converter.as_mut() {
            Some(converter) => converter.convert(image.data()),
            None => Ok(image.data()),
        }
    }
}

impl Default for SoftwareEncodeChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareCodecChannel for SoftwareEncodeChannel {
    type Input = Image;
    type Output = EncodedOutput;

    fn channel_id(&self) -> Option<u32> {
        self.slot.as_ref().map(ChannelSlot::id)
    }

    fn open(&mut self, config: &CodecChannelConfig) -> Result<()> {
        if self.is_open() {
            return Err(AppError::Busy("encode channel is already open".to_string()));
        }
        if config.codec == CodecType::H265 {
            return Err(h265_unsupported());
        }
        config.validate_encode()?;
        let converter = match config.pixel_format {
            PixelFormat::Nv21 => Some(PixelConverter::nv21_to_yuv420p(config.resolution())?),
            PixelFormat::Yuv420p => None,
            other => {
                return Err(AppError::Config(format!(
                    "Encoder input must be NV21 or YUV420P, got {}",
                    other
                )))
            }
        };

        let slot = self.pool.acquire()?;
        let h264_config = H264Config::new()
            .bitrate(BitRate::from_bps(config.bitrate))
            .max_frame_rate(FrameRate::from_hz(config.input_fps as f32))
            .rate_control_mode(RateControlMode::Bitrate)
            // every pushed frame must come back as a packet
            .skip_frames(false);
        let encoder = H264Encoder::with_api_config(OpenH264API::from_source(), h264_config)
            .map_err(|e| AppError::Runtime(format!("Failed to create H.264 encoder: {}", e)))?;

        info!(
            "Encode channel {} opened: {} {} {}bps gop {}",
            slot.id(),
            config.resolution(),
            config.pixel_format,
            config.bitrate,
            config.gop
        );
        self.slot = Some(slot);
        self.encoder = Some(encoder);
        self.converter = converter;
        self.config = Some(config.clone());
        self.frames = 0;
        Ok(())
    }

    fn push(&mut self, image: &Image, _timeout: Duration) -> Result<()> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| AppError::NotOpen("encode channel".to_string()))?;
        if !config.matches(image) {
            return Err(AppError::Config(format!(
                "Frame {} {} does not match channel {} {}; reopen the channel",
                image.resolution(),
                image.format(),
                config.resolution(),
                config.pixel_format
            )));
        }
        if self.queue.len() >= QUEUE_DEPTH {
            return Err(AppError::Timeout(format!(
                "encode queue full ({} packets not popped)",
                self.queue.len()
            )));
        }

        let gop = config.gop.max(1) as u64;
        let force_idr = self.frames > 0 && self.frames % gop == 0;
        let frame_index = self.frames;
        self.frames += 1;

        let resolution = config.resolution();
        let w = resolution.width as usize;
        let h = resolution.height as usize;
        let y_size = w * h;
        let c_size = y_size / 4;

        let i420 = self.to_i420(image)?.to_vec();
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| AppError::NotOpen("encode channel".to_string()))?;
        if force_idr {
            encoder.force_intra_frame();
        }
        let yuv = YUVSlices::new(
            (
                &i420[..y_size],
                &i420[y_size..y_size + c_size],
                &i420[y_size + c_size..y_size + 2 * c_size],
            ),
            (w, h),
            (w, w / 2, w / 2),
        );
        let bitstream = encoder
            .encode(&yuv)
            .map_err(|e| AppError::Runtime(format!("H.264 encode failed: {}", e)))?;
        let output = EncodedOutput::from_annexb(&bitstream.to_vec(), resolution);

        trace!(
            "Encoded frame {}: {} fragments, {} bytes, key={}",
            frame_index,
            output.nalu_count(),
            output.len(),
            output.key_frame
        );
        // rate control may skip a frame entirely
        if !output.is_empty() {
            self.queue.push_back(output);
        }
        Ok(())
    }

    fn pop(&mut self, _timeout: Duration) -> Result<Option<EncodedOutput>> {
        if !self.is_open() {
            return Err(AppError::NotOpen("encode channel".to_string()));
        }
        Ok(self.queue.pop_front())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(slot) = self.slot.take() {
            debug!(
                "Encode channel {} closed after {} frames ({} packets dropped)",
                slot.id(),
                self.frames,
                self.queue.len()
            );
        }
        self.encoder = None;
        self.converter = None;
        self.config = None;
        self.queue.clear();
        Ok(())
    }

    fn config(&self) -> Option<&CodecChannelConfig> {
        self.config.as_ref()
    }
}

impl Drop for SoftwareEncodeChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

pub struct SoftwareDecodeChannel {
    pool: &'static ChannelPool,
    slot: Option<ChannelSlot<'static>>,
    config: Option<CodecChannelConfig>,
    decoder: Option<H264Decoder>,
    /// Converter from I420 to the configured output, rebuilt on size change
    converter: Option<PixelConverter>,
    queue: VecDeque<Image>,
}

// SAFETY: see SoftwareEncodeChannel
unsafe impl Send for SoftwareDecodeChannel {}

impl SoftwareDecodeChannel {
    pub fn new() -> Self {
        Self::with_pool(&DECODE_POOL)
    }

    pub fn with_pool(pool: &'static ChannelPool) -> Self {
        Self {
            pool,
            slot: None,
            config: None,
            decoder: None,
            converter: None,
            queue: VecDeque::with_capacity(QUEUE_DEPTH),
        }
    }

    fn output_image(&mut self, i420: Yuv420pBuffer, format: PixelFormat) -> Result<Image> {
        let resolution = i420.resolution();
        if format == PixelFormat::Yuv420p {
            return Image::new(i420.into_vec(), resolution, format);
        }
        let rebuild = self
            .converter
            .as_ref()
            .map(|c| c.resolution() != resolution)
            .unwrap_or(true);
        if rebuild {
            debug!("Decode output now {} {}", resolution, format);
            self.converter = Some(PixelConverter::new(PixelFormat::Yuv420p, format, resolution)?);
        }
        let converter = self
            .converter
            .as_mut()
            .ok_or_else(|| AppError::Runtime("decode converter missing".to_string()))?;
        let data = converter.convert(i420.as_bytes())?.to_vec();
        Image::new(data, resolution, format)
    }
}

impl Default for SoftwareDecodeChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareCodecChannel for SoftwareDecodeChannel {
    type Input = [u8];
    type Output = Image;

    fn channel_id(&self) -> Option<u32> {
        self.slot.as_ref().map(ChannelSlot::id)
    }

    fn open(&mut self, config: &CodecChannelConfig) -> Result<()> {
        if self.is_open() {
            return Err(AppError::Busy("decode channel is already open".to_string()));
        }
        if config.codec == CodecType::H265 {
            return Err(h265_unsupported());
        }
        if !matches!(
            config.pixel_format,
            PixelFormat::Nv21 | PixelFormat::Grayscale | PixelFormat::Yuv420p
        ) {
            return Err(AppError::UnsupportedFormat(format!(
                "Decoder cannot output {}",
                config.pixel_format
            )));
        }

        let slot = self.pool.acquire()?;
        let decoder = H264Decoder::with_api_config(OpenH264API::from_source(), DecoderConfig::new())
            .map_err(|e| AppError::Runtime(format!("Failed to create H.264 decoder: {}", e)))?;
        info!(
            "Decode channel {} opened, output {}",
            slot.id(),
            config.pixel_format
        );
        self.slot = Some(slot);
        self.decoder = Some(decoder);
        self.config = Some(config.clone());
        Ok(())
    }

    fn push(&mut self, data: &[u8], _timeout: Duration) -> Result<()> {
        let format = self
            .config
            .as_ref()
            .map(|c| c.pixel_format)
            .ok_or_else(|| AppError::NotOpen("decode channel".to_string()))?;
        if self.queue.len() >= QUEUE_DEPTH {
            return Err(AppError::Timeout(format!(
                "decode queue full ({} frames not popped)",
                self.queue.len()
            )));
        }

        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| AppError::NotOpen("decode channel".to_string()))?;
        let mut picture = None;
        for unit in nal::split_annexb(data) {
            let annexb = nal::to_annexb([unit]);
            let decoded = decoder
                .decode(&annexb)
                .map_err(|e| AppError::Runtime(format!("H.264 decode failed: {}", e)))?;
            if let Some(yuv) = decoded {
                let (w, h) = yuv.dimensions();
                let mut buffer = Yuv420pBuffer::new(Resolution::new(w as u32, h as u32));
                buffer.copy_from_strided(yuv.y(), yuv.u(), yuv.v(), yuv.strides())?;
                picture = Some(buffer);
            }
        }

        if let Some(buffer) = picture {
            trace!("Decoded picture {}", buffer.resolution());
            let image = self.output_image(buffer, format)?;
            self.queue.push_back(image);
        }
        Ok(())
    }

    fn pop(&mut self, _timeout: Duration) -> Result<Option<Image>> {
        if !self.is_open() {
            return Err(AppError::NotOpen("decode channel".to_string()));
        }
        Ok(self.queue.pop_front())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(slot) = self.slot.take() {
            debug!("Decode channel {} closed", slot.id());
        }
        self.decoder = None;
        self.converter = None;
        self.config = None;
        self.queue.clear();
        Ok(())
    }

    fn config(&self) -> Option<&CodecChannelConfig> {
        self.config.as_ref()
    }
}

impl Drop for SoftwareDecodeChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
