//! Encoded packets and decode contexts

use bytes::Bytes;

use super::format::{MediaType, Timebase};
use super::frame::{Image, MediaBuffer, Ownership};
use crate::audio::SampleFormat;

/// One encoded elementary-stream unit
///
/// `pts`/`dts`/`duration` are in the owning stream's time base.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub buffer: MediaBuffer,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub stream_index: usize,
    pub key_frame: bool,
}

impl Packet {
    pub fn new(data: Bytes, pts: i64, dts: i64, duration: i64) -> Self {
        Self {
            buffer: MediaBuffer::new(data, Ownership::Caller),
            pts,
            dts,
            duration,
            stream_index: 0,
            key_frame: false,
        }
    }

    /// Packet carrying no data, returned while the encoder pipeline fills
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_stream(mut self, stream_index: usize) -> Self {
        self.stream_index = stream_index;
        self
    }

    pub fn with_key_frame(mut self, key_frame: bool) -> Self {
        self.key_frame = key_frame;
        self
    }

    pub fn data(&self) -> &[u8] {
        self.buffer.data()
    }

    pub fn bytes(&self) -> Bytes {
        self.buffer.bytes()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Payload moved out of a [`Context`]
#[derive(Debug, Default)]
pub enum Payload {
    #[default]
    None,
    Image(Image),
    Pcm(Bytes),
    Raw(Bytes),
}

/// Result of one decode/unpack call
#[derive(Debug)]
pub struct Context {
    pub media_type: MediaType,
    pub timebase: Timebase,
    pub duration: i64,
    pub pts: i64,
    pub last_pts: i64,
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
    pub channels: u16,
    payload: Payload,
}

impl Context {
    /// Video context; `image` is None when the decoder had no frame ready yet
    pub fn video(
        image: Option<Image>,
        timebase: Timebase,
        pts: i64,
        last_pts: i64,
        duration: i64,
    ) -> Self {
        Self {
            media_type: MediaType::Video,
            timebase,
            duration,
            pts,
            last_pts,
            sample_rate: 0,
            sample_format: SampleFormat::S16Le,
            channels: 0,
            payload: image.map(Payload::Image).unwrap_or_default(),
        }
    }

    pub fn audio(
        pcm: Bytes,
        timebase: Timebase,
        pts: i64,
        duration: i64,
        sample_rate: u32,
        channels: u16,
    ) -> Self {
        Self {
            media_type: MediaType::Audio,
            timebase,
            duration,
            pts,
            last_pts: 0,
            sample_rate,
            sample_format: SampleFormat::S16Le,
            channels,
            payload: Payload::Pcm(pcm),
        }
    }

    /// Still-encoded elementary data (see `Decoder::unpack`)
    pub fn raw(media_type: MediaType, data: Bytes, timebase: Timebase, pts: i64, duration: i64) -> Self {
        Self {
            media_type,
            timebase,
            duration,
            pts,
            last_pts: 0,
            sample_rate: 0,
            sample_format: SampleFormat::S16Le,
            channels: 0,
            payload: Payload::Raw(data),
        }
    }

    pub fn with_last_pts(mut self, last_pts: i64) -> Self {
        self.last_pts = last_pts;
        self
    }

    pub fn with_audio_info(mut self, sample_rate: u32, channels: u16) -> Self {
        self.sample_rate = sample_rate;
        self.channels = channels;
        self
    }

    pub fn has_image(&self) -> bool {
        matches!(self.payload, Payload::Image(_))
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Move the image out; later calls return None
    pub fn take_image(&mut self) -> Option<Image> {
        match std::mem::take(&mut self.payload) {
            Payload::Image(img) => Some(img),
            other => {
                self.payload = other;
                None
            }
        }
    }

    pub fn take_pcm(&mut self) -> Option<Bytes> {
        match std::mem::take(&mut self.payload) {
            Payload::Pcm(pcm) => Some(pcm),
            other => {
                self.payload = other;
                None
            }
        }
    }

    pub fn take_raw_data(&mut self) -> Option<Bytes> {
        match std::mem::take(&mut self.payload) {
            Payload::Raw(raw) => Some(raw),
            other => {
                self.payload = other;
                None
            }
        }
    }

    pub fn duration_us(&self) -> i64 {
        self.timebase.to_us(self.duration)
    }

    pub fn pts_seconds(&self) -> f64 {
        self.timebase.to_seconds(self.pts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::{PixelFormat, Resolution};

    #[test]
    fn test_take_image_once() {
        let img = Image::zeroed(Resolution::new(4, 4), PixelFormat::Nv21);
        let mut ctx = Context::video(Some(img), Timebase::new(1, 30), 3, 2, 1);
        assert!(ctx.take_pcm().is_none());
        assert!(ctx.take_image().is_some());
        assert!(ctx.take_image().is_none());
        assert_eq!(ctx.duration_us(), 33_333);
    }

    #[test]
    fn test_take_pcm_and_raw() {
        let mut ctx = Context::audio(Bytes::from_static(&[1, 2]), Timebase::new(1, 48000), 0, 1024, 48000, 1);
        assert_eq!(ctx.take_pcm().unwrap().len(), 2);
        let mut raw = Context::raw(MediaType::Video, Bytes::from_static(&[0, 0, 1]), Timebase::MILLIS, 0, 0);
        assert!(raw.take_image().is_none());
        assert_eq!(raw.take_raw_data().unwrap().len(), 3);
    }

    #[test]
    fn test_empty_packet() {
        let p = Packet::empty();
        assert!(p.is_empty());
        let p = Packet::new(Bytes::from_static(&[1]), 5, 4, 1).with_stream(1).with_key_frame(true);
        assert_eq!((p.pts, p.dts, p.stream_index, p.key_frame), (5, 4, 1, true));
    }
}
