//! File decoding front end
//!
//! [`Decoder`] drives a [`ContainerDemuxer`] and one decode channel. Video
//! contexts from containers are released in presentation order: each
//! returned context advances the expected pts by its duration, and
//! contexts that arrive early wait in a small pending list.

use bytes::Bytes;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::audio::{AacDecoder, SampleFormat};
use crate::error::{AppError, Result};
use crate::error_throttled;
use crate::utils::LogThrottler;
use crate::video::channel::{software_decode_factory, CodecChannelConfig, DecodeChannel, DecodeChannelFactory};
use crate::video::demux::{self, AnnexBFilter, ContainerDemuxer, AUDIO_STREAM, VIDEO_STREAM};
use crate::video::format::{Container, MediaType, PixelFormat, Timebase};
use crate::video::frame::Image;
use crate::video::nal::{self, nal_type};
use crate::video::packet::{Context, Packet};

const PUSH_TIMEOUT: Duration = Duration::from_millis(1000);
const BLOCK_POP_TIMEOUT: Duration = Duration::from_millis(1000);
const PIPELINE_POP_TIMEOUT: Duration = Duration::from_millis(0);
/// Contexts held for reordering before the oldest is forced out
const MAX_PENDING: usize = 32;

pub struct Decoder {
    path: PathBuf,
    format: PixelFormat,
    demuxer: Box<dyn ContainerDemuxer>,
    filter: AnnexBFilter,
    channel: Box<DecodeChannel>,
    audio: Option<AacDecoder>,
    /// Parameter sets seen in packets that carried no slice
    prefix: Vec<u8>,
    pending: VecDeque<Context>,
    next_pts: Option<i64>,
    last_pts: i64,
    frames: u64,
    throttle: LogThrottler,
    closed: bool,
}

impl Decoder {
    /// Open `path` on the software decode channel
    pub fn open(path: impl AsRef<Path>, format: PixelFormat) -> Result<Self> {
        Self::open_with(path, format, software_decode_factory())
    }

    pub fn open_with(path: impl AsRef<Path>, format: PixelFormat, factory: DecodeChannelFactory) -> Result<Self> {
        let path = path.as_ref();
        if !matches!(format, PixelFormat::Nv21 | PixelFormat::Grayscale) {
            return Err(AppError::Config(format!(
                "Decoder output must be NV21 or GRAYSCALE, got {}",
                format
            )));
        }
        let demuxer = demux::open(path)?;
        let video = demuxer
            .video()
            .cloned()
            .ok_or_else(|| AppError::UnsupportedFormat(format!("{} has no video stream", path.display())))?;

        let filter = match demuxer.container() {
            Container::Raw => AnnexBFilter::passthrough(),
            _ => AnnexBFilter::new(&video),
        };

        let mut channel = factory();
        channel.open(&CodecChannelConfig::decode(video.codec, video.resolution, format))?;

        let audio = match demuxer.audio() {
            Some(info) => match AacDecoder::new(&info.asc) {
                Ok(dec) => Some(dec),
                Err(e) => {
                    warn!("Audio in {} will be skipped: {}", path.display(), e);
                    None
                }
            },
            None => None,
        };

        info!(
            "Decoder opened {}: {} {:.2}fps, {:.3}s, audio {}",
            path.display(),
            video.resolution,
            video.fps,
            demuxer.duration(),
            if audio.is_some() { "yes" } else { "no" }
        );

        Ok(Self {
            path: path.to_path_buf(),
            format,
            demuxer,
            filter,
            channel,
            audio,
            prefix: Vec::new(),
            pending: VecDeque::new(),
            next_pts: None,
            last_pts: 0,
            frames: 0,
            throttle: LogThrottler::with_secs(5),
            closed: false,
        })
    }

    fn is_raw(&self) -> bool {
        self.demuxer.container() == Container::Raw
    }

    /// Decode the next video frame.
    ///
    /// Block mode pushes then waits for that picture. Non-block mode first
    /// takes whatever picture is ready, then pushes, so the image may belong
    /// to an earlier packet or be absent. Returns `None` at end of file.
    pub fn decode_video(&mut self, block: bool) -> Result<Option<Context>> {
        self.ensure_open()?;
        loop {
            if let Some(ctx) = self.take_ready() {
                return Ok(Some(ctx));
            }
            let Some(packet) = self.demuxer.read_packet()? else {
                debug!("End of {} after {} video frames", self.path.display(), self.frames);
                return Ok(None);
            };
            if packet.stream_index != VIDEO_STREAM {
                continue;
            }
            if let Some(ctx) = self.decode_video_packet(packet, block)? {
                if let Some(ctx) = self.reorder(ctx) {
                    return Ok(Some(ctx));
                }
            }
        }
    }

    /// Decode the next audio packet to interleaved S16 PCM
    pub fn decode_audio(&mut self) -> Result<Option<Context>> {
        self.ensure_open()?;
        if self.audio.is_none() {
            return Ok(None);
        }
        while let Some(packet) = self.demuxer.read_packet()? {
            if packet.stream_index == AUDIO_STREAM {
                return self.decode_audio_packet(packet).map(Some);
            }
        }
        Ok(None)
    }

    /// Decode whichever stream's packet comes next in the file
    pub fn decode(&mut self, block: bool) -> Result<Option<Context>> {
        self.ensure_open()?;
        loop {
            if let Some(ctx) = self.take_ready() {
                return Ok(Some(ctx));
            }
            let Some(packet) = self.demuxer.read_packet()? else {
                return Ok(None);
            };
            match packet.stream_index {
                VIDEO_STREAM => {
                    if let Some(ctx) = self.decode_video_packet(packet, block)? {
                        if let Some(ctx) = self.reorder(ctx) {
                            return Ok(Some(ctx));
                        }
                    }
                }
                AUDIO_STREAM if self.audio.is_some() => {
                    return self.decode_audio_packet(packet).map(Some);
                }
                _ => {}
            }
        }
    }

    /// Next packet as still-encoded data: Annex-B for video, raw AAC for audio
    pub fn unpack(&mut self) -> Result<Option<Context>> {
        self.ensure_open()?;
        let Some(packet) = self.demuxer.read_packet()? else {
            return Ok(None);
        };
        if packet.stream_index == VIDEO_STREAM {
            let data = self.filter.filter(packet.data())?;
            let ctx = Context::raw(MediaType::Video, Bytes::from(data), self.timebase(), packet.pts, packet.duration)
                .with_last_pts(self.last_pts);
            self.last_pts = packet.pts;
            Ok(Some(ctx))
        } else {
            let info = self.demuxer.audio();
            let (timebase, rate, channels) = info
                .map(|a| (a.timebase, a.sample_rate, a.channels))
                .unwrap_or((Timebase::MILLIS, 0, 0));
            Ok(Some(
                Context::raw(MediaType::Audio, packet.bytes(), timebase, packet.pts, packet.duration)
                    .with_audio_info(rate, channels),
            ))
        }
    }

    /// Seek to the sync point at or before `time` seconds.
    ///
    /// A negative `time` only reports the current position. Raw streams
    /// cannot seek and report 0. Returns the position reached, or -1 if no
    /// sync point follows the target.
    pub fn seek(&mut self, time: f64) -> Result<f64> {
        self.ensure_open()?;
        let timebase = self.timebase();
        if time < 0.0 {
            return Ok(timebase.to_seconds(self.next_pts.unwrap_or(0)));
        }
        if self.is_raw() {
            debug!("Seek ignored on raw stream {}", self.path.display());
            return Ok(0.0);
        }

        self.demuxer.seek(timebase.from_seconds(time))?;
        let mut found = None;
        while let Some(packet) = self.demuxer.read_packet()? {
            if packet.stream_index != VIDEO_STREAM {
                continue;
            }
            let data = self.filter.filter(packet.data())?;
            if nal::contains_nal(&data, &[nal_type::IDR_SLICE, nal_type::SPS]) {
                found = Some(packet.pts);
                break;
            }
        }
        let Some(pts) = found else {
            warn!("No sync point after {:.3}s in {}", time, self.path.display());
            return Ok(-1.0);
        };

        self.demuxer.seek(pts)?;
        self.next_pts = Some(pts);
        self.pending.clear();
        self.prefix.clear();
        self.flush_channel();
        let reached = timebase.to_seconds(pts);
        debug!("Seek to {:.3}s reached {:.3}s", time, reached);
        Ok(reached)
    }

    /// Drop pictures the channel still holds from before a seek
    fn flush_channel(&mut self) {
        loop {
            match self.channel.pop(PIPELINE_POP_TIMEOUT) {
                Ok(Some(image)) => self.channel.free(image),
                Ok(None) => break,
                Err(e) => {
                    trace!("Decode channel flush stopped: {}", e);
                    break;
                }
            }
        }
    }

    /// Push one video packet and build its context; `None` if it held no slice
    fn decode_video_packet(&mut self, packet: Packet, block: bool) -> Result<Option<Context>> {
        let data = self.filter.filter(packet.data())?;
        let types = nal::nal_types(&data);
        let has_slice = types
            .iter()
            .any(|t| *t == nal_type::IDR_SLICE || *t == nal_type::NON_IDR_SLICE);
        if !has_slice {
            if types.iter().any(|t| *t == nal_type::SPS || *t == nal_type::PPS) {
                self.prefix.extend_from_slice(&data);
            }
            trace!("Video packet at pts {} carries no slice ({:?})", packet.pts, types);
            return Ok(None);
        }

        let unit = if self.prefix.is_empty() {
            data
        } else {
            let mut unit = std::mem::take(&mut self.prefix);
            unit.extend_from_slice(&data);
            unit
        };

        let image = if block {
            self.push_unit(&unit);
            self.pop_image(BLOCK_POP_TIMEOUT)
        } else {
            let image = self.pop_image(PIPELINE_POP_TIMEOUT);
            self.push_unit(&unit);
            image
        };

        if self.next_pts.is_none() {
            self.next_pts = Some(packet.pts);
        }
        self.frames += 1;
        let ctx = Context::video(image, self.timebase(), packet.pts, self.last_pts, packet.duration);
        self.last_pts = packet.pts;
        Ok(Some(ctx))
    }

    fn push_unit(&mut self, unit: &[u8]) {
        if let Err(e) = self.channel.push(unit, PUSH_TIMEOUT) {
            error_throttled!(self.throttle, "decoder_push", "Decode push failed: {}", e);
        }
    }

    fn pop_image(&mut self, timeout: Duration) -> Option<Image> {
        match self.channel.pop(timeout) {
            Ok(image) => image,
            Err(e) => {
                if !e.is_timeout() {
                    error_throttled!(self.throttle, "decoder_pop", "Decode pop failed: {}", e);
                }
                None
            }
        }
    }

    fn decode_audio_packet(&mut self, packet: Packet) -> Result<Context> {
        let (timebase, rate, channels) = self
            .demuxer
            .audio()
            .map(|a| (a.timebase, a.sample_rate, a.channels))
            .unwrap_or((Timebase::MILLIS, 0, 0));
        let decoder = self
            .audio
            .as_mut()
            .ok_or_else(|| AppError::NotReady("no audio decoder".to_string()))?;
        let pcm = decoder.decode(packet.data())?;
        let rate = if decoder.sample_rate() > 0 { decoder.sample_rate() } else { rate };
        let channels = if decoder.channels() > 0 { decoder.channels() } else { channels };
        Ok(Context::audio(pcm, timebase, packet.pts, packet.duration, rate, channels))
    }

    /// Release `ctx` if it is the expected one, otherwise park it
    fn reorder(&mut self, ctx: Context) -> Option<Context> {
        if self.is_raw() {
            return Some(ctx);
        }
        let expected = self.next_pts.unwrap_or(ctx.pts);
        if ctx.pts == expected {
            self.next_pts = Some(ctx.pts + ctx.duration);
            return Some(ctx);
        }
        if ctx.pts < expected {
            trace!("Late context at pts {} (expected {}) dropped", ctx.pts, expected);
            return None;
        }
        self.pending.push_back(ctx);
        if self.pending.len() > MAX_PENDING {
            return self.force_oldest();
        }
        None
    }

    /// A parked context whose pts is now the expected one
    fn take_ready(&mut self) -> Option<Context> {
        let expected = self.next_pts?;
        let pos = self.pending.iter().position(|c| c.pts == expected)?;
        let ctx = self.pending.remove(pos)?;
        self.next_pts = Some(ctx.pts + ctx.duration);
        Some(ctx)
    }

    /// Resynchronise on the lowest parked pts when the list overflows
    fn force_oldest(&mut self) -> Option<Context> {
        let pos = self
            .pending
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.pts)
            .map(|(i, _)| i)?;
        let ctx = self.pending.remove(pos)?;
        warn!(
            "Reorder list full, skipping from pts {:?} to {}",
            self.next_pts, ctx.pts
        );
        self.next_pts = Some(ctx.pts + ctx.duration);
        Some(ctx)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(AppError::NotOpen("decoder is closed".to_string()));
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pending.clear();
        self.channel.close()?;
        info!("Decoder closed {} after {} video frames", self.path.display(), self.frames);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Container duration in seconds; 0 for raw streams
    pub fn duration(&self) -> f64 {
        self.demuxer.duration()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn container(&self) -> Container {
        self.demuxer.container()
    }

    /// Output pixel format of decoded images
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.demuxer.video().map(|v| v.resolution.width).unwrap_or(0)
    }

    pub fn height(&self) -> u32 {
        self.demuxer.video().map(|v| v.resolution.height).unwrap_or(0)
    }

    pub fn fps(&self) -> f64 {
        self.demuxer.video().map(|v| v.fps).unwrap_or(0.0)
    }

    pub fn bitrate(&self) -> u32 {
        self.demuxer.video().map(|v| v.bitrate).unwrap_or(0)
    }

    /// Video stream time base
    pub fn timebase(&self) -> Timebase {
        self.demuxer
            .video()
            .map(|v| v.timebase)
            .unwrap_or(Timebase::MILLIS)
    }

    pub fn has_video(&self) -> bool {
        self.demuxer.video().is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn audio_sample_rate(&self) -> u32 {
        self.demuxer.audio().map(|a| a.sample_rate).unwrap_or(0)
    }

    pub fn audio_channels(&self) -> u16 {
        self.demuxer.audio().map(|a| a.channels).unwrap_or(0)
    }

    pub fn audio_format(&self) -> SampleFormat {
        self.demuxer.audio().map(|a| a.format).unwrap_or_default()
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Decoder close on drop failed: {}", e);
        }
    }
}
