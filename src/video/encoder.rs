//! Encode-and-save orchestration
//!
//! [`Encoder`] composes one encode channel with an optional
//! [`ContainerMuxer`]. Every `encode()` call pops whatever the channel has
//! ready, then pushes the new frame, so in non-block mode the returned
//! packet belongs to an earlier frame.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::audio::{AacConfig, AacEncoder, PcmChunker, AAC_FRAME_SAMPLES};
use crate::camera::{Camera, CameraFrameGuard};
use crate::config::EncoderSettings;
use crate::error::{AppError, Result};
use crate::video::channel::{
    software_encode_factory, CodecChannelConfig, EncodeChannel, EncodeChannelFactory, EncodedOutput,
};
use crate::video::format::{Container, PixelFormat, Resolution, Timebase, VideoType};
use crate::video::frame::Image;
use crate::video::mux::{ContainerMuxer, SpsGate, VideoParams};
use crate::video::nal::{self, nal_type, ParameterSets};
use crate::video::packet::Packet;

/// Pop deadline for output of an earlier push
const POP_TIMEOUT: Duration = Duration::from_millis(30);
/// Push deadline, and pop deadline after the push in block mode
const PUSH_TIMEOUT: Duration = Duration::from_millis(1000);
const CAMERA_TIMEOUT: Duration = Duration::from_millis(1000);

/// Encoder construction parameters
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    /// Output file; `None` only returns packets to the caller
    pub path: Option<PathBuf>,
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub video_type: VideoType,
    pub framerate: u32,
    pub gop: u32,
    pub bitrate: u32,
    /// Ticks per second of the `get_pts`/`get_dts` helpers
    pub time_base: u32,
    pub capture: bool,
    pub block: bool,
    /// AAC track settings; PCM passed to `encode` is dropped without it
    pub audio: Option<AacConfig>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::from(&EncoderSettings::default())
    }
}

impl From<&EncoderSettings> for EncoderConfig {
    fn from(s: &EncoderSettings) -> Self {
        Self {
            path: None,
            resolution: Resolution::new(s.width, s.height),
            format: s.format,
            video_type: s.video_type,
            framerate: s.framerate,
            gop: s.gop,
            bitrate: s.bitrate,
            time_base: s.time_base,
            capture: s.capture,
            block: s.block,
            audio: None,
        }
    }
}

impl EncoderConfig {
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.path = (!path.as_os_str().is_empty()).then_some(path);
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_audio(mut self, audio: AacConfig) -> Self {
        self.audio = Some(audio);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.format != PixelFormat::Nv21 {
            return Err(AppError::Config(format!(
                "Encoder input must be NV21, got {}",
                self.format
            )));
        }
        if self.time_base == 0 {
            return Err(AppError::Config("time_base must be positive".to_string()));
        }
        if let Some(audio) = &self.audio {
            audio.validate()?;
        }
        Ok(())
    }
}

/// AAC side of an encode session
///
/// PCM is cut into exact 1024-sample chunks; each encoded access unit is
/// stamped with the running sample count, so audio time never depends on
/// when `push_pcm` happened to be called.
pub struct AudioTrack {
    config: AacConfig,
    encoder: AacEncoder,
    chunker: PcmChunker,
    packets: u64,
}

impl AudioTrack {
    pub fn new(config: AacConfig) -> Result<Self> {
        Ok(Self {
            encoder: AacEncoder::new(config)?,
            chunker: PcmChunker::new(AAC_FRAME_SAMPLES, config.channels, config.format),
            config,
            packets: 0,
        })
    }

    pub fn config(&self) -> &AacConfig {
        &self.config
    }

    /// Encode every complete chunk now available; time base 1/sample_rate
    pub fn push_pcm(&mut self, pcm: &[u8]) -> Result<Vec<Packet>> {
        let mut packets = Vec::new();
        for chunk in self.chunker.push(pcm) {
            if let Some(aac) = self.encoder.encode(&chunk.data)? {
                packets.push(Packet::new(aac, chunk.pts, chunk.pts, chunk.samples as i64));
                self.packets += 1;
            }
        }
        Ok(packets)
    }

    /// PCM bytes waiting for a full chunk
    pub fn pending_bytes(&self) -> usize {
        self.chunker.pending_len()
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }
}

pub struct Encoder {
    config: EncoderConfig,
    video_type: VideoType,
    timebase: Timebase,
    channel: Box<EncodeChannel>,
    muxer: Option<ContainerMuxer>,
    audio: Option<AudioTrack>,
    camera: Option<Arc<dyn Camera>>,
    gate: SpsGate,
    /// Wall-clock origin of pts 0, pinned when the gate opens
    first_ms: Option<i64>,
    last_pts: Option<i64>,
    started: Instant,
    parameter_sets: Option<ParameterSets>,
    capture: Option<Image>,
    reinits: u64,
    frames: u64,
    closed: bool,
}

impl Encoder {
    /// Encoder on the software H.264 channel
    pub fn new(config: EncoderConfig) -> Result<Self> {
        Self::with_factory(config, software_encode_factory())
    }

    /// Encoder on a caller-supplied channel implementation
    pub fn with_factory(config: EncoderConfig, factory: EncodeChannelFactory) -> Result<Self> {
        config.validate()?;
        let video_type = match &config.path {
            Some(path) => VideoType::resolve(path, config.video_type)?,
            None => config.video_type,
        };
        let framerate = config.framerate.max(1);
        let timebase = Timebase::new(1, framerate as i32);

        let mut channel = factory();
        channel.open(&CodecChannelConfig::encode(
            video_type.codec(),
            config.resolution,
            config.format,
            config.bitrate,
            config.gop,
            framerate,
        ))?;

        let muxer = match &config.path {
            Some(path) => {
                let params = VideoParams {
                    codec: video_type.codec(),
                    resolution: config.resolution,
                    timebase,
                    fps: framerate,
                    bitrate: config.bitrate,
                };
                match ContainerMuxer::open(path, video_type, params, config.audio) {
                    Ok(muxer) => Some(muxer),
                    Err(e) => {
                        let _ = channel.close();
                        return Err(e);
                    }
                }
            }
            None => None,
        };
        let audio = match config.audio {
            Some(aac) => Some(AudioTrack::new(aac)?),
            None => None,
        };

        info!(
            "Encoder opened: {} {} @ {}fps, {} bps, gop {}, output {}",
            video_type,
            config.resolution,
            framerate,
            config.bitrate,
            config.gop,
            config
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string())
        );

        Ok(Self {
            config,
            video_type,
            timebase,
            channel,
            muxer,
            audio,
            camera: None,
            gate: SpsGate::default(),
            first_ms: None,
            last_pts: None,
            started: Instant::now(),
            parameter_sets: None,
            capture: None,
            reinits: 0,
            frames: 0,
            closed: false,
        })
    }

    /// Use `camera` as the frame source when `encode` gets no image
    pub fn bind_camera(&mut self, camera: Arc<dyn Camera>) -> Result<()> {
        if camera.format() != PixelFormat::Nv21 {
            return Err(AppError::Config(format!(
                "Encoder camera must deliver NV21, got {}",
                camera.format()
            )));
        }
        debug!("Encoder bound to camera channel {}", camera.channel());
        self.camera = Some(camera);
        Ok(())
    }

    /// Encode one frame, stamping it with the wall clock.
    ///
    /// Without `image` the frame is pulled from the bound camera. The
    /// returned packet is empty while the pipeline fills.
    pub fn encode(&mut self, image: Option<&Image>, pcm: Option<&[u8]>) -> Result<Packet> {
        let now = self.started.elapsed().as_millis() as i64;
        self.encode_at(image, pcm, now)
    }

    /// As [`Encoder::encode`] with an explicit wall-clock time in ms
    pub fn encode_at(&mut self, image: Option<&Image>, pcm: Option<&[u8]>, now_ms: i64) -> Result<Packet> {
        self.ensure_open()?;
        match image {
            Some(image) => self.encode_image(image, pcm, now_ms),
            None => {
                let camera = self
                    .camera
                    .clone()
                    .ok_or_else(|| AppError::NotReady("no image given and no camera bound".to_string()))?;
                let frame = CameraFrameGuard::read(camera.as_ref(), CAMERA_TIMEOUT)?;
                self.encode_image(frame.image(), pcm, now_ms)
            }
        }
    }

    fn encode_image(&mut self, image: &Image, pcm: Option<&[u8]>, now_ms: i64) -> Result<Packet> {
        if image.format() != PixelFormat::Nv21 {
            return Err(AppError::Config(format!(
                "Encoder input must be NV21, got {}",
                image.format()
            )));
        }
        self.reconfigure_for(image)?;
        if self.config.capture {
            self.capture = Some(image.to_owned_image());
        }

        let mut packet = match self.channel.pop(POP_TIMEOUT) {
            Ok(Some(output)) => self.handle_output(output, now_ms)?,
            Ok(None) => Packet::empty(),
            Err(e) if e.is_timeout() => Packet::empty(),
            Err(e) => return Err(e),
        };

        self.channel.push(image, PUSH_TIMEOUT)?;
        self.frames += 1;

        if self.config.block && packet.is_empty() {
            match self.channel.pop(PUSH_TIMEOUT) {
                Ok(Some(output)) => packet = self.handle_output(output, now_ms)?,
                Ok(None) => {}
                Err(e) if e.is_timeout() => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(pcm) = pcm {
            self.write_pcm(pcm)?;
        }
        Ok(packet)
    }

    /// Close and reopen the channel when `image` no longer matches it
    fn reconfigure_for(&mut self, image: &Image) -> Result<()> {
        let Some(current) = self.channel.config().cloned() else {
            return Err(AppError::NotOpen("encode channel is closed".to_string()));
        };
        if current.matches(image) {
            return Ok(());
        }
        let next = current.with_geometry(image.resolution(), image.format());
        info!(
            "Input changed from {} to {}, reopening encode channel",
            current.resolution(),
            next.resolution()
        );
        self.channel.close()?;
        self.channel.open(&next)?;
        self.reinits += 1;
        Ok(())
    }

    /// Turn one channel output into a stamped packet and hand it to the muxer
    fn handle_output(&mut self, output: EncodedOutput, now_ms: i64) -> Result<Packet> {
        let nalus = output.nalu_count();
        let key_frame = output.key_frame;
        let mut data = output.concat();
        self.channel.free(output);

        if let Some(sets) = ParameterSets::from_annexb(&data) {
            self.parameter_sets = Some(sets);
        }
        if !self.gate.admit(nalus) {
            trace!("Encoder output ahead of SPS/PPS dropped ({} NAL units)", nalus);
            return Ok(Packet::empty());
        }
        let first_ms = *self.first_ms.get_or_insert(now_ms);
        // ms to 1/fps truncates; two frames must never share a tick
        let pts = match (self.timebase.ms_to_pts(now_ms - first_ms), self.last_pts) {
            (pts, Some(last)) if pts <= last => last + 1,
            (pts, _) => pts,
        };
        self.last_pts = Some(pts);

        if key_frame && self.video_type.container() == Container::Raw {
            if let Some(sets) = &self.parameter_sets {
                if !nal::contains_nal(&data, &[nal_type::SPS]) {
                    let mut with_sets = sets.to_annexb();
                    with_sets.extend_from_slice(&data);
                    data = with_sets.into();
                }
            }
        }

        let packet = Packet::new(data, pts, pts, 0).with_key_frame(key_frame);
        if let Some(muxer) = self.muxer.as_mut() {
            muxer.write_video_packet(packet.clone())?;
        }
        Ok(packet)
    }

    fn write_pcm(&mut self, pcm: &[u8]) -> Result<()> {
        let Some(track) = self.audio.as_mut() else {
            trace!("PCM ignored, encoder has no audio track");
            return Ok(());
        };
        if !self.gate.is_open() {
            trace!("PCM ignored until the first video packet");
            return Ok(());
        }
        for packet in track.push_pcm(pcm)? {
            if let Some(muxer) = self.muxer.as_mut() {
                muxer.write_audio_packet(packet)?;
            }
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(AppError::NotOpen("encoder is closed".to_string()));
        }
        Ok(())
    }

    /// Drain the channel, flush the muxer and release the channel. Safe to repeat.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let now = self.started.elapsed().as_millis() as i64;
        let mut result = Ok(());
        loop {
            match self.channel.pop(POP_TIMEOUT) {
                Ok(Some(output)) => {
                    if let Err(e) = self.handle_output(output, now) {
                        result = Err(e);
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    if !e.is_timeout() {
                        warn!("Draining encode channel failed: {}", e);
                    }
                    break;
                }
            }
        }
        if let Some(mut muxer) = self.muxer.take() {
            if let Err(e) = muxer.close() {
                result = result.and(Err(e));
            }
        }
        if let Err(e) = self.channel.close() {
            result = result.and(Err(e));
        }
        info!("Encoder closed after {} frames", self.frames);
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The last raw frame retained when capture is enabled
    pub fn capture(&self) -> Option<&Image> {
        self.capture.as_ref()
    }

    /// Wall-clock milliseconds to `time_base` ticks
    pub fn get_pts(&self, ms: i64) -> i64 {
        ms * self.config.time_base as i64 / 1000
    }

    pub fn get_dts(&self, ms: i64) -> i64 {
        self.get_pts(ms)
    }

    /// Current channel width (follows reinitialisation)
    pub fn width(&self) -> u32 {
        self.channel
            .config()
            .map(|c| c.width)
            .unwrap_or(self.config.resolution.width)
    }

    pub fn height(&self) -> u32 {
        self.channel
            .config()
            .map(|c| c.height)
            .unwrap_or(self.config.resolution.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.config.format
    }

    pub fn video_type(&self) -> VideoType {
        self.video_type
    }

    pub fn framerate(&self) -> u32 {
        self.config.framerate
    }

    pub fn gop(&self) -> u32 {
        self.config.gop
    }

    pub fn bitrate(&self) -> u32 {
        self.config.bitrate
    }

    pub fn time_base(&self) -> u32 {
        self.config.time_base
    }

    /// Stream time base of the returned packets
    pub fn timebase(&self) -> Timebase {
        self.timebase
    }

    pub fn path(&self) -> Option<&Path> {
        self.config.path.as_deref()
    }

    pub fn audio(&self) -> Option<&AudioTrack> {
        self.audio.as_ref()
    }

    pub fn muxer(&self) -> Option<&ContainerMuxer> {
        self.muxer.as_ref()
    }

    /// Channel close/reopen cycles caused by input geometry changes
    pub fn reinit_count(&self) -> u64 {
        self.reinits
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Encoder close on drop failed: {}", e);
        }
    }
}
