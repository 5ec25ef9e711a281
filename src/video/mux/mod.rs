//! Container muxing
//!
//! [`ContainerMuxer`] owns the stream-level rules that do not depend on
//! the file format:
//!
//! - nothing is written until a packet with more than two NAL units (the
//!   encoder's SPS + PPS + slice burst) has been seen
//! - the first written packet is rebased to pts 0 / dts 0
//! - video is buffered one packet deep so each packet's duration can be
//!   filled in from the next packet's pts
//!
//! Format specifics live behind [`ContainerSink`].

pub mod flv;
pub mod mp4;
pub mod raw;

use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

use crate::audio::AacConfig;
use crate::error::{AppError, Result};
use crate::video::format::{CodecType, Container, Resolution, Timebase, VideoType};
use crate::video::nal;
use crate::video::packet::Packet;

pub use self::flv::FlvSink;
pub use self::mp4::Mp4Sink;
pub use self::raw::RawSink;

/// Stream index used for video packets in every container
pub const VIDEO_STREAM: usize = 0;
/// Stream index used for audio packets
pub const AUDIO_STREAM: usize = 1;

/// Video stream parameters written into container headers
#[derive(Debug, Clone, PartialEq)]
pub struct VideoParams {
    pub codec: CodecType,
    pub resolution: Resolution,
    pub timebase: Timebase,
    pub fps: u32,
    pub bitrate: u32,
}

impl VideoParams {
    /// H.264 stream ticking once per frame
    pub fn h264(resolution: Resolution, fps: u32, bitrate: u32) -> Self {
        let fps = fps.max(1);
        Self {
            codec: CodecType::H264,
            resolution,
            timebase: Timebase::new(1, fps as i32),
            fps,
            bitrate,
        }
    }
}

/// Format-specific writer behind a [`ContainerMuxer`]
pub trait ContainerSink: Send {
    /// Write one Annex-B video packet whose duration is final
    fn write_video(&mut self, packet: &Packet) -> Result<()>;

    /// Write one raw AAC access unit (time base 1/sample_rate)
    fn write_audio(&mut self, packet: &Packet) -> Result<()>;

    /// Write the trailer and flush; called once
    fn finish(&mut self) -> Result<()>;
}

/// Holds packets back until the encoder has produced its parameter sets
#[derive(Debug, Default, Clone)]
pub struct SpsGate {
    open: bool,
}

impl SpsGate {
    /// Returns whether a pop with `nalu_count` units may pass
    pub fn admit(&mut self, nalu_count: usize) -> bool {
        if !self.open && nalu_count > 2 {
            debug!("SPS/PPS seen ({} NAL units), gate open", nalu_count);
            self.open = true;
        }
        self.open
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn reset(&mut self) {
        self.open = false;
    }
}

/// Converts Annex-B packets to AVCC samples for containers with an `avcC`
/// header
///
/// The header records the first SPS/PPS seen. When the encoder is later
/// reopened with different parameter sets (geometry change), samples keep
/// the new ones in-band so decoders pick them up.
#[derive(Debug, Default, Clone)]
pub struct AvccFramer {
    header: Option<nal::ParameterSets>,
    current: Option<nal::ParameterSets>,
}

impl AvccFramer {
    /// Parameter sets for the container header, recorded on first call
    pub fn header_sets(&mut self, data: &[u8]) -> Option<nal::ParameterSets> {
        if self.header.is_none() {
            self.header = nal::ParameterSets::from_annexb(data);
            self.current = self.header.clone();
        }
        self.header.clone()
    }

    pub fn sample(&mut self, data: &[u8]) -> Vec<u8> {
        if let Some(sets) = nal::ParameterSets::from_annexb(data) {
            if self.current.as_ref() != Some(&sets) {
                debug!("Parameter sets changed, keeping them in-band");
                self.current = Some(sets);
            }
        }
        match &self.current {
            Some(sets) if self.header.as_ref() != Some(sets) => nal::annexb_to_avcc_inband(data, sets),
            _ => nal::annexb_to_avcc_sample(data),
        }
    }
}

pub struct ContainerMuxer {
    path: Option<PathBuf>,
    sink: Box<dyn ContainerSink>,
    video: VideoParams,
    audio: Option<AacConfig>,
    gate: SpsGate,
    /// (pts, dts) of the first admitted packet
    base: Option<(i64, i64)>,
    pending: Option<Packet>,
    last_duration: i64,
    last_dts: i64,
    video_packets: u64,
    audio_packets: u64,
    dropped: u64,
    closed: bool,
}

impl ContainerMuxer {
    /// Create `path` and write stream headers
    ///
    /// `video_type` picks the container. Raw elementary streams carry no
    /// audio; audio packets for them are discarded.
    pub fn open(
        path: &Path,
        video_type: VideoType,
        video: VideoParams,
        audio: Option<AacConfig>,
    ) -> Result<Self> {
        if video.codec != video_type.codec() {
            return Err(AppError::Config(format!(
                "Stream codec {} does not match output type {}",
                video.codec, video_type
            )));
        }
        let sink: Box<dyn ContainerSink> = match video_type.container() {
            Container::Mp4 => Box::new(Mp4Sink::create(path, &video, audio.as_ref())?),
            Container::Flv => Box::new(FlvSink::create(path, &video, audio.as_ref())?),
            Container::Raw => {
                if audio.is_some() {
                    warn!("{} is a raw elementary stream, audio will not be stored", path.display());
                }
                Box::new(RawSink::create(path)?)
            }
        };
        info!(
            "Muxer opened {} ({}, {} @ {}fps, audio: {})",
            path.display(),
            video_type,
            video.resolution,
            video.fps,
            audio
                .map(|a| format!("{}Hz/{}ch", a.sample_rate, a.channels))
                .unwrap_or_else(|| "none".to_string())
        );
        let mut muxer = Self::with_sink(sink, video, audio);
        muxer.path = Some(path.to_path_buf());
        Ok(muxer)
    }

    /// Muxer over an arbitrary sink
    pub fn with_sink(sink: Box<dyn ContainerSink>, video: VideoParams, audio: Option<AacConfig>) -> Self {
        Self {
            path: None,
            sink,
            video,
            audio,
            gate: SpsGate::default(),
            base: None,
            pending: None,
            last_duration: 0,
            last_dts: i64::MIN,
            video_packets: 0,
            audio_packets: 0,
            dropped: 0,
            closed: false,
        }
    }

    /// Offer one encoded video packet (Annex-B).
    ///
    /// Returns `false` if the packet was dropped because no parameter sets
    /// have been seen yet.
    pub fn write_video_packet(&mut self, mut packet: Packet) -> Result<bool> {
        self.ensure_open()?;
        if !self.gate.admit(nal::split_annexb(packet.data()).len()) {
            self.dropped += 1;
            trace!("Dropping video packet ahead of SPS/PPS ({} bytes)", packet.len());
            return Ok(false);
        }

        let (base_pts, base_dts) = *self.base.get_or_insert((packet.pts, packet.dts));
        packet.pts -= base_pts;
        packet.dts -= base_dts;
        packet.stream_index = VIDEO_STREAM;
        packet.key_frame |= nal::contains_nal(packet.data(), &[nal::nal_type::IDR_SLICE]);

        if let Some(mut prev) = self.pending.take() {
            if packet.pts < prev.pts {
                warn!(
                    "Video pts went backwards ({} after {}), clamping",
                    packet.pts, prev.pts
                );
                packet.pts = prev.pts;
            }
            prev.duration = packet.pts - prev.pts;
            self.last_duration = prev.duration;
            self.flush_video(prev)?;
        }
        if packet.dts <= self.last_dts {
            packet.dts = self.last_dts + 1;
        }
        packet.dts = packet.dts.min(packet.pts);
        self.last_dts = packet.dts;
        self.pending = Some(packet);
        Ok(true)
    }

    /// Write one AAC access unit; its pts counts samples since the start
    pub fn write_audio_packet(&mut self, mut packet: Packet) -> Result<()> {
        self.ensure_open()?;
        if self.audio.is_none() {
            return Err(AppError::InvalidArgs("muxer was opened without an audio stream".to_string()));
        }
        packet.stream_index = AUDIO_STREAM;
        packet.key_frame = true;
        self.sink.write_audio(&packet)?;
        self.audio_packets += 1;
        Ok(())
    }

    fn flush_video(&mut self, packet: Packet) -> Result<()> {
        trace!(
            "Video packet pts={} dts={} duration={} key={} {} bytes",
            packet.pts,
            packet.dts,
            packet.duration,
            packet.key_frame,
            packet.len()
        );
        self.sink.write_video(&packet)?;
        self.video_packets += 1;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(AppError::NotOpen("muxer is closed".to_string()));
        }
        Ok(())
    }

    /// Flush the held-back packet and write the trailer. Safe to repeat.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(mut last) = self.pending.take() {
            // no successor: reuse the previous interval
            last.duration = if self.last_duration > 0 { self.last_duration } else { 1 };
            self.flush_video(last)?;
        }
        self.sink.finish()?;
        info!(
            "Muxer closed{}: {} video, {} audio packets, {} dropped before SPS",
            self.path
                .as_ref()
                .map(|p| format!(" {}", p.display()))
                .unwrap_or_default(),
            self.video_packets,
            self.audio_packets,
            self.dropped
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn gate_open(&self) -> bool {
        self.gate.is_open()
    }

    /// Timestamp of the newest admitted video packet in milliseconds
    pub fn position_ms(&self) -> i64 {
        self.pending
            .as_ref()
            .map(|p| self.video.timebase.to_ms(p.pts))
            .unwrap_or(0)
    }

    pub fn video_params(&self) -> &VideoParams {
        &self.video
    }

    pub fn audio_config(&self) -> Option<&AacConfig> {
        self.audio.as_ref()
    }

    /// Video packets handed to the sink so far
    pub fn video_packets(&self) -> u64 {
        self.video_packets
    }

    pub fn audio_packets(&self) -> u64 {
        self.audio_packets
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for ContainerMuxer {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to finalize container: {}", e);
        }
    }
}
