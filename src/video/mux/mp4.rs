use bytes::Bytes;
use mp4::{
    AacConfig as Mp4AacConfig, AudioObjectType, AvcConfig, ChannelConfig, FourCC, MediaConfig,
    Mp4Config, Mp4Sample, Mp4Writer, SampleFreqIndex, TrackConfig, TrackType,
};
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;
use tracing::{debug, warn};

use super::{AvccFramer, ContainerSink, VideoParams};
use crate::audio::aac::sample_freq_index;
use crate::audio::AacConfig;
use crate::error::{AppError, Result};
use crate::video::format::CodecType;
use crate::video::nal::ParameterSets;
use crate::video::packet::Packet;

/// Movie header time scale
const MOVIE_TIMESCALE: u32 = 1000;

/// ISO BMFF writer with one H.264 track and an optional AAC track
///
/// Tracks are added when the first video packet arrives, because the
/// `avcC` box needs the encoder's SPS/PPS. Audio written before that is
/// held back and flushed right after.
pub struct Mp4Sink<W: Write + Seek + Send + 'static> {
    writer: Option<Mp4Writer<W>>,
    video: VideoParams,
    audio: Option<AacConfig>,
    video_track: Option<u32>,
    audio_track: Option<u32>,
    audio_backlog: Vec<Packet>,
    framer: AvccFramer,
}

impl Mp4Sink<BufWriter<File>> {
    pub fn create(path: &Path, video: &VideoParams, audio: Option<&AacConfig>) -> Result<Self> {
        let file = File::create(path).map_err(|e| {
            AppError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create {}: {}", path.display(), e),
            ))
        })?;
        Self::new(BufWriter::new(file), video, audio)
    }
}

impl<W: Write + Seek + Send + 'static> Mp4Sink<W> {
    pub fn new(writer: W, video: &VideoParams, audio: Option<&AacConfig>) -> Result<Self> {
        if video.codec != CodecType::H264 {
            return Err(AppError::NotImplemented(format!(
                "MP4 output for {} streams",
                video.codec
            )));
        }
        if let Some(audio) = audio {
            audio.validate()?;
        }
        let config = Mp4Config {
            major_brand: "isom".parse::<FourCC>()?,
            minor_version: 512,
            compatible_brands: ["isom", "iso2", "avc1", "mp41"]
                .iter()
                .map(|b| b.parse::<FourCC>())
                .collect::<std::result::Result<Vec<_>, _>>()?,
            timescale: MOVIE_TIMESCALE,
        };
        let writer = Mp4Writer::write_start(writer, &config)?;
        Ok(Self {
            writer: Some(writer),
            video: video.clone(),
            audio: audio.copied(),
            video_track: None,
            audio_track: None,
            audio_backlog: Vec::new(),
            framer: AvccFramer::default(),
        })
    }

    fn writer(&mut self) -> Result<&mut Mp4Writer<W>> {
        self.writer
            .as_mut()
            .ok_or_else(|| AppError::NotOpen("MP4 writer already finished".to_string()))
    }

    /// Video ticks are written in units of `1/den`
    fn ticks(&self, value: i64) -> i64 {
        value * self.video.timebase.num.max(1) as i64
    }

    fn add_tracks(&mut self, sets: ParameterSets) -> Result<()> {
        let video = TrackConfig {
            track_type: TrackType::Video,
            timescale: self.video.timebase.den.max(1) as u32,
            language: "und".to_string(),
            media_conf: MediaConfig::AvcConfig(AvcConfig {
                width: self.video.resolution.width as u16,
                height: self.video.resolution.height as u16,
                seq_param_set: sets.sps,
                pic_param_set: sets.pps,
            }),
        };
        self.writer()?.add_track(&video)?;
        let mut next_id = 1;
        self.video_track = Some(next_id);

        if let Some(audio) = self.audio {
            let index = sample_freq_index(audio.sample_rate).ok_or_else(|| {
                AppError::Config(format!("Unsupported AAC sample rate {}", audio.sample_rate))
            })?;
            let track = TrackConfig {
                track_type: TrackType::Audio,
                timescale: audio.sample_rate,
                language: "und".to_string(),
                media_conf: MediaConfig::AacConfig(Mp4AacConfig {
                    bitrate: audio.bitrate,
                    profile: AudioObjectType::AacLowComplexity,
                    freq_index: SampleFreqIndex::try_from(index)?,
                    chan_conf: ChannelConfig::try_from(audio.channels as u8)?,
                }),
            };
            self.writer()?.add_track(&track)?;
            next_id += 1;
            self.audio_track = Some(next_id);
        }
        debug!(
            "MP4 tracks added: video={:?} audio={:?}",
            self.video_track, self.audio_track
        );

        for packet in std::mem::take(&mut self.audio_backlog) {
            self.write_audio_sample(&packet)?;
        }
        Ok(())
    }

    fn write_audio_sample(&mut self, packet: &Packet) -> Result<()> {
        let track = self
            .audio_track
            .ok_or_else(|| AppError::InvalidArgs("MP4 sink has no audio track".to_string()))?;
        let sample = Mp4Sample {
            start_time: packet.pts.max(0) as u64,
            duration: packet.duration.max(0) as u32,
            rendering_offset: 0,
            is_sync: true,
            bytes: packet.bytes(),
        };
        self.writer()?.write_sample(track, &sample)?;
        Ok(())
    }
}

impl<W: Write + Seek + Send + 'static> ContainerSink for Mp4Sink<W> {
    fn write_video(&mut self, packet: &Packet) -> Result<()> {
        if self.video_track.is_none() {
            let sets = self.framer.header_sets(packet.data()).ok_or_else(|| {
                AppError::Runtime("first MP4 video packet carries no SPS/PPS".to_string())
            })?;
            if sets.sps.len() < 4 {
                return Err(AppError::Runtime(format!(
                    "SPS too short ({} bytes)",
                    sets.sps.len()
                )));
            }
            self.add_tracks(sets)?;
        }
        let track = self.video_track.unwrap_or(1);
        let bytes = Bytes::from(self.framer.sample(packet.data()));
        if bytes.is_empty() {
            warn!("Video packet at pts {} holds no picture data", packet.pts);
        }
        let sample = Mp4Sample {
            start_time: self.ticks(packet.dts).max(0) as u64,
            duration: self.ticks(packet.duration).max(0) as u32,
            rendering_offset: self.ticks(packet.pts - packet.dts) as i32,
            is_sync: packet.key_frame,
            bytes,
        };
        self.writer()?.write_sample(track, &sample)?;
        Ok(())
    }

    fn write_audio(&mut self, packet: &Packet) -> Result<()> {
        if self.audio.is_none() {
            return Err(AppError::InvalidArgs("MP4 sink has no audio stream".to_string()));
        }
        if self.video_track.is_none() {
            self.audio_backlog.push(packet.clone());
            return Ok(());
        }
        self.write_audio_sample(packet)
    }

    fn finish(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        if self.video_track.is_none() {
            warn!("MP4 finished without any video samples");
        }
        writer.write_end()?;
        writer.into_writer().flush()?;
        Ok(())
    }
}
