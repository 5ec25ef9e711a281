//! FLV writer
//!
//! Layout: 9-byte header, then tags each followed by their
//! PreviousTagSize. The `onMetaData` script tag goes first; its duration
//! is rewritten in place when the file is finished.

use bytes::{BufMut, BytesMut};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

use super::{AvccFramer, ContainerSink, VideoParams};
use crate::audio::AacConfig;
use crate::error::{AppError, Result};
use crate::video::format::CodecType;
use crate::video::nal::AvcConfigRecord;
use crate::video::packet::Packet;

pub(crate) const TAG_AUDIO: u8 = 8;
pub(crate) const TAG_VIDEO: u8 = 9;
pub(crate) const TAG_SCRIPT: u8 = 18;
pub(crate) const TAG_HEADER_LEN: usize = 11;
pub(crate) const CODEC_AVC: u8 = 7;
pub(crate) const CODEC_AAC: u8 = 10;
pub(crate) const AVC_SEQUENCE_HEADER: u8 = 0;
pub(crate) const AVC_NALU: u8 = 1;
pub(crate) const AAC_SEQUENCE_HEADER: u8 = 0;
pub(crate) const AAC_RAW: u8 = 1;

const AMF_NUMBER: u8 = 0x00;
const AMF_BOOLEAN: u8 = 0x01;
const AMF_STRING: u8 = 0x02;
const AMF_ECMA_ARRAY: u8 = 0x08;

fn amf_key(buf: &mut BytesMut, key: &str) {
    buf.put_u16(key.len() as u16);
    buf.extend_from_slice(key.as_bytes());
}

fn amf_number(buf: &mut BytesMut, key: &str, value: f64) {
    amf_key(buf, key);
    buf.put_u8(AMF_NUMBER);
    buf.put_f64(value);
}

fn amf_bool(buf: &mut BytesMut, key: &str, value: bool) {
    amf_key(buf, key);
    buf.put_u8(AMF_BOOLEAN);
    buf.put_u8(value as u8);
}

pub struct FlvSink<W: Write + Seek + Send + 'static> {
    out: W,
    video: VideoParams,
    audio: Option<AacConfig>,
    /// File offset of the f64 behind the `duration` key
    duration_offset: u64,
    wrote_avc_header: bool,
    framer: AvccFramer,
    last_ms: i64,
    finished: bool,
}

impl FlvSink<BufWriter<File>> {
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

impl<W: Write + Seek + Send + 'static> FlvSink<W> {
    pub fn new(mut out: W, video: &VideoParams, audio: Option<&AacConfig>) -> Result<Self> {
        if video.codec != CodecType::H264 {
            return Err(AppError::Runtime(format!(
                "FLV cannot carry {} video",
                video.codec
            )));
        }
        if let Some(audio) = audio {
            audio.validate()?;
        }

        let flags: u8 = if audio.is_some() { 0x05 } else { 0x01 };
        out.write_all(&[b'F', b'L', b'V', 1, flags, 0, 0, 0, 9])?;
        out.write_all(&0u32.to_be_bytes())?;

        let mut sink = Self {
            out,
            video: video.clone(),
            audio: audio.copied(),
            duration_offset: 0,
            wrote_avc_header: false,
            framer: AvccFramer::default(),
            last_ms: 0,
            finished: false,
        };
        sink.write_metadata()?;
        if let Some(audio) = sink.audio {
            let asc = audio.audio_specific_config();
            sink.write_audio_tag(AAC_SEQUENCE_HEADER, &asc, 0)?;
        }
        Ok(sink)
    }

    fn write_metadata(&mut self) -> Result<()> {
        let mut body = BytesMut::new();
        body.put_u8(AMF_STRING);
        amf_key(&mut body, "onMetaData");
        body.put_u8(AMF_ECMA_ARRAY);
        let count = if self.audio.is_some() { 10 } else { 6 };
        body.put_u32(count);

        // tag header (11) + everything before the duration value
        let duration_pos = TAG_HEADER_LEN + body.len() + 2 + "duration".len() + 1;
        amf_number(&mut body, "duration", 0.0);
        amf_number(&mut body, "width", self.video.resolution.width as f64);
        amf_number(&mut body, "height", self.video.resolution.height as f64);
        amf_number(&mut body, "framerate", self.video.fps as f64);
        amf_number(&mut body, "videocodecid", CODEC_AVC as f64);
        amf_number(&mut body, "videodatarate", self.video.bitrate as f64 / 1000.0);
        if let Some(audio) = self.audio {
            amf_number(&mut body, "audiocodecid", CODEC_AAC as f64);
            amf_number(&mut body, "audiosamplerate", audio.sample_rate as f64);
            amf_number(&mut body, "audiosamplesize", 16.0);
            amf_bool(&mut body, "stereo", audio.channels == 2);
        }
        body.extend_from_slice(&[0, 0, 9]);

        let start = self.out.stream_position()?;
        self.duration_offset = start + duration_pos as u64;
        self.write_tag(TAG_SCRIPT, 0, &body)
    }

    fn write_tag(&mut self, tag_type: u8, timestamp_ms: i64, body: &[u8]) -> Result<()> {
        let ts = timestamp_ms.max(0) as u32;
        let size = body.len() as u32;
        let mut header = [0u8; TAG_HEADER_LEN];
        header[0] = tag_type;
        header[1..4].copy_from_slice(&size.to_be_bytes()[1..]);
        header[4..7].copy_from_slice(&ts.to_be_bytes()[1..]);
        header[7] = (ts >> 24) as u8;
        self.out.write_all(&header)?;
        self.out.write_all(body)?;
        self.out
            .write_all(&(TAG_HEADER_LEN as u32 + size).to_be_bytes())?;
        Ok(())
    }

    fn write_video_tag(&mut self, key: bool, packet_type: u8, cts_ms: i32, ms: i64, data: &[u8]) -> Result<()> {
        let mut body = BytesMut::with_capacity(data.len() + 5);
        let frame_type: u8 = if key { 0x10 } else { 0x20 };
        body.put_u8(frame_type | CODEC_AVC);
        body.put_u8(packet_type);
        body.extend_from_slice(&cts_ms.to_be_bytes()[1..]);
        body.extend_from_slice(data);
        self.write_tag(TAG_VIDEO, ms, &body)
    }

    fn write_audio_tag(&mut self, packet_type: u8, data: &[u8], ms: i64) -> Result<()> {
        let stereo = self.audio.map(|a| a.channels == 2).unwrap_or(false);
        // AAC is always signalled as 44 kHz/16-bit; the real rate is in the ASC
        let flags = (CODEC_AAC << 4) | (3 << 2) | (1 << 1) | stereo as u8;
        let mut body = BytesMut::with_capacity(data.len() + 2);
        body.put_u8(flags);
        body.put_u8(packet_type);
        body.extend_from_slice(data);
        self.write_tag(TAG_AUDIO, ms, &body)
    }
}

impl<W: Write + Seek + Send + 'static> ContainerSink for FlvSink<W> {
    fn write_video(&mut self, packet: &Packet) -> Result<()> {
        if !self.wrote_avc_header {
            let sets = self.framer.header_sets(packet.data()).ok_or_else(|| {
                AppError::Runtime("first FLV video packet carries no SPS/PPS".to_string())
            })?;
            let record = AvcConfigRecord::from_parameter_sets(&sets).to_bytes();
            self.write_video_tag(true, AVC_SEQUENCE_HEADER, 0, 0, &record)?;
            self.wrote_avc_header = true;
        }

        let avcc = self.framer.sample(packet.data());
        let tb = self.video.timebase;
        let dts_ms = tb.to_ms(packet.dts);
        let cts_ms = (tb.to_ms(packet.pts) - dts_ms) as i32;
        self.last_ms = self.last_ms.max(tb.to_ms(packet.pts + packet.duration));
        self.write_video_tag(packet.key_frame, AVC_NALU, cts_ms, dts_ms, &avcc)
    }

    fn write_audio(&mut self, packet: &Packet) -> Result<()> {
        let audio = self
            .audio
            .ok_or_else(|| AppError::InvalidArgs("FLV sink has no audio stream".to_string()))?;
        let ms = packet.pts * 1000 / audio.sample_rate.max(1) as i64;
        self.write_audio_tag(AAC_RAW, packet.data(), ms)
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let end = self.out.stream_position()?;
        self.out.seek(SeekFrom::Start(self.duration_offset))?;
        self.out.write_all(&(self.last_ms as f64 / 1000.0).to_be_bytes())?;
        self.out.seek(SeekFrom::Start(end))?;
        self.out.flush()?;
        debug!("FLV finished, duration {} ms", self.last_ms);
        Ok(())
    }
}
