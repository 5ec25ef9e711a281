use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info, warn};

use super::{AudioStreamInfo, ContainerDemuxer, VideoStreamInfo, AUDIO_STREAM, VIDEO_STREAM};
use crate::audio::aac::parse_audio_specific_config;
use crate::audio::SampleFormat;
use crate::error::{AppError, Result};
use crate::video::format::{CodecType, Container, Resolution, Timebase};
use crate::video::mux::flv::{
    AAC_RAW, AAC_SEQUENCE_HEADER, AVC_NALU, AVC_SEQUENCE_HEADER, CODEC_AAC, CODEC_AVC, TAG_AUDIO,
    TAG_HEADER_LEN, TAG_SCRIPT, TAG_VIDEO,
};
use crate::video::nal::{AvcConfigRecord, SpsInfo};
use crate::video::packet::Packet;

const CODEC_HEVC: u8 = 12;
const FLV_HEADER_LEN: usize = 9;

/// Media tag located during the open-time scan
#[derive(Debug, Clone, Copy)]
struct TagEntry {
    stream: usize,
    /// Offset of the elementary data behind the codec header bytes
    offset: u64,
    size: usize,
    pts: i64,
    dts: i64,
    duration: i64,
    key: bool,
}

/// FLV reader with millisecond time bases for both streams
pub struct FlvDemuxer {
    file: BufReader<File>,
    video: Option<VideoStreamInfo>,
    audio: Option<AudioStreamInfo>,
    index: Vec<TagEntry>,
    cursor: usize,
    duration: f64,
}

impl FlvDemuxer {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        let file_len = file.get_ref().metadata()?.len();

        let mut header = [0u8; FLV_HEADER_LEN];
        file.read_exact(&mut header)?;
        if &header[..3] != b"FLV" {
            return Err(AppError::UnsupportedFormat(format!(
                "{} is not an FLV file",
                path.display()
            )));
        }
        let data_offset = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as u64;
        file.seek(SeekFrom::Start(data_offset + 4))?;

        let mut metadata = HashMap::new();
        let mut avc_record = None;
        let mut asc = None;
        let mut saw_hevc = false;
        let mut index = Vec::new();

        loop {
            let mut tag = [0u8; TAG_HEADER_LEN];
            match file.read_exact(&mut tag) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let tag_type = tag[0] & 0x1f;
            let size = u32::from_be_bytes([0, tag[1], tag[2], tag[3]]) as usize;
            let ts = u32::from_be_bytes([tag[7], tag[4], tag[5], tag[6]]) as i64;
            let body_start = file.stream_position()?;
            if body_start + size as u64 > file_len {
                warn!("FLV tag at {} truncated, stopping scan", body_start);
                break;
            }

            match tag_type {
                TAG_SCRIPT => {
                    let body = read_body(&mut file, size)?;
                    metadata = parse_metadata(&body);
                }
                TAG_VIDEO if size >= 5 => {
                    let mut head = [0u8; 5];
                    file.read_exact(&mut head)?;
                    let codec = head[0] & 0x0f;
                    if codec == CODEC_HEVC {
                        saw_hevc = true;
                    } else if codec == CODEC_AVC {
                        match head[1] {
                            AVC_SEQUENCE_HEADER => {
                                let record = read_body(&mut file, size - 5)?;
                                avc_record = Some(AvcConfigRecord::parse(&record)?);
                            }
                            AVC_NALU => {
                                let raw = u32::from_be_bytes([0, head[2], head[3], head[4]]);
                                // 24-bit signed composition time
                                let cts = ((raw << 8) as i32 >> 8) as i64;
                                index.push(TagEntry {
                                    stream: VIDEO_STREAM,
                                    offset: body_start + 5,
                                    size: size - 5,
                                    pts: ts + cts,
                                    dts: ts,
                                    duration: 0,
                                    key: head[0] >> 4 == 1,
                                });
                            }
                            _ => {}
                        }
                    }
                }
                TAG_AUDIO if size >= 2 => {
                    let mut head = [0u8; 2];
                    file.read_exact(&mut head)?;
                    if head[0] >> 4 == CODEC_AAC {
                        match head[1] {
                            AAC_SEQUENCE_HEADER => asc = Some(read_body(&mut file, size - 2)?),
                            AAC_RAW => index.push(TagEntry {
                                stream: AUDIO_STREAM,
                                offset: body_start + 2,
                                size: size - 2,
                                pts: ts,
                                dts: ts,
                                duration: 0,
                                key: true,
                            }),
                            _ => {}
                        }
                    }
                }
                _ => debug!("Skipping FLV tag type {} ({} bytes)", tag_type, size),
            }
            file.seek(SeekFrom::Start(body_start + size as u64 + 4))?;
        }

        if saw_hevc && avc_record.is_none() {
            return Err(AppError::UnsupportedFormat(format!(
                "H.265 video in {} cannot be decoded",
                path.display()
            )));
        }

        let fps = metadata.get("framerate").copied().unwrap_or(0.0);
        let has_video = index.iter().any(|e| e.stream == VIDEO_STREAM) || avc_record.is_some();
        let video = has_video.then(|| {
            let parameter_sets = avc_record.as_ref().and_then(AvcConfigRecord::parameter_sets);
            let from_sps = parameter_sets
                .as_ref()
                .and_then(|sets| SpsInfo::parse(&sets.sps).ok())
                .map(|sps| Resolution::new(sps.width, sps.height));
            let resolution = from_sps.unwrap_or_else(|| {
                Resolution::new(
                    metadata.get("width").copied().unwrap_or(0.0) as u32,
                    metadata.get("height").copied().unwrap_or(0.0) as u32,
                )
            });
            VideoStreamInfo {
                codec: CodecType::H264,
                resolution,
                timebase: Timebase::MILLIS,
                fps,
                bitrate: (metadata.get("videodatarate").copied().unwrap_or(0.0) * 1000.0) as u32,
                parameter_sets,
                length_size: Some(avc_record.as_ref().map(|r| r.length_size).unwrap_or(4)),
            }
        });

        let audio = match asc {
            Some(asc) => match parse_audio_specific_config(&asc) {
                Ok((sample_rate, channels)) => Some(AudioStreamInfo {
                    sample_rate,
                    channels,
                    format: SampleFormat::S16Le,
                    timebase: Timebase::MILLIS,
                    asc,
                }),
                Err(e) => {
                    warn!("Ignoring FLV audio: {}", e);
                    None
                }
            },
            None => None,
        };
        if audio.is_none() {
            index.retain(|e| e.stream != AUDIO_STREAM);
        }

        let fallback = [
            if fps > 0.0 { (1000.0 / fps).round() as i64 } else { 33 },
            audio
                .as_ref()
                .map(|a| 1024 * 1000 / a.sample_rate.max(1) as i64)
                .unwrap_or(21),
        ];
        fill_durations(&mut index, fallback);

        let end_ms = index.iter().map(|e| e.dts + e.duration).max().unwrap_or(0);
        let duration = match metadata.get("duration").copied() {
            Some(d) if d > 0.0 => d,
            _ => end_ms as f64 / 1000.0,
        };
        info!(
            "FLV {}: {} tags, {:.3}s, video={:?} audio={:?}",
            path.display(),
            index.len(),
            duration,
            video.as_ref().map(|v| v.resolution),
            audio.as_ref().map(|a| a.sample_rate)
        );

        Ok(Self {
            file,
            video,
            audio,
            index,
            cursor: 0,
            duration,
        })
    }
}

fn read_body(file: &mut BufReader<File>, size: usize) -> Result<Vec<u8>> {
    let mut body = vec![0u8; size];
    file.read_exact(&mut body)?;
    Ok(body)
}

/// Each packet lasts until the next one of its stream; the last keeps the
/// previous duration
fn fill_durations(index: &mut [TagEntry], fallback: [i64; 2]) {
    for stream in [VIDEO_STREAM, AUDIO_STREAM] {
        let positions: Vec<usize> = index
            .iter()
            .enumerate()
            .filter(|(_, e)| e.stream == stream)
            .map(|(i, _)| i)
            .collect();
        let mut previous = fallback[stream];
        for pair in positions.windows(2) {
            let duration = (index[pair[1]].dts - index[pair[0]].dts).max(0);
            index[pair[0]].duration = duration;
            previous = duration;
        }
        if let Some(&last) = positions.last() {
            index[last].duration = previous;
        }
    }
}

/// Numeric and boolean entries of the `onMetaData` script tag
fn parse_metadata(body: &[u8]) -> HashMap<String, f64> {
    let mut values = HashMap::new();
    let mut pos = 0;
    let read_string = |pos: &mut usize| -> Option<String> {
        let len = u16::from_be_bytes([*body.get(*pos)?, *body.get(*pos + 1)?]) as usize;
        let s = body.get(*pos + 2..*pos + 2 + len)?;
        *pos += 2 + len;
        Some(String::from_utf8_lossy(s).into_owned())
    };

    if body.first() != Some(&0x02) {
        return values;
    }
    pos += 1;
    if read_string(&mut pos).as_deref() != Some("onMetaData") {
        return values;
    }
    match body.get(pos) {
        Some(0x08) => pos += 5,
        Some(0x03) => pos += 1,
        _ => return values,
    }

    while let Some(key) = read_string(&mut pos) {
        if key.is_empty() {
            break;
        }
        let Some(&marker) = body.get(pos) else { break };
        pos += 1;
        match marker {
            0x00 => {
                let Some(raw) = body.get(pos..pos + 8) else { break };
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(raw);
                values.insert(key, f64::from_be_bytes(bytes));
                pos += 8;
            }
            0x01 => {
                let Some(&b) = body.get(pos) else { break };
                values.insert(key, b as f64);
                pos += 1;
            }
            0x02 => {
                if read_string(&mut pos).is_none() {
                    break;
                }
            }
            _ => break,
        }
    }
    values
}

impl ContainerDemuxer for FlvDemuxer {
    fn container(&self) -> Container {
        Container::Flv
    }

    fn video(&self) -> Option<&VideoStreamInfo> {
        self.video.as_ref()
    }

    fn audio(&self) -> Option<&AudioStreamInfo> {
        self.audio.as_ref()
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let Some(entry) = self.index.get(self.cursor).copied() else {
            return Ok(None);
        };
        self.cursor += 1;
        self.file.seek(SeekFrom::Start(entry.offset))?;
        let data = read_body(&mut self.file, entry.size)?;
        Ok(Some(
            Packet::new(data.into(), entry.pts, entry.dts, entry.duration)
                .with_stream(entry.stream)
                .with_key_frame(entry.key),
        ))
    }

    fn seek(&mut self, pts: i64) -> Result<()> {
        let mut target = None;
        for (pos, entry) in self.index.iter().enumerate() {
            if entry.stream != VIDEO_STREAM {
                continue;
            }
            if target.is_none() || (entry.key && entry.pts <= pts) {
                target = Some(pos);
            }
        }
        self.cursor = target
            .ok_or_else(|| AppError::UnsupportedFormat("FLV file has no video tags".to_string()))?;
        Ok(())
    }

    fn duration(&self) -> f64 {
        self.duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AacConfig;
    use crate::testutil::annexb_packet;
    use crate::video::mux::{flv::FlvSink, ContainerSink, VideoParams};
    use crate::video::nal;

    #[test]
    fn test_reads_back_written_tags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.flv");
        let params = VideoParams::h264(Resolution::VGA, 30, 2_000_000);
        let audio = AacConfig::default();
        let mut sink = FlvSink::create(&path, &params, Some(&audio)).unwrap();
        for i in 0..3 {
            let nals: &[u8] = if i == 0 { &[7, 8, 5] } else { &[1] };
            let mut packet = annexb_packet(nals, i);
            packet.duration = 1;
            packet.key_frame = i == 0;
            sink.write_video(&packet).unwrap();
        }
        sink.write_audio(&Packet::new(bytes::Bytes::from_static(&[1, 2, 3]), 0, 0, 1024))
            .unwrap();
        sink.finish().unwrap();

        let mut demuxer = FlvDemuxer::open(&path).unwrap();
        let video = demuxer.video().unwrap();
        assert_eq!(video.resolution, Resolution::VGA);
        assert_eq!(video.fps, 30.0);
        assert!(video.parameter_sets.is_some());
        let info = demuxer.audio().unwrap();
        assert_eq!((info.sample_rate, info.channels), (48000, 1));
        assert!((demuxer.duration() - 0.1).abs() < 1e-9);

        let mut video_dts = Vec::new();
        let mut audio_packets = 0;
        while let Some(packet) = demuxer.read_packet().unwrap() {
            if packet.stream_index == VIDEO_STREAM {
                assert_eq!(nal::split_avcc(packet.data(), 4).unwrap().len(), 1);
                video_dts.push((packet.dts, packet.duration, packet.key_frame));
            } else {
                assert_eq!(packet.data(), &[1, 2, 3]);
                audio_packets += 1;
            }
        }
        assert_eq!(video_dts, vec![(0, 33, true), (33, 34, false), (67, 34, false)]);
        assert_eq!(audio_packets, 1);

        demuxer.seek(50).unwrap();
        assert_eq!(demuxer.read_packet().unwrap().unwrap().dts, 0);
    }

    #[test]
    fn test_metadata_parser() {
        let mut body = vec![0x02, 0x00, 0x0a];
        body.extend_from_slice(b"onMetaData");
        body.extend_from_slice(&[0x08, 0, 0, 0, 2]);
        body.extend_from_slice(&[0x00, 0x05]);
        body.extend_from_slice(b"width");
        body.push(0x00);
        body.extend_from_slice(&320f64.to_be_bytes());
        body.extend_from_slice(&[0x00, 0x06]);
        body.extend_from_slice(b"stereo");
        body.extend_from_slice(&[0x01, 0x01, 0x00, 0x00, 0x09]);
        let values = parse_metadata(&body);
        assert_eq!(values.get("width"), Some(&320.0));
        assert_eq!(values.get("stereo"), Some(&1.0));
    }

    #[test]
    fn test_rejects_non_flv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.flv");
        std::fs::write(&path, b"not a flash video").unwrap();
        assert!(matches!(FlvDemuxer::open(&path), Err(AppError::UnsupportedFormat(_))));
    }
}
