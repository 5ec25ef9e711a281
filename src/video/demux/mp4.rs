use mp4::{MediaType as Mp4MediaType, Mp4Reader, Mp4Track, TrackType};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info, warn};

use super::{AudioStreamInfo, ContainerDemuxer, VideoStreamInfo, AUDIO_STREAM, VIDEO_STREAM};
use crate::audio::{AacConfig, SampleFormat};
use crate::error::{AppError, Result};
use crate::video::format::{CodecType, Container, Resolution, Timebase};
use crate::video::nal::ParameterSets;
use crate::video::packet::Packet;

/// One sample of the merged sample table
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    stream: usize,
    sample_id: u32,
    /// Decode time in seconds, used to interleave the tracks
    time: f64,
    pts: i64,
    sync: bool,
}

/// ISO BMFF reader
///
/// The sample tables of the video and audio tracks are merged into one
/// time-ordered index at open; reads walk that index.
pub struct Mp4Demuxer {
    reader: Mp4Reader<BufReader<File>>,
    video_track: Option<u32>,
    audio_track: Option<u32>,
    video: Option<VideoStreamInfo>,
    audio: Option<AudioStreamInfo>,
    index: Vec<IndexEntry>,
    cursor: usize,
    duration: f64,
}

impl Mp4Demuxer {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let reader = Mp4Reader::read_header(BufReader::new(file), size)?;

        let mut track_ids: Vec<u32> = reader.tracks().keys().copied().collect();
        track_ids.sort_unstable();

        let mut video_track = None;
        let mut audio_track = None;
        let mut video = None;
        let mut audio = None;
        for id in track_ids {
            let Some(track) = reader.tracks().get(&id) else {
                continue;
            };
            match track.track_type() {
                Ok(TrackType::Video) if video_track.is_none() => {
                    video = Some(video_stream_info(track, path)?);
                    video_track = Some(id);
                }
                Ok(TrackType::Audio) if audio_track.is_none() => match audio_stream_info(track) {
                    Ok(info) => {
                        audio = Some(info);
                        audio_track = Some(id);
                    }
                    Err(e) => warn!("Ignoring audio track {} in {}: {}", id, path.display(), e),
                },
                _ => debug!("Skipping track {} in {}", id, path.display()),
            }
        }

        let mut index = Vec::new();
        if let Some(id) = video_track {
            if let Some(track) = reader.tracks().get(&id) {
                index.extend(sample_index(track, VIDEO_STREAM));
            }
        }
        if let Some(id) = audio_track {
            if let Some(track) = reader.tracks().get(&id) {
                index.extend(sample_index(track, AUDIO_STREAM));
            }
        }
        index.sort_by(|a, b| {
            a.time
                .total_cmp(&b.time)
                .then(a.stream.cmp(&b.stream))
                .then(a.sample_id.cmp(&b.sample_id))
        });

        let duration = reader.duration().as_secs_f64();
        info!(
            "MP4 {}: {} samples, {:.3}s, video={:?} audio={:?}",
            path.display(),
            index.len(),
            duration,
            video.as_ref().map(|v: &VideoStreamInfo| v.resolution),
            audio.as_ref().map(|a: &AudioStreamInfo| a.sample_rate)
        );

        Ok(Self {
            reader,
            video_track,
            audio_track,
            video,
            audio,
            index,
            cursor: 0,
            duration,
        })
    }

    fn track_id(&self, stream: usize) -> Option<u32> {
        if stream == VIDEO_STREAM {
            self.video_track
        } else {
            self.audio_track
        }
    }
}

fn video_stream_info(track: &Mp4Track, path: &Path) -> Result<VideoStreamInfo> {
    match track.media_type()? {
        Mp4MediaType::H264 => {}
        Mp4MediaType::H265 => {
            return Err(AppError::UnsupportedFormat(format!(
                "H.265 video in {} cannot be decoded",
                path.display()
            )))
        }
        other => {
            return Err(AppError::UnsupportedFormat(format!(
                "{} video in {} cannot be decoded",
                other,
                path.display()
            )))
        }
    }

    let parameter_sets = match (track.sequence_parameter_set(), track.picture_parameter_set()) {
        (Ok(sps), Ok(pps)) => Some(ParameterSets {
            sps: sps.to_vec(),
            pps: pps.to_vec(),
        }),
        _ => None,
    };
    let length_size = track
        .trak
        .mdia
        .minf
        .stbl
        .stsd
        .avc1
        .as_ref()
        .map(|avc1| avc1.avcc.length_size_minus_one as usize + 1)
        .unwrap_or(4);

    Ok(VideoStreamInfo {
        codec: CodecType::H264,
        resolution: Resolution::new(track.width() as u32, track.height() as u32),
        timebase: Timebase::new(1, track.timescale() as i32),
        fps: track.frame_rate(),
        bitrate: track.bitrate(),
        parameter_sets,
        length_size: Some(length_size),
    })
}

fn audio_stream_info(track: &Mp4Track) -> Result<AudioStreamInfo> {
    if track.media_type()? != Mp4MediaType::AAC {
        return Err(AppError::UnsupportedFormat("only AAC audio is decoded".to_string()));
    }
    let sample_rate = track.sample_freq_index()?.freq();
    let channels = track.channel_config()? as u16;
    let asc = AacConfig {
        sample_rate,
        channels,
        bitrate: track.bitrate(),
        format: SampleFormat::S16Le,
    }
    .audio_specific_config();
    Ok(AudioStreamInfo {
        sample_rate,
        channels,
        format: SampleFormat::S16Le,
        timebase: Timebase::new(1, track.timescale() as i32),
        asc: asc.to_vec(),
    })
}

/// Expand stts/ctts/stss run-length tables into per-sample entries
fn sample_index(track: &Mp4Track, stream: usize) -> Vec<IndexEntry> {
    let stbl = &track.trak.mdia.minf.stbl;
    let timescale = track.timescale().max(1) as f64;
    let count = track.sample_count() as usize;

    let mut offsets = Vec::with_capacity(count);
    if let Some(ctts) = &stbl.ctts {
        for entry in &ctts.entries {
            offsets.extend(std::iter::repeat(entry.sample_offset as i64).take(entry.sample_count as usize));
        }
    }
    let sync: Option<&[u32]> = stbl.stss.as_ref().map(|stss| stss.entries.as_slice());

    let mut entries = Vec::with_capacity(count);
    let mut dts: i64 = 0;
    let mut sample_id: u32 = 1;
    'runs: for run in &stbl.stts.entries {
        for _ in 0..run.sample_count {
            if entries.len() >= count {
                break 'runs;
            }
            let offset = offsets.get(sample_id as usize - 1).copied().unwrap_or(0);
            entries.push(IndexEntry {
                stream,
                sample_id,
                time: dts as f64 / timescale,
                pts: dts + offset,
                sync: sync.map(|s| s.binary_search(&sample_id).is_ok()).unwrap_or(true),
            });
            dts += run.sample_delta as i64;
            sample_id += 1;
        }
    }
    entries
}

impl ContainerDemuxer for Mp4Demuxer {
    fn container(&self) -> Container {
        Container::Mp4
    }

    fn video(&self) -> Option<&VideoStreamInfo> {
        self.video.as_ref()
    }

    fn audio(&self) -> Option<&AudioStreamInfo> {
        self.audio.as_ref()
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        while let Some(entry) = self.index.get(self.cursor).copied() {
            self.cursor += 1;
            let Some(track) = self.track_id(entry.stream) else {
                continue;
            };
            let Some(sample) = self.reader.read_sample(track, entry.sample_id)? else {
                warn!("MP4 sample {} of track {} missing", entry.sample_id, track);
                continue;
            };
            let dts = sample.start_time as i64;
            let packet = Packet::new(
                sample.bytes,
                dts + sample.rendering_offset as i64,
                dts,
                sample.duration as i64,
            )
            .with_stream(entry.stream)
            .with_key_frame(sample.is_sync);
            return Ok(Some(packet));
        }
        Ok(None)
    }

    fn seek(&mut self, pts: i64) -> Result<()> {
        let mut target = None;
        for (pos, entry) in self.index.iter().enumerate() {
            if entry.stream != VIDEO_STREAM {
                continue;
            }
            if target.is_none() {
                target = Some(pos);
            }
            if entry.sync && entry.pts <= pts {
                target = Some(pos);
            }
        }
        let pos = target
            .ok_or_else(|| AppError::UnsupportedFormat("MP4 file has no video samples".to_string()))?;
        debug!("MP4 seek to pts {} lands on index {}", pts, pos);
        self.cursor = pos;
        Ok(())
    }

    fn duration(&self) -> f64 {
        self.duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{write_test_mp4, TestSample};
    use crate::video::nal;

    #[test]
    fn test_stream_info_and_read_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        let samples: Vec<TestSample> = (0..6)
            .map(|i| TestSample::new(i, i, 1, i % 3 == 0))
            .collect();
        write_test_mp4(&path, Timebase::new(1, 30), &samples);

        let mut demuxer = Mp4Demuxer::open(&path).unwrap();
        let video = demuxer.video().unwrap();
        assert_eq!(video.resolution, Resolution::VGA);
        assert_eq!(video.timebase, Timebase::new(1, 30));
        assert_eq!(video.length_size, Some(4));
        assert!(video.parameter_sets.is_some());
        assert!(demuxer.audio().is_none());

        let mut pts = Vec::new();
        while let Some(packet) = demuxer.read_packet().unwrap() {
            assert_eq!(packet.stream_index, VIDEO_STREAM);
            assert!(nal::split_avcc(packet.data(), 4).is_ok());
            pts.push((packet.pts, packet.key_frame));
        }
        assert_eq!(
            pts,
            vec![(0, true), (1, false), (2, false), (3, true), (4, false), (5, false)]
        );
    }

    #[test]
    fn test_seek_lands_on_preceding_sync_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        let samples: Vec<TestSample> = (0..9)
            .map(|i| TestSample::new(i, i, 1, i % 3 == 0))
            .collect();
        write_test_mp4(&path, Timebase::new(1, 30), &samples);

        let mut demuxer = Mp4Demuxer::open(&path).unwrap();
        demuxer.seek(5).unwrap();
        assert_eq!(demuxer.read_packet().unwrap().unwrap().pts, 3);
        demuxer.seek(6).unwrap();
        assert_eq!(demuxer.read_packet().unwrap().unwrap().pts, 6);
        demuxer.seek(-10).unwrap();
        assert_eq!(demuxer.read_packet().unwrap().unwrap().pts, 0);
    }
}
