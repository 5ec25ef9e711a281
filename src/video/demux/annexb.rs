use bytes::Bytes;
use std::path::Path;
use tracing::{debug, info};

use super::{AudioStreamInfo, ContainerDemuxer, VideoStreamInfo, VIDEO_STREAM};
use crate::error::{AppError, Result};
use crate::video::format::{CodecType, Container, Resolution, Timebase};
use crate::video::nal::{self, nal_type, ParameterSets, SpsInfo};
use crate::video::packet::Packet;

/// Raw H.264 elementary stream, one packet per access unit
///
/// The stream has no timing of its own: packet `n` gets pts `n` in a
/// `1/fps` time base.
pub struct AnnexBDemuxer {
    units: Vec<Bytes>,
    info: VideoStreamInfo,
    cursor: usize,
}

impl AnnexBDemuxer {
    pub fn open(path: &Path, fps: u32) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data, fps).map_err(|e| match e {
            AppError::UnsupportedFormat(msg) => {
                AppError::UnsupportedFormat(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn from_bytes(data: &[u8], fps: u32) -> Result<Self> {
        let units: Vec<Bytes> = nal::split_access_units(data)
            .into_iter()
            .map(Bytes::from)
            .collect();
        if units.is_empty() {
            return Err(AppError::UnsupportedFormat("no NAL units found".to_string()));
        }

        let parameter_sets = ParameterSets::from_annexb(data);
        let resolution = match parameter_sets.as_ref().map(|s| SpsInfo::parse(&s.sps)) {
            Some(Ok(sps)) => Resolution::new(sps.width, sps.height),
            Some(Err(e)) => {
                debug!("SPS not parseable, size unknown until first frame: {}", e);
                Resolution::new(0, 0)
            }
            None => Resolution::new(0, 0),
        };
        let fps = fps.max(1);
        info!("Annex-B stream: {} access units, {}", units.len(), resolution);

        Ok(Self {
            units,
            info: VideoStreamInfo {
                codec: CodecType::H264,
                resolution,
                timebase: Timebase::new(1, fps as i32),
                fps: fps as f64,
                bitrate: 0,
                parameter_sets,
                length_size: None,
            },
            cursor: 0,
        })
    }
}

impl ContainerDemuxer for AnnexBDemuxer {
    fn container(&self) -> Container {
        Container::Raw
    }

    fn video(&self) -> Option<&VideoStreamInfo> {
        Some(&self.info)
    }

    fn audio(&self) -> Option<&AudioStreamInfo> {
        None
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let Some(unit) = self.units.get(self.cursor) else {
            return Ok(None);
        };
        let pts = self.cursor as i64;
        self.cursor += 1;
        let key = nal::contains_nal(unit, &[nal_type::IDR_SLICE]);
        Ok(Some(
            Packet::new(unit.clone(), pts, pts, 1)
                .with_stream(VIDEO_STREAM)
                .with_key_frame(key),
        ))
    }

    fn seek(&mut self, pts: i64) -> Result<()> {
        let last = pts.clamp(0, self.units.len() as i64 - 1) as usize;
        self.cursor = (0..=last)
            .rev()
            .find(|&i| nal::contains_nal(&self.units[i], &[nal_type::IDR_SLICE, nal_type::SPS]))
            .unwrap_or(0);
        Ok(())
    }

    fn duration(&self) -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::annexb_packet;

    fn stream() -> Vec<u8> {
        let mut data = Vec::new();
        for i in 0..6 {
            let nals: &[u8] = if i % 3 == 0 { &[7, 8, 5] } else { &[1] };
            data.extend_from_slice(annexb_packet(nals, i).data());
        }
        data
    }

    #[test]
    fn test_access_units_become_packets() {
        let mut demuxer = AnnexBDemuxer::from_bytes(&stream(), 25).unwrap();
        assert_eq!(demuxer.video().unwrap().timebase, Timebase::new(1, 25));
        assert_eq!(demuxer.duration(), 0.0);
        let mut seen = Vec::new();
        while let Some(packet) = demuxer.read_packet().unwrap() {
            seen.push((packet.pts, packet.key_frame));
        }
        assert_eq!(
            seen,
            vec![(0, true), (1, false), (2, false), (3, true), (4, false), (5, false)]
        );
    }

    #[test]
    fn test_seek_to_parameter_sets() {
        let mut demuxer = AnnexBDemuxer::from_bytes(&stream(), 30).unwrap();
        demuxer.seek(5).unwrap();
        assert_eq!(demuxer.read_packet().unwrap().unwrap().pts, 3);
        demuxer.seek(2).unwrap();
        assert_eq!(demuxer.read_packet().unwrap().unwrap().pts, 0);
    }

    #[test]
    fn test_empty_stream_rejected() {
        assert!(AnnexBDemuxer::from_bytes(&[1, 2, 3], 30).is_err());
    }
}
