//! Container demuxing
//!
//! A demuxer yields elementary-stream packets in file order, each in the
//! container's native framing (AVCC for MP4/FLV, Annex-B for raw streams).
//! [`AnnexBFilter`] normalizes video packets to the start-code framing the
//! decode channel accepts.

mod annexb;
mod flv;
mod mp4;

use std::path::Path;
use tracing::debug;

use crate::audio::SampleFormat;
use crate::error::{AppError, Result};
use crate::video::format::{CodecType, Container, Resolution, Timebase};
use crate::video::nal::{self, nal_type, ParameterSets};
use crate::video::packet::Packet;

pub use self::annexb::AnnexBDemuxer;
pub use self::flv::FlvDemuxer;
pub use self::mp4::Mp4Demuxer;
pub use crate::video::mux::{AUDIO_STREAM, VIDEO_STREAM};

/// Frame rate assumed for raw elementary streams
pub const RAW_STREAM_FPS: u32 = 30;

/// Video stream properties found while probing
#[derive(Debug, Clone)]
pub struct VideoStreamInfo {
    pub codec: CodecType,
    pub resolution: Resolution,
    pub timebase: Timebase,
    pub fps: f64,
    pub bitrate: u32,
    /// Out-of-band parameter sets (avcC / AVC sequence header)
    pub parameter_sets: Option<ParameterSets>,
    /// NAL length prefix size; None for Annex-B packets
    pub length_size: Option<usize>,
}

/// Audio stream properties found while probing
#[derive(Debug, Clone)]
pub struct AudioStreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    pub timebase: Timebase,
    /// AudioSpecificConfig
    pub asc: Vec<u8>,
}

/// Reads one container file
pub trait ContainerDemuxer: Send {
    fn container(&self) -> Container;

    fn video(&self) -> Option<&VideoStreamInfo>;

    fn audio(&self) -> Option<&AudioStreamInfo>;

    /// Next packet in file order, `None` at end of file.
    ///
    /// `stream_index` is [`VIDEO_STREAM`] or [`AUDIO_STREAM`]; timestamps are in
    /// that stream's time base.
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// Reposition so the next video packet read is the last sync sample whose
    /// pts is at or before `pts` (video time base), or the first video packet
    /// when none precedes it.
    fn seek(&mut self, pts: i64) -> Result<()>;

    /// Container duration in seconds, 0 when the container has none
    fn duration(&self) -> f64;
}

/// Open a demuxer chosen by the file suffix
pub fn open(path: &Path) -> Result<Box<dyn ContainerDemuxer>> {
    if !path.exists() {
        return Err(AppError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} does not exist", path.display()),
        )));
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let demuxer: Box<dyn ContainerDemuxer> = match ext.as_str() {
        "mp4" => Box::new(Mp4Demuxer::open(path)?),
        "flv" => Box::new(FlvDemuxer::open(path)?),
        "h264" | "264" => Box::new(AnnexBDemuxer::open(path, RAW_STREAM_FPS)?),
        "h265" | "265" | "hevc" => {
            return Err(AppError::UnsupportedFormat(format!(
                "H.265 decoding is not supported ({})",
                path.display()
            )))
        }
        _ => {
            return Err(AppError::UnsupportedFormat(format!(
                "Unknown container for {}",
                path.display()
            )))
        }
    };
    debug!(
        "Opened {:?} demuxer for {} (video={}, audio={})",
        demuxer.container(),
        path.display(),
        demuxer.video().is_some(),
        demuxer.audio().is_some()
    );
    Ok(demuxer)
}

/// Length-prefixed to start-code conversion for video packets
///
/// Parameter sets from the container header are inserted ahead of any IDR
/// slice that does not already carry its own SPS, so every sync sample is
/// decodable on its own.
#[derive(Debug, Clone)]
pub struct AnnexBFilter {
    length_size: Option<usize>,
    parameter_sets: Option<ParameterSets>,
}

impl AnnexBFilter {
    pub fn new(info: &VideoStreamInfo) -> Self {
        Self {
            length_size: info.length_size,
            parameter_sets: info.parameter_sets.clone(),
        }
    }

    /// Filter for streams already in Annex-B framing
    pub fn passthrough() -> Self {
        Self {
            length_size: None,
            parameter_sets: None,
        }
    }

    pub fn filter(&self, data: &[u8]) -> Result<Vec<u8>> {
        let Some(length_size) = self.length_size else {
            return Ok(data.to_vec());
        };
        let nals = nal::split_avcc(data, length_size)?;
        let has_idr = nals.iter().any(|n| nal::h264_type(n) == nal_type::IDR_SLICE);
        let has_sps = nals.iter().any(|n| nal::h264_type(n) == nal_type::SPS);

        let mut out = Vec::with_capacity(data.len() + 64);
        if has_idr && !has_sps {
            if let Some(sets) = &self.parameter_sets {
                out.extend_from_slice(&sets.to_annexb());
            }
        }
        out.extend_from_slice(&nal::to_annexb(nals));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(length_size: Option<usize>) -> VideoStreamInfo {
        VideoStreamInfo {
            codec: CodecType::H264,
            resolution: Resolution::VGA,
            timebase: Timebase::new(1, 30),
            fps: 30.0,
            bitrate: 0,
            parameter_sets: Some(ParameterSets {
                sps: vec![0x67, 0x42, 0x00, 0x1e],
                pps: vec![0x68, 0xce],
            }),
            length_size,
        }
    }

    #[test]
    fn test_filter_inserts_parameter_sets_before_idr() {
        let filter = AnnexBFilter::new(&info(Some(4)));
        let idr = nal::annexb_to_avcc(&nal::to_annexb([&[0x65u8, 0x88][..]]));
        let out = filter.filter(&idr).unwrap();
        assert_eq!(nal::nal_types(&out), vec![7, 8, 5]);

        let p = nal::annexb_to_avcc(&nal::to_annexb([&[0x41u8, 0x9a][..]]));
        assert_eq!(nal::nal_types(&filter.filter(&p).unwrap()), vec![1]);
    }

    #[test]
    fn test_filter_passthrough_and_truncation() {
        let data = nal::to_annexb([&[0x41u8, 0x9a][..]]);
        assert_eq!(AnnexBFilter::passthrough().filter(&data).unwrap(), data);

        let filter = AnnexBFilter::new(&info(Some(4)));
        assert!(filter.filter(&[0, 0, 0, 9, 0x65]).is_err());
    }

    #[test]
    fn test_open_rejects_unknown_and_h265() {
        let dir = tempfile::tempdir().unwrap();
        let hevc = dir.path().join("clip.h265");
        std::fs::write(&hevc, [0u8; 8]).unwrap();
        assert!(matches!(open(&hevc), Err(AppError::UnsupportedFormat(_))));

        let avi = dir.path().join("clip.avi");
        std::fs::write(&avi, [0u8; 8]).unwrap();
        assert!(matches!(open(&avi), Err(AppError::UnsupportedFormat(_))));

        assert!(matches!(open(&dir.path().join("missing.mp4")), Err(AppError::Io(_))));
    }
}
