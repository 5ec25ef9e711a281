//! Single-stream record helper
//!
//! `Video` wraps one [`Encoder`] writing straight to a file and a lazily
//! opened decode channel for turning packets back into images.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::camera::Camera;
use crate::error::{AppError, Result};
use crate::video::channel::{
    software_decode_factory, software_encode_factory, CodecChannelConfig, DecodeChannel,
    DecodeChannelFactory, EncodeChannelFactory,
};
use crate::video::encoder::{Encoder, EncoderConfig};
use crate::video::format::{CodecType, PixelFormat, Resolution, VideoType};
use crate::video::frame::Image;
use crate::video::packet::Packet;

const DECODE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Construction options for [`Video`]
#[derive(Debug, Clone, PartialEq)]
pub struct VideoOptions {
    /// Output used when `open` gets no path
    pub path: PathBuf,
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub time_base: u32,
    pub framerate: u32,
    pub capture: bool,
    /// Open immediately
    pub open: bool,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            resolution: Resolution::QHD1440,
            format: PixelFormat::Nv21,
            time_base: 30,
            framerate: 30,
            capture: false,
            open: true,
        }
    }
}

pub struct Video {
    options: VideoOptions,
    path: PathBuf,
    fps: u32,
    encoder: Option<Encoder>,
    decoder: Option<Box<DecodeChannel>>,
    camera: Option<Arc<dyn Camera>>,
    encode_factory: EncodeChannelFactory,
    decode_factory: DecodeChannelFactory,
    opened: bool,
}

impl Video {
    pub fn new(options: VideoOptions) -> Result<Self> {
        Self::with_factories(options, software_encode_factory(), software_decode_factory())
    }

    pub fn with_factories(
        options: VideoOptions,
        encode_factory: EncodeChannelFactory,
        decode_factory: DecodeChannelFactory,
    ) -> Result<Self> {
        let mut video = Self {
            path: options.path.clone(),
            fps: options.framerate,
            options,
            encoder: None,
            decoder: None,
            camera: None,
            encode_factory,
            decode_factory,
            opened: false,
        };
        if video.options.open {
            video.open(None, None)?;
        }
        Ok(video)
    }

    /// Start a session on `path` (or the constructor's path) at `fps`
    /// (or the constructor's frame rate). Opening twice is a no-op.
    pub fn open(&mut self, path: Option<&Path>, fps: Option<u32>) -> Result<()> {
        if self.opened {
            return Ok(());
        }
        if let Some(path) = path.filter(|p| !p.as_os_str().is_empty()) {
            self.path = path.to_path_buf();
        }
        self.fps = fps.unwrap_or(self.options.framerate).max(1);
        if !self.path.as_os_str().is_empty() {
            VideoType::resolve(&self.path, VideoType::H264Mp4)?;
        }
        self.opened = true;
        info!(
            "Video opened: {} {} @ {}fps",
            self.path.display(),
            self.options.resolution,
            self.fps
        );
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if !self.opened {
            return Ok(());
        }
        self.opened = false;
        let mut result = self.finish();
        if let Some(mut decoder) = self.decoder.take() {
            result = result.and(decoder.close());
        }
        debug!("Video closed");
        result
    }

    /// Frames passed to `encode(None)` are read from `camera`
    pub fn bind_camera(&mut self, camera: Arc<dyn Camera>) -> Result<()> {
        if camera.format() != PixelFormat::Nv21 {
            return Err(AppError::Config(format!(
                "Video only records NV21 cameras, got {}",
                camera.format()
            )));
        }
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.bind_camera(camera.clone())?;
        }
        self.camera = Some(camera);
        Ok(())
    }

    fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            resolution: self.options.resolution,
            format: self.options.format,
            video_type: VideoType::H264Mp4,
            framerate: self.fps,
            time_base: self.options.time_base.max(1),
            capture: self.options.capture,
            ..EncoderConfig::default()
        }
        .with_path(&self.path)
    }

    /// Encode one frame into the output file, starting it on first use
    pub fn encode(&mut self, image: Option<&Image>) -> Result<Packet> {
        if !self.opened {
            return Err(AppError::NotOpen("video is not opened".to_string()));
        }
        if self.encoder.is_none() {
            let mut encoder = Encoder::with_factory(self.encoder_config(), self.encode_factory.clone())?;
            if let Some(camera) = &self.camera {
                encoder.bind_camera(camera.clone())?;
            }
            self.encoder = Some(encoder);
        }
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| AppError::NotReady("encoder missing".to_string()))?;
        encoder.encode(image, None)
    }

    /// Decode one Annex-B packet, returning its picture if one is ready
    pub fn decode(&mut self, packet: Option<&Packet>) -> Result<Option<Image>> {
        if !self.opened {
            return Err(AppError::NotOpen("video is not opened".to_string()));
        }
        let Some(packet) = packet else {
            return Err(AppError::InvalidArgs("decode needs a packet".to_string()));
        };
        if self.decoder.is_none() {
            let mut channel = (self.decode_factory)();
            channel.open(&CodecChannelConfig::decode(
                CodecType::H264,
                self.options.resolution,
                PixelFormat::Nv21,
            ))?;
            self.decoder = Some(channel);
        }
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| AppError::NotReady("decoder missing".to_string()))?;
        decoder.push(packet.data(), DECODE_TIMEOUT)?;
        decoder.pop(DECODE_TIMEOUT)
    }

    /// Complete the current output file; the next `encode` starts a new one
    pub fn finish(&mut self) -> Result<()> {
        match self.encoder.take() {
            Some(mut encoder) => encoder.close(),
            None => Ok(()),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.encoder.as_ref().map(|e| e.frames() > 0).unwrap_or(false)
    }

    pub fn is_opened(&self) -> bool {
        self.opened
    }

    pub fn is_closed(&self) -> bool {
        !self.opened
    }

    pub fn capture(&self) -> Option<&Image> {
        self.encoder.as_ref().and_then(|e| e.capture())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn width(&self) -> u32 {
        self.encoder
            .as_ref()
            .map(|e| e.width())
            .unwrap_or(self.options.resolution.width)
    }

    pub fn height(&self) -> u32 {
        self.encoder
            .as_ref()
            .map(|e| e.height())
            .unwrap_or(self.options.resolution.height)
    }
}

impl Drop for Video {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Video close on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{scripted_decode_factory, scripted_encode_factory, MockCamera};

    fn options(path: PathBuf) -> VideoOptions {
        VideoOptions {
            path,
            resolution: Resolution::QVGA,
            open: false,
            ..VideoOptions::default()
        }
    }

    #[test]
    fn test_default_options() {
        let opts = VideoOptions::default();
        assert_eq!(opts.resolution, Resolution::QHD1440);
        assert_eq!((opts.time_base, opts.framerate), (30, 30));
        assert!(opts.open && !opts.capture);
    }

    #[test]
    fn test_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        let (enc, log) = scripted_encode_factory(vec![3, 1, 1, 1]);
        let (dec, _) = scripted_decode_factory();
        let mut video = Video::with_factories(options(path.clone()), enc, dec).unwrap();
        assert!(video.is_closed());
        let img = Image::zeroed(Resolution::QVGA, PixelFormat::Nv21);
        assert!(matches!(video.encode(Some(&img)), Err(AppError::NotOpen(_))));

        video.open(None, Some(25)).unwrap();
        assert!(video.is_opened() && !video.is_recording());
        for _ in 0..4 {
            video.encode(Some(&img)).unwrap();
        }
        assert!(video.is_recording());
        video.finish().unwrap();
        assert!(!video.is_recording());
        assert_eq!(log.lock().closes, 1);

        let size = std::fs::metadata(&path).unwrap().len();
        let reader = std::io::BufReader::new(std::fs::File::open(&path).unwrap());
        let mp4 = mp4::Mp4Reader::read_header(reader, size).unwrap();
        assert_eq!(mp4.tracks().get(&1).unwrap().sample_count(), 4);

        video.close().unwrap();
        assert!(video.is_closed());
    }

    #[test]
    fn test_camera_binding() {
        let dir = tempfile::tempdir().unwrap();
        let (enc, _) = scripted_encode_factory(vec![3]);
        let (dec, _) = scripted_decode_factory();
        let mut opts = options(dir.path().join("cam.mp4"));
        opts.open = true;
        opts.capture = true;
        let mut video = Video::with_factories(opts, enc, dec).unwrap();
        let gray = Arc::new(MockCamera::new(Resolution::QVGA, PixelFormat::Grayscale));
        assert!(matches!(video.bind_camera(gray), Err(AppError::Config(_))));

        let camera = Arc::new(MockCamera::new(Resolution::QVGA, PixelFormat::Nv21));
        video.bind_camera(camera.clone()).unwrap();
        video.encode(None).unwrap();
        assert_eq!(camera.outstanding(), 0);
        assert_eq!(video.capture().unwrap().resolution(), Resolution::QVGA);
        assert_eq!((video.width(), video.height()), (320, 240));
    }

    #[test]
    fn test_close_failure_still_closes() {
        let dir = tempfile::tempdir().unwrap();
        let (enc, _) = scripted_encode_factory(vec![3]);
        let (dec, dec_log) = scripted_decode_factory();
        let mut opts = options(dir.path().join("fail.h264"));
        opts.open = true;
        let mut video = Video::with_factories(opts, enc, dec).unwrap();
        let img = Image::zeroed(Resolution::QVGA, PixelFormat::Nv21);
        let packet = video.encode(Some(&img)).unwrap();
        assert!(video.decode(Some(&packet)).unwrap().is_some());

        dec_log.lock().fail_close = true;
        assert!(matches!(video.close(), Err(AppError::Runtime(_))));
        assert!(video.is_closed());
        assert_eq!(dec_log.lock().closes, 1);
        video.close().unwrap();
        assert!(matches!(video.encode(Some(&img)), Err(AppError::NotOpen(_))));
    }

    #[test]
    fn test_decode_software_packet() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path().join("clip.h264"));
        opts.open = true;
        let mut video = Video::new(opts).unwrap();
        let img = Image::zeroed(Resolution::QVGA, PixelFormat::Nv21);
        let packet = video.encode(Some(&img)).unwrap();
        assert!(!packet.is_empty());
        let decoded = video.decode(Some(&packet)).unwrap().unwrap();
        assert_eq!(decoded.resolution(), Resolution::QVGA);
        assert!(matches!(video.decode(None), Err(AppError::InvalidArgs(_))));
    }
}
