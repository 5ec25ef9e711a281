//! Background camera recorder
//!
//! A [`VideoRecorder`] owns one worker thread that runs from `open()` to
//! `close()`. The worker and the control methods share a single control
//! block behind a mutex. While IDLE the worker previews camera frames on
//! the bound display and refreshes the snapshot cache; while RECORD it also
//! overlays rectangles, encodes and muxes every frame.
//!
//! Every `config_*` call is refused with [`AppError::Busy`] while recording.

mod overlay;
mod worker;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audio::{pcm_bytes_per_video_frame, AacConfig, AudioRecorder};
use crate::camera::Camera;
use crate::config::RecorderSettings;
use crate::display::{Display, Fit};
use crate::error::{AppError, Result};
use crate::video::channel::{software_encode_factory, EncodeChannelFactory};
use crate::video::encoder::{Encoder, EncoderConfig};
use crate::video::format::{PixelFormat, Resolution, VideoType};
use crate::video::frame::Image;

pub use overlay::{draw_overlays, Color, RectOverlay, MAX_RECTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    Idle,
    Record,
    /// Reserved
    DisplayOnly,
    Unknown,
}

/// Resources that exist only while recording
struct Session {
    encoder: Encoder,
    /// PCM bytes pulled per video frame, 0 without audio
    audio_bytes: usize,
    started: Instant,
}

/// Everything the control thread and the worker share
struct Control {
    state: RecorderState,
    camera: Option<Arc<dyn Camera>>,
    display: Option<Arc<dyn Display>>,
    fit: Fit,
    audio: Option<Arc<dyn AudioRecorder>>,
    path: PathBuf,
    resolution: Option<Resolution>,
    fps: u32,
    bitrate: u32,
    snapshot_enabled: bool,
    snapshot_camera: Option<Arc<dyn Camera>>,
    snapshot: Option<Image>,
    rects: [RectOverlay; MAX_RECTS],
    session: Option<Session>,
    frames: u64,
    camera_timeout: Duration,
    idle_sleep: Duration,
}

impl Control {
    fn new(settings: &RecorderSettings) -> Self {
        let mut control = Self {
            state: RecorderState::Idle,
            camera: None,
            display: None,
            fit: settings.display_fit,
            audio: None,
            path: PathBuf::new(),
            resolution: None,
            fps: 0,
            bitrate: 0,
            snapshot_enabled: false,
            snapshot_camera: None,
            snapshot: None,
            rects: [RectOverlay::default(); MAX_RECTS],
            session: None,
            frames: 0,
            camera_timeout: Duration::from_millis(settings.camera_timeout_ms.max(1)),
            idle_sleep: Duration::from_millis(settings.idle_sleep_ms),
        };
        control.apply_defaults(settings);
        control
    }

    /// Restore configuration; bound collaborators are kept
    fn apply_defaults(&mut self, settings: &RecorderSettings) {
        self.path = PathBuf::from(&settings.path);
        self.resolution = settings.resolution;
        self.fps = settings.fps;
        self.bitrate = settings.bitrate;
        self.snapshot_enabled = false;
        self.snapshot_camera = None;
        self.snapshot = None;
        for (id, rect) in self.rects.iter_mut().enumerate() {
            *rect = RectOverlay {
                id,
                ..RectOverlay::default()
            };
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.state != RecorderState::Idle {
            return Err(AppError::Busy(format!(
                "configuration is locked while {:?}",
                self.state
            )));
        }
        Ok(())
    }

    fn bound_camera(&self) -> Result<Arc<dyn Camera>> {
        self.camera
            .clone()
            .ok_or_else(|| AppError::NotReady("bind a camera first".to_string()))
    }
}

struct Shared {
    control: Mutex<Control>,
    exit: AtomicBool,
    /// Muxer position of the running recording in ms
    seek_ms: AtomicI64,
}

/// Held control lock; dropping it (or [`RecorderLock::unlock`]) releases
/// the worker.
pub struct RecorderLock<'a> {
    guard: MutexGuard<'a, Control>,
}

impl RecorderLock<'_> {
    pub fn state(&self) -> RecorderState {
        self.guard.state
    }

    pub fn unlock(self) {}
}

pub struct VideoRecorder {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    settings: RecorderSettings,
    factory: EncodeChannelFactory,
}

impl VideoRecorder {
    pub fn new(settings: RecorderSettings) -> Self {
        Self::with_factory(settings, software_encode_factory())
    }

    /// Recorder whose encode channels come from `factory`
    pub fn with_factory(settings: RecorderSettings, factory: EncodeChannelFactory) -> Self {
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(Control::new(&settings)),
                exit: AtomicBool::new(false),
                seek_ms: AtomicI64::new(0),
            }),
            worker: Mutex::new(None),
            settings,
            factory,
        }
    }

    /// Start the worker thread; a second call is a no-op
    pub fn open(&self) -> Result<()> {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            return Ok(());
        }
        self.shared.exit.store(false, Ordering::Release);
        *slot = Some(worker::spawn(self.shared.clone())?);
        info!("Video recorder opened");
        Ok(())
    }

    /// Finish any recording and stop the worker
    pub fn close(&self) -> Result<()> {
        let result = self.record_finish();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            self.shared.exit.store(true, Ordering::Release);
            if handle.join().is_err() {
                warn!("Recorder worker panicked");
            }
            info!("Video recorder closed");
        }
        result
    }

    pub fn is_opened(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Take the control lock, waiting at most `timeout` (`None` waits forever)
    pub fn lock(&self, timeout: Option<Duration>) -> Result<RecorderLock<'_>> {
        let guard = match timeout {
            Some(timeout) => self
                .shared
                .control
                .try_lock_for(timeout)
                .ok_or_else(|| AppError::Timeout(format!("recorder lock not acquired in {:?}", timeout)))?,
            None => self.shared.control.lock(),
        };
        Ok(RecorderLock { guard })
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.shared.control.lock()
    }

    pub fn bind_display(&self, display: Arc<dyn Display>, fit: Fit) -> Result<()> {
        let mut control = self.control();
        control.display = Some(display);
        control.fit = fit;
        Ok(())
    }

    pub fn bind_camera(&self, camera: Arc<dyn Camera>) -> Result<()> {
        if camera.format() != PixelFormat::Nv21 {
            return Err(AppError::Config(format!(
                "recorder camera must deliver NV21, got {}",
                camera.format()
            )));
        }
        let mut control = self.control();
        debug!("Recorder bound to camera channel {}", camera.channel());
        control.camera = Some(camera);
        Ok(())
    }

    pub fn bind_audio(&self, audio: Arc<dyn AudioRecorder>) -> Result<()> {
        self.control().audio = Some(audio);
        Ok(())
    }

    /// IMU logging is not available
    pub fn bind_imu(&self) -> Result<()> {
        Err(AppError::NotImplemented("IMU binding".to_string()))
    }

    /// Finish any recording and restore the default configuration
    pub fn reset(&self) -> Result<()> {
        let result = self.record_finish();
        self.control().apply_defaults(&self.settings);
        result
    }

    pub fn config_path(&self, path: impl Into<PathBuf>) -> Result<()> {
        let mut control = self.control();
        control.ensure_idle()?;
        control.path = path.into();
        Ok(())
    }

    pub fn get_path(&self) -> PathBuf {
        self.control().path.clone()
    }

    /// Enable or drop the secondary snapshot channel.
    ///
    /// Without a resolution the snapshot channel matches the camera.
    pub fn config_snapshot(&self, enable: bool, resolution: Option<Resolution>, format: PixelFormat) -> Result<()> {
        let mut control = self.control();
        control.ensure_idle()?;
        let camera = control.bound_camera()?;
        control.snapshot_camera = None;
        control.snapshot = None;
        if enable {
            let resolution = resolution.unwrap_or_else(|| camera.resolution());
            let channel = camera.add_channel(resolution.width, resolution.height, format)?;
            debug!("Snapshot channel {} at {} {}", channel.channel(), resolution, format);
            control.snapshot_camera = Some(channel);
        }
        control.snapshot_enabled = enable;
        Ok(())
    }

    /// Set the recording resolution as `[width, height]` and apply it to the camera
    pub fn config_resolution(&self, resolution: &[u32]) -> Result<()> {
        let &[width, height] = resolution else {
            return Err(AppError::InvalidArgs(format!(
                "resolution needs width and height, got {} values",
                resolution.len()
            )));
        };
        let mut control = self.control();
        control.ensure_idle()?;
        let camera = control.bound_camera()?;
        camera.set_resolution(width, height)?;
        control.resolution = Some(Resolution::new(width, height));
        Ok(())
    }

    /// Configured resolution, else the bound camera's
    pub fn get_resolution(&self) -> Result<Resolution> {
        let control = self.control();
        control
            .resolution
            .or_else(|| control.camera.as_ref().map(|c| c.resolution()))
            .ok_or_else(|| AppError::NotReady("no resolution configured and no camera bound".to_string()))
    }

    pub fn config_fps(&self, fps: u32) -> Result<()> {
        let mut control = self.control();
        control.ensure_idle()?;
        let camera = control.bound_camera()?;
        camera.set_fps(fps)?;
        control.fps = fps;
        Ok(())
    }

    pub fn get_fps(&self) -> u32 {
        self.control().fps
    }

    pub fn config_bitrate(&self, bitrate: u32) -> Result<()> {
        let mut control = self.control();
        control.ensure_idle()?;
        control.bitrate = bitrate;
        Ok(())
    }

    pub fn get_bitrate(&self) -> u32 {
        self.control().bitrate
    }

    /// Query or set mute on the bound audio recorder; false without one
    pub fn mute(&self, mute: Option<bool>) -> bool {
        let control = self.control();
        control.audio.as_ref().map(|a| a.mute(mute)).unwrap_or(false)
    }

    /// Query or set the capture volume (clamped to 100); 0 without audio
    pub fn volume(&self, volume: Option<u32>) -> u32 {
        let control = self.control();
        control
            .audio
            .as_ref()
            .map(|a| a.volume(volume.map(|v| v.min(100))))
            .unwrap_or(0)
    }

    /// Current recording position in ms; read without the lock
    pub fn seek(&self) -> i64 {
        self.shared.seek_ms.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RecorderState {
        self.control().state
    }

    /// Frames pushed to the encoder by the current or last recording
    pub fn frames_recorded(&self) -> u64 {
        self.control().frames
    }

    /// Start encoding camera frames into the configured path
    pub fn record_start(&self) -> Result<()> {
        let mut control = self.control();
        control.ensure_idle()?;
        let camera = control.bound_camera()?;
        if control.path.as_os_str().is_empty() {
            return Err(AppError::Config("record path is not configured".to_string()));
        }

        let resolution = control.resolution.unwrap_or_else(|| camera.resolution());
        let fps = if control.fps > 0 { control.fps } else { camera.fps().max(1) };
        let audio = control.audio.as_ref().map(|a| AacConfig {
            sample_rate: a.sample_rate(),
            channels: a.channels(),
            format: a.format(),
            ..AacConfig::default()
        });
        let config = EncoderConfig {
            resolution,
            format: PixelFormat::Nv21,
            video_type: VideoType::H264Mp4,
            framerate: fps,
            bitrate: control.bitrate,
            audio,
            ..EncoderConfig::default()
        }
        .with_path(&control.path);

        let encoder = Encoder::with_factory(config, self.factory.clone())?;
        let audio_bytes = audio
            .map(|a| pcm_bytes_per_video_frame(a.sample_rate, a.channels, a.format, fps))
            .unwrap_or(0);
        info!(
            "Recording {} at {} {}fps {}bps{}",
            control.path.display(),
            resolution,
            fps,
            control.bitrate,
            if audio.is_some() { " with audio" } else { "" }
        );
        control.session = Some(Session {
            encoder,
            audio_bytes,
            started: Instant::now(),
        });
        control.frames = 0;
        control.state = RecorderState::Record;
        self.shared.seek_ms.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Flush and close the recording; a no-op when idle
    pub fn record_finish(&self) -> Result<()> {
        let mut control = self.control();
        if control.state != RecorderState::Record {
            return Ok(());
        }
        control.state = RecorderState::Idle;
        let Some(mut session) = control.session.take() else {
            return Ok(());
        };
        let result = session.encoder.close();
        info!(
            "Recording {} finished: {} frames in {:.1}s",
            control.path.display(),
            control.frames,
            session.started.elapsed().as_secs_f64()
        );
        result
    }

    /// Move the cached snapshot out
    pub fn snapshot(&self) -> Option<Image> {
        self.control().snapshot.take()
    }

    /// Configure overlay slot `id`; `rect` is `[x, y, w, h]`, a negative
    /// `thickness` fills
    pub fn draw_rect(&self, id: usize, rect: [i32; 4], color: Color, thickness: i32, hidden: bool) -> Result<()> {
        if id >= MAX_RECTS {
            return Err(AppError::InvalidArgs(format!(
                "rect id {} out of range 0..{}",
                id, MAX_RECTS
            )));
        }
        let mut control = self.control();
        match &control.camera {
            Some(camera) if camera.format() == PixelFormat::Nv21 => {}
            _ => {
                return Err(AppError::InvalidArgs(
                    "rectangles need a bound NV21 camera".to_string(),
                ))
            }
        }
        let [x, y, w, h] = rect;
        control.rects[id] = RectOverlay {
            id,
            x,
            y,
            w,
            h,
            color,
            thickness,
            visible: !hidden,
        };
        Ok(())
    }

    pub fn rects(&self) -> Vec<RectOverlay> {
        self.control().rects.to_vec()
    }
}

impl Drop for VideoRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Recorder close on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::TestPattern;
    use crate::testutil::{init_tracing, scripted_encode_factory, MockAudio, MockCamera, MockDisplay};
    use crate::video::Decoder;
    use std::path::Path;

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn scripted_recorder() -> VideoRecorder {
        let (factory, _) = scripted_encode_factory(vec![3]);
        VideoRecorder::with_factory(RecorderSettings::default(), factory)
    }

    fn mp4_pts(path: &Path) -> (usize, Vec<i64>) {
        let size = std::fs::metadata(path).unwrap().len();
        let reader = std::io::BufReader::new(std::fs::File::open(path).unwrap());
        let mut mp4 = mp4::Mp4Reader::read_header(reader, size).unwrap();
        let tracks = mp4.tracks().len();
        let count = mp4.tracks().get(&1).unwrap().sample_count();
        let mut pts = Vec::new();
        for id in 1..=count {
            let sample = mp4.read_sample(1, id).unwrap().unwrap();
            pts.push(sample.start_time as i64 + sample.rendering_offset as i64);
        }
        (tracks, pts)
    }

    #[test]
    fn test_camera_frames_always_freed() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let recorder = scripted_recorder();
        let camera = Arc::new(MockCamera::new(Resolution::QVGA, PixelFormat::Nv21).failing_every(3));
        recorder.bind_camera(camera.clone()).unwrap();
        recorder.bind_display(Arc::new(MockDisplay::default()), Fit::Cover).unwrap();
        recorder.config_path(dir.path().join("p3.mp4")).unwrap();
        recorder.open().unwrap();

        assert!(wait_until(|| camera.reads() >= 20));
        recorder.record_start().unwrap();
        assert!(wait_until(|| recorder.frames_recorded() >= 20));
        recorder.record_finish().unwrap();
        recorder.close().unwrap();

        let reads = camera.reads();
        assert_eq!(camera.outstanding(), 0);
        assert_eq!(camera.frees(), reads - reads / 3);
    }

    #[test]
    fn test_config_rejected_while_recording() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = scripted_recorder();
        let camera = Arc::new(MockCamera::new(Resolution::QVGA, PixelFormat::Nv21));
        recorder.bind_camera(camera.clone()).unwrap();
        recorder.config_path(dir.path().join("p6.mp4")).unwrap();
        recorder.config_fps(25).unwrap();
        recorder.config_bitrate(1_000_000).unwrap();
        recorder.record_start().unwrap();
        assert_eq!(recorder.state(), RecorderState::Record);
        assert!(matches!(recorder.record_start(), Err(AppError::Busy(_))));

        assert!(matches!(recorder.config_path("other.mp4"), Err(AppError::Busy(_))));
        assert!(matches!(recorder.config_resolution(&[640, 480]), Err(AppError::Busy(_))));
        assert!(matches!(recorder.config_fps(10), Err(AppError::Busy(_))));
        assert!(matches!(recorder.config_bitrate(1), Err(AppError::Busy(_))));
        assert!(matches!(
            recorder.config_snapshot(true, None, PixelFormat::Nv21),
            Err(AppError::Busy(_))
        ));
        assert_eq!(recorder.get_path(), dir.path().join("p6.mp4"));
        assert_eq!(recorder.get_fps(), 25);
        assert_eq!(recorder.get_bitrate(), 1_000_000);
        assert_eq!(recorder.get_resolution().unwrap(), Resolution::QVGA);

        recorder.record_finish().unwrap();
        recorder.record_finish().unwrap();
        assert_eq!(recorder.state(), RecorderState::Idle);
        recorder.config_bitrate(2_000_000).unwrap();
        recorder.config_resolution(&[640, 480]).unwrap();
        assert_eq!(camera.resolution(), Resolution::VGA);
        assert_eq!(recorder.get_bitrate(), 2_000_000);
    }

    #[test]
    fn test_records_test_pattern_to_mp4() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.mp4");
        let recorder = VideoRecorder::new(RecorderSettings::default());
        let camera = TestPattern::new(Resolution::VGA, PixelFormat::Nv21, 30).unwrap();
        recorder.bind_camera(Arc::new(camera)).unwrap();
        recorder.config_path(&path).unwrap();
        recorder.open().unwrap();
        recorder.record_start().unwrap();
        assert!(wait_until(|| recorder.frames_recorded() >= 30));
        recorder.record_finish().unwrap();
        let frames = recorder.frames_recorded();
        assert!(recorder.seek() > 0);
        recorder.close().unwrap();

        // one sample per recorded frame, none lost to the SPS gate or the
        // one-deep duration buffer
        let (tracks, pts) = mp4_pts(&path);
        assert_eq!(tracks, 1);
        assert_eq!(pts.len() as u64, frames);
        assert_eq!(pts[0], 0);
        assert!(pts.windows(2).all(|w| w[0] < w[1]), "{:?}", pts);

        let size = std::fs::metadata(&path).unwrap().len();
        let reader = std::io::BufReader::new(std::fs::File::open(&path).unwrap());
        let mp4 = mp4::Mp4Reader::read_header(reader, size).unwrap();
        let track = mp4.tracks().get(&1).unwrap();
        assert_eq!((track.width(), track.height()), (640, 480));
        assert!(track.duration() > Duration::ZERO);

        let mut decoder = Decoder::open(&path, PixelFormat::Nv21).unwrap();
        let mut images = 0u64;
        while let Some(mut ctx) = decoder.decode_video(true).unwrap() {
            if ctx.take_image().is_some() {
                images += 1;
            }
        }
        assert_eq!(images, frames);
    }

    #[test]
    fn test_record_with_audio_track() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("av.mp4");
        let recorder = scripted_recorder();
        recorder.bind_camera(Arc::new(MockCamera::new(Resolution::QVGA, PixelFormat::Nv21))).unwrap();
        let audio = Arc::new(MockAudio::new(48000, 1));
        recorder.bind_audio(audio.clone()).unwrap();
        recorder.config_path(&path).unwrap();
        recorder.open().unwrap();
        recorder.record_start().unwrap();
        assert!(wait_until(|| recorder.frames_recorded() >= 40));
        recorder.record_finish().unwrap();

        // 48000 Hz mono S16 at 30 fps
        assert!(audio.bytes_read() >= 40 * 3200);
        let size = std::fs::metadata(&path).unwrap().len();
        let reader = std::io::BufReader::new(std::fs::File::open(&path).unwrap());
        let mp4 = mp4::Mp4Reader::read_header(reader, size).unwrap();
        assert_eq!(mp4.tracks().len(), 2);
    }

    #[test]
    fn test_record_start_needs_camera_and_path() {
        let recorder = scripted_recorder();
        assert!(matches!(recorder.record_start(), Err(AppError::NotReady(_))));
        recorder.bind_camera(Arc::new(MockCamera::new(Resolution::QVGA, PixelFormat::Nv21))).unwrap();
        assert!(matches!(recorder.record_start(), Err(AppError::Config(_))));
        assert_eq!(recorder.state(), RecorderState::Idle);
    }

    #[test]
    fn test_lock_timeout() {
        let recorder = scripted_recorder();
        let held = recorder.lock(None).unwrap();
        assert_eq!(held.state(), RecorderState::Idle);
        std::thread::scope(|s| {
            let other = s.spawn(|| recorder.lock(Some(Duration::from_millis(20))).map(|_| ()));
            assert!(matches!(other.join().unwrap(), Err(AppError::Timeout(_))));
        });
        held.unlock();
        assert!(recorder.lock(Some(Duration::from_millis(20))).is_ok());
    }

    #[test]
    fn test_bindings() {
        let recorder = scripted_recorder();
        let gray = Arc::new(MockCamera::new(Resolution::QVGA, PixelFormat::Grayscale));
        assert!(matches!(recorder.bind_camera(gray), Err(AppError::Config(_))));
        assert!(matches!(recorder.bind_imu(), Err(AppError::NotImplemented(_))));
        assert!(matches!(recorder.get_resolution(), Err(AppError::NotReady(_))));
        assert!(matches!(recorder.config_fps(30), Err(AppError::NotReady(_))));
        assert!(matches!(recorder.config_resolution(&[640]), Err(AppError::InvalidArgs(_))));

        assert!(!recorder.mute(Some(true)));
        assert_eq!(recorder.volume(Some(50)), 0);
        recorder.bind_audio(Arc::new(MockAudio::new(16000, 1))).unwrap();
        assert!(recorder.mute(Some(true)));
        assert!(recorder.mute(None));
        assert_eq!(recorder.volume(Some(250)), 100);
        assert_eq!(recorder.volume(None), 100);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let recorder = scripted_recorder();
        let camera = Arc::new(MockCamera::new(Resolution::QVGA, PixelFormat::Nv21));
        recorder.bind_camera(camera).unwrap();
        recorder.config_path("/tmp/x.mp4").unwrap();
        recorder.config_fps(10).unwrap();
        recorder.config_bitrate(123).unwrap();
        recorder.config_resolution(&[640, 480]).unwrap();
        recorder.draw_rect(2, [0, 0, 10, 10], Color::RED, 2, false).unwrap();

        recorder.reset().unwrap();
        assert_eq!(recorder.get_path(), PathBuf::new());
        assert_eq!(recorder.get_fps(), 30);
        assert_eq!(recorder.get_bitrate(), 3_000_000);
        assert!(recorder.rects().iter().all(|r| !r.visible));
        // camera stays bound, its size is reported again
        assert_eq!(recorder.get_resolution().unwrap(), Resolution::VGA);
    }

    #[test]
    fn test_snapshot_channel() {
        let recorder = scripted_recorder();
        assert!(matches!(
            recorder.config_snapshot(true, None, PixelFormat::Nv21),
            Err(AppError::NotReady(_))
        ));
        recorder.bind_camera(Arc::new(MockCamera::new(Resolution::VGA, PixelFormat::Nv21))).unwrap();
        recorder
            .config_snapshot(true, Some(Resolution::QVGA), PixelFormat::Nv21)
            .unwrap();
        recorder.open().unwrap();

        let mut snap = None;
        assert!(wait_until(|| {
            snap = recorder.snapshot();
            snap.is_some()
        }));
        assert_eq!(snap.unwrap().resolution(), Resolution::QVGA);

        recorder.config_snapshot(false, None, PixelFormat::Nv21).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(recorder.snapshot().is_none());
        recorder.close().unwrap();
        assert!(!recorder.is_opened());
    }

    #[test]
    fn test_rects_drawn_on_recorded_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (factory, log) = scripted_encode_factory(vec![3]);
        let recorder = VideoRecorder::with_factory(RecorderSettings::default(), factory);
        assert!(matches!(
            recorder.draw_rect(0, [0, 0, 4, 4], Color::WHITE, -1, false),
            Err(AppError::InvalidArgs(_))
        ));
        recorder.bind_camera(Arc::new(MockCamera::new(Resolution::QVGA, PixelFormat::Nv21))).unwrap();
        assert!(matches!(
            recorder.draw_rect(MAX_RECTS, [0, 0, 4, 4], Color::WHITE, -1, false),
            Err(AppError::InvalidArgs(_))
        ));
        recorder.draw_rect(1, [0, 0, 4, 4], Color::WHITE, -1, false).unwrap();
        recorder.config_path(dir.path().join("rect.mp4")).unwrap();
        recorder.open().unwrap();
        recorder.record_start().unwrap();

        let display = Arc::new(MockDisplay::default());
        recorder.bind_display(display.clone(), Fit::Contain).unwrap();
        assert!(wait_until(|| display.pushes() > 0));
        recorder.close().unwrap();

        // the encoder sees the overlay, the display the untouched capture
        assert_eq!(log.lock().last_luma, Some(Color::WHITE.to_yuv().0));
        let data = display.last_data().unwrap();
        // MockCamera fills luma with 16
        assert_eq!(data[0], 16);
        assert_eq!(data[10], 16);
        assert_eq!(display.last_fit(), Some(Fit::Contain));
    }
}
