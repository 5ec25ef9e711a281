use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{Camera, CameraFrame};
use crate::error::{AppError, Result};
use crate::video::format::{PixelFormat, Resolution};
use crate::video::frame::Image;

/// Hardware ring depth modelled by the synthetic camera
const RING_SLOTS: usize = 4;

struct PatternState {
    resolution: Resolution,
    fps: u32,
    sequence: u64,
    outstanding: HashSet<u64>,
    next_due: Option<Instant>,
}

/// Synthetic camera producing a moving gradient
///
/// Behaves like a driver-backed channel: it hands out at most
/// `RING_SLOTS` frames before they are freed, and paces reads to its
/// frame rate when `paced` is set.
pub struct TestPattern {
    channel: u32,
    format: PixelFormat,
    paced: bool,
    state: Mutex<PatternState>,
}

impl TestPattern {
    pub fn new(resolution: Resolution, format: PixelFormat, fps: u32) -> Result<Self> {
        Self::with_channel(0, resolution, format, fps)
    }

    fn with_channel(channel: u32, resolution: Resolution, format: PixelFormat, fps: u32) -> Result<Self> {
        if !resolution.is_valid() {
            return Err(AppError::Config(format!("Invalid camera resolution {}", resolution)));
        }
        if !matches!(format, PixelFormat::Nv21 | PixelFormat::Grayscale) {
            return Err(AppError::UnsupportedFormat(format!(
                "Test pattern cannot produce {}",
                format
            )));
        }
        Ok(Self {
            channel,
            format,
            paced: true,
            state: Mutex::new(PatternState {
                resolution,
                fps: fps.max(1),
                sequence: 0,
                outstanding: HashSet::new(),
                next_due: None,
            }),
        })
    }

    /// Return frames immediately instead of at the configured rate
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    /// Frames popped but not yet freed
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    pub fn frames_produced(&self) -> u64 {
        self.state.lock().sequence
    }

    fn render(resolution: Resolution, format: PixelFormat, sequence: u64) -> Image {
        let mut image = Image::zeroed(resolution, format);
        let w = resolution.width as usize;
        let h = resolution.height as usize;
        let shift = (sequence * 4) as usize;
        let data = image.data_mut();
        for row in 0..h {
            for col in 0..w {
                data[row * w + col] = ((col + row + shift) & 0xff) as u8;
            }
        }
        if format == PixelFormat::Nv21 {
            for (i, b) in data[w * h..].iter_mut().enumerate() {
                *b = if i % 2 == 0 { 128u8.wrapping_add(sequence as u8) } else { 128 };
            }
        }
        image
    }
}

impl Camera for TestPattern {
    fn read(&self, timeout: Duration) -> Result<CameraFrame> {
        let (resolution, sequence, wait) = {
            let mut state = self.state.lock();
            if state.outstanding.len() >= RING_SLOTS {
                return Err(AppError::Runtime(format!(
                    "camera channel {}: all {} buffers in use",
                    self.channel, RING_SLOTS
                )));
            }
            let now = Instant::now();
            let interval = Duration::from_secs(1) / state.fps;
            let due = state.next_due.unwrap_or(now);
            let wait = if self.paced { due.saturating_duration_since(now) } else { Duration::ZERO };
            if wait > timeout {
                return Err(AppError::Timeout(format!(
                    "camera channel {}: no frame within {:?}",
                    self.channel, timeout
                )));
            }
            state.next_due = Some(due.max(now) + interval);
            let sequence = state.sequence;
            state.sequence += 1;
            state.outstanding.insert(sequence);
            (state.resolution, sequence, wait)
        };

        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        Ok(CameraFrame::new(Self::render(resolution, self.format, sequence), sequence))
    }

    fn free(&self, frame: CameraFrame) {
        if !self.state.lock().outstanding.remove(&frame.handle()) {
            debug!("camera channel {}: free of unknown buffer {}", self.channel, frame.handle());
        }
    }

    fn channel(&self) -> u32 {
        self.channel
    }

    fn width(&self) -> u32 {
        self.state.lock().resolution.width
    }

    fn height(&self) -> u32 {
        self.state.lock().resolution.height
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn fps(&self) -> u32 {
        self.state.lock().fps
    }

    fn set_resolution(&self, width: u32, height: u32) -> Result<()> {
        let resolution = Resolution::new(width, height);
        if !resolution.is_valid() {
            return Err(AppError::Config(format!("Invalid camera resolution {}", resolution)));
        }
        self.state.lock().resolution = resolution;
        Ok(())
    }

    fn set_fps(&self, fps: u32) -> Result<()> {
        if fps == 0 {
            return Err(AppError::Config("fps must be positive".to_string()));
        }
        self.state.lock().fps = fps;
        Ok(())
    }

    fn add_channel(&self, width: u32, height: u32, format: PixelFormat) -> Result<Arc<dyn Camera>> {
        let fps = self.fps();
        let mut channel = Self::with_channel(self.channel + 1, Resolution::new(width, height), format, fps)?;
        channel.paced = false;
        Ok(Arc::new(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraFrameGuard;

    #[test]
    fn test_ring_starves_without_free() {
        let cam = TestPattern::new(Resolution::new(16, 8), PixelFormat::Nv21, 30).unwrap().unpaced();
        let mut frames = Vec::new();
        for _ in 0..RING_SLOTS {
            frames.push(cam.read(Duration::from_millis(10)).unwrap());
        }
        assert!(cam.read(Duration::from_millis(10)).is_err());
        cam.free(frames.pop().unwrap());
        assert!(cam.read(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_guard_frees_on_drop() {
        let cam = TestPattern::new(Resolution::new(16, 8), PixelFormat::Nv21, 30).unwrap().unpaced();
        {
            let guard = CameraFrameGuard::read(&cam, Duration::from_millis(10)).unwrap();
            assert_eq!(guard.image().resolution(), Resolution::new(16, 8));
            assert_eq!(guard.image().data_size(), 16 * 8 * 3 / 2);
            assert_eq!(cam.outstanding(), 1);
        }
        assert_eq!(cam.outstanding(), 0);
    }

    #[test]
    fn test_paced_read_times_out() {
        let cam = TestPattern::new(Resolution::new(16, 8), PixelFormat::Nv21, 1).unwrap();
        let first = cam.read(Duration::from_millis(10)).unwrap();
        cam.free(first);
        assert!(matches!(cam.read(Duration::from_millis(10)), Err(AppError::Timeout(_))));
    }

    #[test]
    fn test_add_channel_geometry() {
        let cam = TestPattern::new(Resolution::VGA, PixelFormat::Nv21, 30).unwrap();
        let snap = cam.add_channel(320, 240, PixelFormat::Grayscale).unwrap();
        assert_eq!(snap.resolution(), Resolution::QVGA);
        assert_eq!(snap.format(), PixelFormat::Grayscale);
        let frame = snap.read(Duration::from_millis(10)).unwrap();
        assert_eq!(frame.image().data_size(), 320 * 240);
        snap.free(frame);
        assert!(cam.add_channel(321, 240, PixelFormat::Nv21).is_err());
    }
}
