//! V4L2 capture adapter (feature `v4l2`)
//!
//! Requests NV21 from the driver and falls back to YUYV, which is converted
//! to NV21 in software. Buffers are copied out of the mmap ring on read, so
//! `free` only does bookkeeping.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{Camera, CameraFrame};
use crate::error::{AppError, Result};
use crate::video::format::{PixelFormat, Resolution};
use crate::video::frame::Image;

const BUFFER_COUNT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
enum WireFormat {
    Nv21,
    Yuyv,
}

struct Inner {
    device: &'static Device,
    stream: Option<Stream<'static>>,
    resolution: Resolution,
    wire: WireFormat,
    fps: u32,
    sequence: u64,
}

// v4l handles are plain file descriptors plus mmap regions
unsafe impl Send for Inner {}

pub struct V4l2Camera {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl V4l2Camera {
    pub fn open(path: impl AsRef<Path>, resolution: Resolution, fps: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let device = Device::with_path(&path).map_err(|e| {
            AppError::Io(std::io::Error::other(format!(
                "Failed to open device {:?}: {}",
                path, e
            )))
        })?;
        // the mmap stream borrows the device for its whole life
        let device: &'static Device = Box::leak(Box::new(device));

        let mut inner = Inner {
            device,
            stream: None,
            resolution,
            wire: WireFormat::Nv21,
            fps,
            sequence: 0,
        };
        Self::configure(&mut inner)?;
        info!(
            "V4L2 camera {:?}: {} {:?} @ {}fps",
            path, inner.resolution, inner.wire, inner.fps
        );
        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    fn configure(inner: &mut Inner) -> Result<()> {
        inner.stream = None;
        let device = inner.device;
        let mut format = device
            .format()
            .map_err(|e| AppError::Runtime(format!("Failed to query format: {}", e)))?;
        format.width = inner.resolution.width;
        format.height = inner.resolution.height;

        let mut chosen = None;
        for (fourcc, wire) in [(FourCC::new(b"NV21"), WireFormat::Nv21), (FourCC::new(b"YUYV"), WireFormat::Yuyv)] {
            format.fourcc = fourcc;
            if let Ok(actual) = device.set_format(&format) {
                if actual.fourcc == fourcc {
                    chosen = Some((actual, wire));
                    break;
                }
            }
        }
        let (actual, wire) = chosen.ok_or_else(|| {
            AppError::UnsupportedFormat("device offers neither NV21 nor YUYV".to_string())
        })?;

        if let Err(e) = device.set_params(&Parameters::with_fps(inner.fps)) {
            warn!("Failed to set frame rate {}: {}", inner.fps, e);
        }

        inner.resolution = Resolution::new(actual.width, actual.height);
        inner.wire = wire;
        let stream = Stream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|e| AppError::Runtime(format!("Failed to create capture stream: {}", e)))?;
        inner.stream = Some(stream);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn yuyv_to_nv21(yuyv: &[u8], resolution: Resolution) -> Vec<u8> {
    let w = resolution.width as usize;
    let h = resolution.height as usize;
    let mut out = vec![0u8; w * h * 3 / 2];
    let (y_plane, vu_plane) = out.split_at_mut(w * h);
    for row in 0..h {
        for col in 0..w {
            y_plane[row * w + col] = yuyv[(row * w + col) * 2];
        }
    }
    for row in (0..h).step_by(2) {
        for col in (0..w).step_by(2) {
            let base = (row * w + col) * 2;
            let vu = (row / 2) * w + col;
            vu_plane[vu] = yuyv[base + 3];
            vu_plane[vu + 1] = yuyv[base + 1];
        }
    }
    out
}

impl Camera for V4l2Camera {
    fn read(&self, _timeout: Duration) -> Result<CameraFrame> {
        let mut inner = self.inner.lock();
        let resolution = inner.resolution;
        let wire = inner.wire;
        let stream = inner
            .stream
            .as_mut()
            .ok_or_else(|| AppError::NotOpen("capture stream".to_string()))?;
        let (data, _meta) = stream
            .next()
            .map_err(|e| AppError::Runtime(format!("Capture failed: {}", e)))?;

        let pixels = match wire {
            WireFormat::Nv21 => data.to_vec(),
            WireFormat::Yuyv => {
                if data.len() < resolution.pixels() as usize * 2 {
                    return Err(AppError::Runtime(format!(
                        "Short YUYV frame: {} bytes",
                        data.len()
                    )));
                }
                yuyv_to_nv21(data, resolution)
            }
        };
        let image = Image::new(pixels, resolution, PixelFormat::Nv21)?;
        let handle = inner.sequence;
        inner.sequence += 1;
        Ok(CameraFrame::new(image, handle))
    }

    fn free(&self, _frame: CameraFrame) {}

    fn channel(&self) -> u32 {
        0
    }

    fn width(&self) -> u32 {
        self.inner.lock().resolution.width
    }

    fn height(&self) -> u32 {
        self.inner.lock().resolution.height
    }

    fn format(&self) -> PixelFormat {
        PixelFormat::Nv21
    }

    fn fps(&self) -> u32 {
        self.inner.lock().fps
    }

    fn set_resolution(&self, width: u32, height: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.resolution = Resolution::new(width, height);
        Self::configure(&mut inner)
    }

    fn set_fps(&self, fps: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.fps = fps;
        Self::configure(&mut inner)
    }

    fn add_channel(&self, _width: u32, _height: u32, _format: PixelFormat) -> Result<Arc<dyn Camera>> {
        Err(AppError::NotImplemented(format!(
            "{:?} exposes a single capture channel",
            self.path
        )))
    }
}
