//! Camera collaborator interface
//!
//! The recorder and encoder pull raw frames from a camera channel. Frames
//! borrowed from a hardware ring must be handed back through
//! [`Camera::free`] exactly once or the ring starves; [`CameraFrameGuard`]
//! makes that release unconditional.

mod pattern;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::video::format::{PixelFormat, Resolution};
use crate::video::frame::Image;

pub use pattern::TestPattern;

/// One frame popped from a camera channel
#[derive(Debug)]
pub struct CameraFrame {
    image: Image,
    handle: u64,
}

impl CameraFrame {
    pub fn new(image: Image, handle: u64) -> Self {
        Self {
            image: image.borrowed(),
            handle,
        }
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut Image {
        &mut self.image
    }

    /// Driver-side buffer slot this frame occupies
    pub fn handle(&self) -> u64 {
        self.handle
    }

    fn placeholder() -> Self {
        Self {
            image: Image::zeroed(Resolution::new(0, 0), PixelFormat::Nv21),
            handle: u64::MAX,
        }
    }
}

/// Camera capture channel
pub trait Camera: Send + Sync {
    /// Pop the next frame, blocking up to `timeout`
    fn read(&self, timeout: Duration) -> Result<CameraFrame>;

    /// Return a popped frame's buffer to the driver
    fn free(&self, frame: CameraFrame);

    /// Channel index on the capture device
    fn channel(&self) -> u32;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn format(&self) -> PixelFormat;

    fn resolution(&self) -> Resolution {
        Resolution::new(self.width(), self.height())
    }

    fn fps(&self) -> u32;

    fn set_resolution(&self, width: u32, height: u32) -> Result<()>;

    fn set_fps(&self, fps: u32) -> Result<()>;

    /// Open a secondary channel on the same sensor with its own geometry
    fn add_channel(&self, width: u32, height: u32, format: PixelFormat) -> Result<Arc<dyn Camera>>;
}

/// Scoped camera frame: frees the buffer back to its camera on drop
pub struct CameraFrameGuard<'a> {
    camera: &'a dyn Camera,
    frame: CameraFrame,
}

impl<'a> CameraFrameGuard<'a> {
    pub fn read(camera: &'a dyn Camera, timeout: Duration) -> Result<Self> {
        let frame = camera.read(timeout)?;
        Ok(Self { camera, frame })
    }

    pub fn image(&self) -> &Image {
        self.frame.image()
    }

    pub fn image_mut(&mut self) -> &mut Image {
        self.frame.image_mut()
    }
}

impl Drop for CameraFrameGuard<'_> {
    fn drop(&mut self) {
        let frame = std::mem::replace(&mut self.frame, CameraFrame::placeholder());
        self.camera.free(frame);
    }
}
