//! Display collaborator interface

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::video::frame::Image;

/// How an image is fitted to the screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fit {
    /// Stretch to fill, ignoring aspect ratio
    Fill,
    /// Letterbox, whole image visible
    Contain,
    /// Crop to fill, aspect ratio kept
    #[default]
    Cover,
}

/// Preview output
pub trait Display: Send + Sync {
    fn push(&self, image: &Image, fit: Fit) -> Result<()>;

    fn width(&self) -> u32;

    fn height(&self) -> u32;
}
