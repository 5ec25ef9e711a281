//! Pixel formats, resolutions, codec/container identifiers and time bases

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{AppError, Result};

/// Raw image formats exchanged with cameras, displays and codec channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// YUV420SP with interleaved VU plane (the camera's native format)
    Nv21,
    /// YUV420 planar (I420), the software codec's native layout
    Yuv420p,
    Rgb888,
    Bgr888,
    Rgba8888,
    Bgra8888,
    Grayscale,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, None for planar YUV
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Nv21 | PixelFormat::Yuv420p => None,
            PixelFormat::Rgb888 | PixelFormat::Bgr888 => Some(3),
            PixelFormat::Rgba8888 | PixelFormat::Bgra8888 => Some(4),
            PixelFormat::Grayscale => Some(1),
        }
    }

    /// Expected buffer size for one frame at `resolution`
    pub fn frame_size(&self, resolution: Resolution) -> usize {
        let pixels = resolution.pixels() as usize;
        match self {
            PixelFormat::Nv21 | PixelFormat::Yuv420p => pixels * 3 / 2,
            PixelFormat::Rgb888 | PixelFormat::Bgr888 => pixels * 3,
            PixelFormat::Rgba8888 | PixelFormat::Bgra8888 => pixels * 4,
            PixelFormat::Grayscale => pixels,
        }
    }

    pub fn is_yuv420(&self) -> bool {
        matches!(self, PixelFormat::Nv21 | PixelFormat::Yuv420p)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Nv21 => "NV21",
            PixelFormat::Yuv420p => "YUV420P",
            PixelFormat::Rgb888 => "RGB888",
            PixelFormat::Bgr888 => "BGR888",
            PixelFormat::Rgba8888 => "RGBA8888",
            PixelFormat::Bgra8888 => "BGRA8888",
            PixelFormat::Grayscale => "GRAYSCALE",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NV21" | "YUV420SP" | "YVU420SP" => Ok(PixelFormat::Nv21),
            "YUV420P" | "I420" | "YU12" => Ok(PixelFormat::Yuv420p),
            "RGB888" | "RGB24" => Ok(PixelFormat::Rgb888),
            "BGR888" | "BGR24" => Ok(PixelFormat::Bgr888),
            "RGBA8888" | "RGBA" => Ok(PixelFormat::Rgba8888),
            "BGRA8888" | "BGRA" => Ok(PixelFormat::Bgra8888),
            "GRAYSCALE" | "GRAY" | "GREY" => Ok(PixelFormat::Grayscale),
            _ => Err(format!("Unknown pixel format: {}", s)),
        }
    }
}

/// Frame resolution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Non-zero and even in both dimensions (4:2:0 subsampling needs 2x2 blocks)
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.width % 2 == 0 && self.height % 2 == 0
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const QVGA: Resolution = Resolution { width: 320, height: 240 };
    pub const VGA: Resolution = Resolution { width: 640, height: 480 };
    pub const HD720: Resolution = Resolution { width: 1280, height: 720 };
    pub const HD1080: Resolution = Resolution { width: 1920, height: 1080 };
    pub const QHD1440: Resolution = Resolution { width: 2560, height: 1440 };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("Invalid resolution '{}', expected WxH", s))?;
        let width = w.trim().parse().map_err(|_| format!("Invalid width in '{}'", s))?;
        let height = h.trim().parse().map_err(|_| format!("Invalid height in '{}'", s))?;
        Ok(Self { width, height })
    }
}

/// Video compression standard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecType {
    H264,
    H265,
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecType::H264 => write!(f, "H.264"),
            CodecType::H265 => write!(f, "H.265"),
        }
    }
}

/// Container family written or read for a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    /// Annex-B elementary stream, no container
    Raw,
    Mp4,
    Flv,
}

/// Codec + container combination of an output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoType {
    H264,
    H264Mp4,
    H264Flv,
    H265,
    H265Mp4,
}

impl VideoType {
    pub fn codec(&self) -> CodecType {
        match self {
            VideoType::H264 | VideoType::H264Mp4 | VideoType::H264Flv => CodecType::H264,
            VideoType::H265 | VideoType::H265Mp4 => CodecType::H265,
        }
    }

    pub fn container(&self) -> Container {
        match self {
            VideoType::H264 | VideoType::H265 => Container::Raw,
            VideoType::H264Mp4 | VideoType::H265Mp4 => Container::Mp4,
            VideoType::H264Flv => Container::Flv,
        }
    }

    /// Reconcile a requested type with the output path's suffix.
    ///
    /// `.h264`/`.h265` force the raw stream, `.mp4` keeps the requested codec
    /// family, `.flv` only carries H.264. Unknown suffixes keep the request.
    pub fn resolve(path: &Path, requested: VideoType) -> Result<VideoType> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "h264" => Ok(VideoType::H264),
            "h265" => Ok(VideoType::H265),
            "mp4" => Ok(match requested.codec() {
                CodecType::H264 => VideoType::H264Mp4,
                CodecType::H265 => VideoType::H265Mp4,
            }),
            "flv" => match requested.codec() {
                CodecType::H264 => Ok(VideoType::H264Flv),
                CodecType::H265 => Err(AppError::Runtime(format!(
                    "{} is not supported in an FLV container ({})",
                    requested.codec(),
                    path.display()
                ))),
            },
            _ => Ok(requested),
        }
    }
}

impl fmt::Display for VideoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VideoType::H264 => "h264",
            VideoType::H264Mp4 => "h264_mp4",
            VideoType::H264Flv => "h264_flv",
            VideoType::H265 => "h265",
            VideoType::H265Mp4 => "h265_mp4",
        };
        write!(f, "{}", name)
    }
}

/// Kind of payload carried by a decode context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum MediaType {
    Unknown = -1,
    Video = 0,
    Audio,
    Data,
    Subtitle,
    Attachment,
}

/// Rational time base: one tick lasts `num / den` seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timebase {
    pub num: i32,
    pub den: i32,
}

impl Timebase {
    pub const MILLIS: Timebase = Timebase { num: 1, den: 1000 };

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Ticks per second
    pub fn rate(&self) -> f64 {
        if self.num == 0 {
            return 0.0;
        }
        self.den as f64 / self.num as f64
    }

    pub fn to_seconds(&self, ticks: i64) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        ticks as f64 * self.num as f64 / self.den as f64
    }

    pub fn to_us(&self, ticks: i64) -> i64 {
        (self.to_seconds(ticks) * 1_000_000.0).round() as i64
    }

    pub fn to_ms(&self, ticks: i64) -> i64 {
        (self.to_seconds(ticks) * 1000.0).round() as i64
    }

    /// Wall-clock milliseconds to ticks, truncating
    pub fn ms_to_pts(&self, ms: i64) -> i64 {
        if self.num == 0 {
            return 0;
        }
        ms * self.den as i64 / (self.num as i64 * 1000)
    }

    pub fn from_seconds(&self, seconds: f64) -> i64 {
        (seconds * self.rate()).round() as i64
    }

    /// Rescale `ticks` from this time base into `other`
    pub fn rescale(&self, ticks: i64, other: Timebase) -> i64 {
        let num = ticks as i128 * self.num as i128 * other.den as i128;
        let den = self.den as i128 * other.num as i128;
        if den == 0 {
            return 0;
        }
        (num / den) as i64
    }
}

impl Default for Timebase {
    fn default() -> Self {
        Self::MILLIS
    }
}

impl fmt::Display for Timebase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}
