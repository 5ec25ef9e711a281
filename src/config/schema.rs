use serde::{Deserialize, Serialize};

use crate::audio::{AacConfig, SampleFormat};
use crate::display::Fit;
use crate::video::format::{PixelFormat, Resolution, VideoType};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Encoder defaults used by `Encoder`/`Video`
    pub encoder: EncoderSettings,
    /// Background recorder settings
    pub recorder: RecorderSettings,
    /// Audio capture and AAC track settings
    pub audio: AudioSettings,
    /// Decoder output settings
    pub decoder: DecoderSettings,
}

/// Encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    /// Input pixel format (only NV21 is accepted by the encoder)
    pub format: PixelFormat,
    pub video_type: VideoType,
    pub framerate: u32,
    /// Frames between forced IDR pictures
    pub gop: u32,
    /// Target bitrate in bps
    pub bitrate: u32,
    /// Wall-clock ticks per second used for pts/dts helpers
    pub time_base: u32,
    /// Keep the last raw frame for `capture()`
    pub capture: bool,
    /// Wait for the channel in push/pop rather than polling
    pub block: bool,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            width: 2560,
            height: 1440,
            format: PixelFormat::Nv21,
            video_type: VideoType::H264,
            framerate: 30,
            gop: 50,
            bitrate: 3_000_000,
            time_base: 1000,
            capture: false,
            block: true,
        }
    }
}

/// Recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecorderSettings {
    /// Output file; the suffix picks the container
    pub path: String,
    pub fps: u32,
    pub bitrate: u32,
    /// Recording resolution, `None` follows the camera
    pub resolution: Option<Resolution>,
    /// Camera device for the CLI (`None` uses the test pattern)
    pub camera_device: Option<String>,
    pub display_fit: Fit,
    /// Camera pop timeout in milliseconds
    pub camera_timeout_ms: u64,
    /// Worker sleep between idle iterations in milliseconds
    pub idle_sleep_ms: u64,
    pub snapshot: bool,
    pub snapshot_resolution: Option<Resolution>,
    pub snapshot_format: PixelFormat,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            path: String::new(),
            fps: 30,
            bitrate: 3_000_000,
            resolution: None,
            camera_device: None,
            display_fit: Fit::Cover,
            camera_timeout_ms: 1000,
            idle_sleep_ms: 5,
            snapshot: false,
            snapshot_resolution: None,
            snapshot_format: PixelFormat::Nv21,
        }
    }
}

/// Audio configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioSettings {
    /// Record an AAC track alongside video
    pub enabled: bool,
    /// ALSA device name (with the `alsa` feature)
    pub device: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// AAC bitrate in bps
    pub bitrate: u32,
    pub format: SampleFormat,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            device: "default".to_string(),
            sample_rate: 48000,
            channels: 1,
            bitrate: 128_000,
            format: SampleFormat::S16Le,
        }
    }
}

impl AudioSettings {
    pub fn aac(&self) -> AacConfig {
        AacConfig {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bitrate: self.bitrate,
            format: self.format,
        }
    }
}

/// Decoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecoderSettings {
    /// Output image format (NV21 or GRAYSCALE)
    pub format: PixelFormat,
    /// Use block (push-then-pop) decoding
    pub block: bool,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            format: PixelFormat::Nv21,
            block: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.encoder.width, 2560);
        assert_eq!(cfg.encoder.gop, 50);
        assert_eq!(cfg.encoder.bitrate, 3_000_000);
        assert_eq!(cfg.recorder.fps, 30);
        assert_eq!(cfg.audio.aac(), AacConfig::default());
        assert_eq!(cfg.decoder.format, PixelFormat::Nv21);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"recorder": {"fps": 15, "resolution": {"width": 640, "height": 480}}}"#)
                .unwrap();
        assert_eq!(cfg.recorder.fps, 15);
        assert_eq!(cfg.recorder.resolution, Some(Resolution::VGA));
        assert_eq!(cfg.recorder.bitrate, 3_000_000);
        assert_eq!(cfg.encoder.video_type, VideoType::H264);
    }

    #[test]
    fn test_enum_spelling() {
        let json = serde_json::to_value(EncoderSettings::default()).unwrap();
        assert_eq!(json["format"], "NV21");
        assert_eq!(json["video_type"], "h264");
    }
}
