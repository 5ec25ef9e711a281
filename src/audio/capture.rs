//! ALSA microphone adapter

use alsa::pcm::{Access, Format, Frames, HwParams, State, IO};
use alsa::{Direction, ValueOr, PCM};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{info, warn};

use super::{AudioRecorder, SampleFormat};
use crate::error::{AppError, Result};

/// ALSA capture configuration
#[derive(Debug, Clone)]
pub struct AlsaConfig {
    /// ALSA device name (e.g., "hw:0,0" or "default")
    pub device_name: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer_frames: u32,
    pub period_frames: u32,
}

impl Default for AlsaConfig {
    fn default() -> Self {
        Self {
            device_name: "default".to_string(),
            sample_rate: 48000,
            channels: 1,
            buffer_frames: 8192,
            period_frames: 1024,
        }
    }
}

/// Blocking s16le capture from an ALSA PCM device
pub struct AlsaRecorder {
    config: AlsaConfig,
    sample_rate: u32,
    pcm: Mutex<PCM>,
    muted: AtomicBool,
    volume: AtomicU32,
}

impl AlsaRecorder {
    pub fn open(config: AlsaConfig) -> Result<Self> {
        let pcm = PCM::new(&config.device_name, Direction::Capture, false).map_err(|e| {
            AppError::Io(std::io::Error::other(format!(
                "Failed to open audio device {}: {}",
                config.device_name, e
            )))
        })?;

        {
            let hwp = HwParams::any(&pcm)
                .map_err(|e| AppError::Runtime(format!("Failed to get HwParams: {}", e)))?;
            hwp.set_channels(config.channels as u32)
                .map_err(|e| AppError::Config(format!("Failed to set channels: {}", e)))?;
            hwp.set_rate(config.sample_rate, ValueOr::Nearest)
                .map_err(|e| AppError::Config(format!("Failed to set sample rate: {}", e)))?;
            hwp.set_format(Format::s16())
                .map_err(|e| AppError::Config(format!("Failed to set format: {}", e)))?;
            hwp.set_access(Access::RWInterleaved)
                .map_err(|e| AppError::Config(format!("Failed to set access: {}", e)))?;
            hwp.set_buffer_size_near(config.buffer_frames as Frames)
                .map_err(|e| AppError::Config(format!("Failed to set buffer size: {}", e)))?;
            hwp.set_period_size_near(config.period_frames as Frames, ValueOr::Nearest)
                .map_err(|e| AppError::Config(format!("Failed to set period size: {}", e)))?;
            pcm.hw_params(&hwp)
                .map_err(|e| AppError::Runtime(format!("Failed to apply hw params: {}", e)))?;
        }

        let sample_rate = pcm
            .hw_params_current()
            .map(|h| h.get_rate().unwrap_or(config.sample_rate))
            .unwrap_or(config.sample_rate);

        pcm.prepare()
            .map_err(|e| AppError::Runtime(format!("Failed to prepare PCM: {}", e)))?;

        info!(
            "ALSA capture on {}: {}Hz {}ch (requested {}Hz)",
            config.device_name, sample_rate, config.channels, config.sample_rate
        );

        Ok(Self {
            config,
            sample_rate,
            pcm: Mutex::new(pcm),
            muted: AtomicBool::new(false),
            volume: AtomicU32::new(100),
        })
    }

    fn apply_gain(&self, pcm: &mut [u8]) {
        let gain = if self.muted.load(Ordering::Relaxed) {
            0
        } else {
            self.volume.load(Ordering::Relaxed) as i32
        };
        if gain == 100 {
            return;
        }
        for s in pcm.chunks_exact_mut(2) {
            let v = i16::from_le_bytes([s[0], s[1]]) as i32 * gain / 100;
            s.copy_from_slice(&(v as i16).to_le_bytes());
        }
    }
}

impl AudioRecorder for AlsaRecorder {
    fn record_bytes(&self, bytes: usize) -> Result<Bytes> {
        let frame_bytes = self.frame_size(1);
        let mut buffer = vec![0u8; bytes / frame_bytes * frame_bytes];
        let pcm = self.pcm.lock();
        let mut filled = 0;

        while filled < buffer.len() {
            match pcm.state() {
                State::XRun => {
                    warn!("Audio buffer overrun, recovering");
                    let _ = pcm.prepare();
                }
                State::Suspended => {
                    warn!("Audio device suspended, recovering");
                    let _ = pcm.resume();
                }
                _ => {}
            }

            let io: IO<u8> = pcm.io_bytes();
            match io.readi(&mut buffer[filled..]) {
                Ok(frames) => filled += frames * frame_bytes,
                Err(e) => {
                    let desc = e.to_string();
                    if desc.contains("EPIPE") || desc.contains("Broken pipe") {
                        warn!("Audio buffer overrun");
                        let _ = pcm.prepare();
                    } else {
                        return Err(AppError::Io(std::io::Error::other(format!(
                            "Audio read error on {}: {}",
                            self.config.device_name, e
                        ))));
                    }
                }
            }
        }
        drop(pcm);

        self.apply_gain(&mut buffer);
        Ok(Bytes::from(buffer))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.config.channels
    }

    fn format(&self) -> SampleFormat {
        SampleFormat::S16Le
    }

    fn remaining_frames(&self) -> Result<usize> {
        let pcm = self.pcm.lock();
        pcm.avail_update()
            .map(|f| f.max(0) as usize)
            .map_err(|e| AppError::Runtime(format!("avail_update failed: {}", e)))
    }

    fn mute(&self, mute: Option<bool>) -> bool {
        if let Some(m) = mute {
            self.muted.store(m, Ordering::Relaxed);
        }
        self.muted.load(Ordering::Relaxed)
    }

    fn volume(&self, volume: Option<u32>) -> u32 {
        if let Some(v) = volume {
            self.volume.store(v.min(100), Ordering::Relaxed);
        }
        self.volume.load(Ordering::Relaxed)
    }
}
