//! Audio side of the pipeline
//!
//! This module provides:
//! - The `AudioRecorder` collaborator interface pulled by the encoder and recorder
//! - Byte-exact PCM chunking into codec-sized frames
//! - AAC encoding/decoding (fdk-aac)
//! - A synthetic tone source and, with the `alsa` feature, ALSA capture

pub mod aac;
#[cfg(feature = "alsa")]
pub mod capture;
pub mod pcm;
pub mod tone;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

pub use aac::{AacConfig, AacDecoder, AacEncoder, AAC_FRAME_SAMPLES};
#[cfg(feature = "alsa")]
pub use capture::{AlsaConfig, AlsaRecorder};
pub use pcm::{pcm_bytes_per_video_frame, PcmChunk, PcmChunker};
pub use tone::ToneRecorder;

/// PCM sample layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    U8,
    #[default]
    S16Le,
    S32Le,
    F32Le,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16Le => 2,
            SampleFormat::S32Le | SampleFormat::F32Le => 4,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S16Le => "s16le",
            SampleFormat::S32Le => "s32le",
            SampleFormat::F32Le => "f32le",
        };
        write!(f, "{}", name)
    }
}

/// Microphone-side collaborator
///
/// Implementations are shared between the control thread and the recorder
/// worker, so every method takes `&self`.
pub trait AudioRecorder: Send + Sync {
    /// Read up to `bytes` of interleaved PCM, blocking until available
    fn record_bytes(&self, bytes: usize) -> Result<Bytes>;

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    fn format(&self) -> SampleFormat;

    /// Sample frames already buffered and readable without blocking
    fn remaining_frames(&self) -> Result<usize>;

    /// Byte size of `frames` sample frames
    fn frame_size(&self, frames: usize) -> usize {
        frames * self.channels() as usize * self.format().bytes_per_sample()
    }

    /// Query (`None`) or set the mute state; returns the current state
    fn mute(&self, mute: Option<bool>) -> bool;

    /// Query (`None`) or set the capture volume 0..=100; returns the current volume
    fn volume(&self, volume: Option<u32>) -> u32;
}
