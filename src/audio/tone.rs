//! Synthetic sine-tone microphone

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::{AudioRecorder, SampleFormat};
use crate::error::Result;

/// `AudioRecorder` producing an endless s16le sine wave on demand
pub struct ToneRecorder {
    sample_rate: u32,
    channels: u16,
    frequency: f32,
    phase: Mutex<u64>,
    muted: AtomicBool,
    volume: AtomicU32,
}

impl ToneRecorder {
    pub fn new(sample_rate: u32, channels: u16, frequency: f32) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            frequency,
            phase: Mutex::new(0),
            muted: AtomicBool::new(false),
            volume: AtomicU32::new(100),
        }
    }
}

impl Default for ToneRecorder {
    fn default() -> Self {
        Self::new(48000, 1, 440.0)
    }
}

impl AudioRecorder for ToneRecorder {
    fn record_bytes(&self, bytes: usize) -> Result<Bytes> {
        let frame_bytes = self.frame_size(1);
        let frames = bytes / frame_bytes;
        let gain = if self.muted.load(Ordering::Relaxed) {
            0.0
        } else {
            self.volume.load(Ordering::Relaxed) as f32 / 100.0
        };

        let mut out = BytesMut::with_capacity(frames * frame_bytes);
        let mut phase = self.phase.lock();
        for _ in 0..frames {
            let t = *phase as f32 / self.sample_rate as f32;
            let sample = ((t * self.frequency * std::f32::consts::TAU).sin() * 8000.0 * gain) as i16;
            for _ in 0..self.channels {
                out.put_i16_le(sample);
            }
            *phase += 1;
        }
        Ok(out.freeze())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn format(&self) -> SampleFormat {
        SampleFormat::S16Le
    }

    fn remaining_frames(&self) -> Result<usize> {
        Ok(self.sample_rate as usize)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_frames_only() {
        let tone = ToneRecorder::new(8000, 2, 440.0);
        assert_eq!(tone.frame_size(1), 4);
        assert_eq!(tone.record_bytes(10).unwrap().len(), 8);
    }

    #[test]
    fn test_mute_silences() {
        let tone = ToneRecorder::default();
        assert!(tone.mute(Some(true)));
        let pcm = tone.record_bytes(200).unwrap();
        assert!(pcm.iter().all(|b| *b == 0));
        assert_eq!(tone.volume(Some(150)), 100);
        assert_eq!(tone.volume(None), 100);
    }
}
