//! AAC-LC encoding and decoding via fdk-aac

use bytes::Bytes;
use fdk_aac::dec::{Decoder as FdkDecoder, DecoderError, Transport as DecTransport};
use fdk_aac::enc::{BitRate, ChannelMode, Encoder as FdkEncoder, EncoderParams, Transport};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::SampleFormat;
use crate::error::{AppError, Result};

/// Samples per channel in one AAC-LC frame
pub const AAC_FRAME_SAMPLES: usize = 1024;

/// Largest raw AAC frame fdk-aac emits (6144 bits per channel)
const MAX_FRAME_BYTES: usize = 768 * 8;

const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// AAC encoder/track settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AacConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u32,
    pub format: SampleFormat,
}

impl Default for AacConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            bitrate: 128_000,
            format: SampleFormat::S16Le,
        }
    }
}

impl AacConfig {
    pub fn validate(&self) -> Result<()> {
        if sample_freq_index(self.sample_rate).is_none() {
            return Err(AppError::Config(format!(
                "Unsupported AAC sample rate {}",
                self.sample_rate
            )));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(AppError::Config(format!(
                "AAC channel count must be 1 or 2, got {}",
                self.channels
            )));
        }
        if self.format != SampleFormat::S16Le {
            return Err(AppError::Config(format!(
                "AAC encoder takes s16le PCM, got {}",
                self.format
            )));
        }
        Ok(())
    }

    /// Two-byte AudioSpecificConfig for AAC-LC
    pub fn audio_specific_config(&self) -> [u8; 2] {
        let idx = sample_freq_index(self.sample_rate).unwrap_or(3) as u16;
        let asc: u16 = (2 << 11) | (idx << 7) | ((self.channels as u16 & 0x0f) << 3);
        asc.to_be_bytes()
    }

    /// Interleaved PCM bytes consumed per AAC frame
    pub fn frame_bytes(&self) -> usize {
        AAC_FRAME_SAMPLES * self.channels as usize * self.format.bytes_per_sample()
    }
}

/// MPEG-4 sampling frequency index
pub fn sample_freq_index(sample_rate: u32) -> Option<u8> {
    SAMPLE_RATES.iter().position(|&r| r == sample_rate).map(|i| i as u8)
}

pub fn sample_rate_from_index(index: u8) -> Option<u32> {
    SAMPLE_RATES.get(index as usize).copied()
}

/// Parse (sample_rate, channels) out of an AudioSpecificConfig
pub fn parse_audio_specific_config(asc: &[u8]) -> Result<(u32, u16)> {
    if asc.len() < 2 {
        return Err(AppError::UnsupportedFormat("AudioSpecificConfig too short".to_string()));
    }
    let v = u16::from_be_bytes([asc[0], asc[1]]);
    let idx = ((v >> 7) & 0x0f) as u8;
    let channels = (v >> 3) & 0x0f;
    let rate = sample_rate_from_index(idx)
        .ok_or_else(|| AppError::UnsupportedFormat(format!("Sampling index {} unsupported", idx)))?;
    Ok((rate, channels))
}

fn s16_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// AAC-LC encoder producing raw (non-ADTS) access units
pub struct AacEncoder {
    config: AacConfig,
    encoder: FdkEncoder,
    output_buffer: Vec<u8>,
    frames: u64,
}

// SAFETY: the fdk handle is owned exclusively by this wrapper and only used
// through `&mut self`/`&self` from one thread at a time.
unsafe impl Send for AacEncoder {}

impl AacEncoder {
    pub fn new(config: AacConfig) -> Result<Self> {
        config.validate()?;
        let params = EncoderParams {
            bit_rate: BitRate::Cbr(config.bitrate),
            sample_rate: config.sample_rate,
            transport: Transport::Raw,
            channels: if config.channels == 1 {
                ChannelMode::Mono
            } else {
                ChannelMode::Stereo
            },
        };
        let encoder = FdkEncoder::new(params)
            .map_err(|e| AppError::Runtime(format!("Failed to create AAC encoder: {:?}", e)))?;

        info!(
            "AAC encoder created: {}Hz {}ch {}bps",
            config.sample_rate, config.channels, config.bitrate
        );

        Ok(Self {
            config,
            encoder,
            output_buffer: vec![0u8; MAX_FRAME_BYTES * config.channels as usize],
            frames: 0,
        })
    }

    pub fn config(&self) -> &AacConfig {
        &self.config
    }

    /// Encode one full frame of interleaved s16le PCM.
    ///
    /// Returns `None` while the encoder is still priming its look-ahead.
    pub fn encode(&mut self, pcm: &[u8]) -> Result<Option<Bytes>> {
        if pcm.len() != self.config.frame_bytes() {
            return Err(AppError::InvalidArgs(format!(
                "AAC frame needs {} PCM bytes, got {}",
                self.config.frame_bytes(),
                pcm.len()
            )));
        }
        let samples = s16_samples(pcm);
        let info = self
            .encoder
            .encode(&samples, &mut self.output_buffer)
            .map_err(|e| AppError::Runtime(format!("AAC encode failed: {:?}", e)))?;
        self.frames += 1;

        trace!(
            "AAC frame {}: consumed {} samples, produced {} bytes",
            self.frames,
            info.input_consumed,
            info.output_size
        );

        if info.output_size == 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&self.output_buffer[..info.output_size])))
    }

    pub fn audio_specific_config(&self) -> [u8; 2] {
        self.config.audio_specific_config()
    }
}

/// ADTS header length without CRC
const ADTS_HEADER_LEN: usize = 7;

/// Largest ADTS frame (13-bit length field)
const ADTS_MAX_FRAME: usize = 0x1fff;

/// Seven-byte ADTS header (AAC-LC, no CRC) for a raw access unit
pub fn adts_header(freq_index: u8, channels: u16, payload_len: usize) -> Result<[u8; 7]> {
    let len = payload_len + ADTS_HEADER_LEN;
    if len > ADTS_MAX_FRAME {
        return Err(AppError::InvalidArgs(format!(
            "AAC access unit of {} bytes does not fit an ADTS frame",
            payload_len
        )));
    }
    let ch = (channels & 0x07) as u8;
    // profile field is object type - 1 (AAC-LC = 1)
    Ok([
        0xff,
        0xf1,
        (1 << 6) | ((freq_index & 0x0f) << 2) | (ch >> 2),
        ((ch & 0x03) << 6) | (len >> 11) as u8,
        (len >> 3) as u8,
        (((len & 0x07) as u8) << 5) | 0x1f,
        0xfc,
    ])
}

/// AAC decoder for raw access units configured from an AudioSpecificConfig
///
/// fdk-aac is driven in ADTS mode; each access unit is framed with a
/// header built from the AudioSpecificConfig before it is filled in.
pub struct AacDecoder {
    decoder: FdkDecoder,
    pcm: Vec<i16>,
    frame: Vec<u8>,
    sample_rate: u32,
    channels: u16,
    freq_index: u8,
}

impl AacDecoder {
    pub fn new(asc: &[u8]) -> Result<Self> {
        let (sample_rate, channels) = parse_audio_specific_config(asc)?;
        let object_type = asc[0] >> 3;
        if object_type != 2 {
            return Err(AppError::UnsupportedFormat(format!(
                "AAC object type {} not supported, only AAC-LC",
                object_type
            )));
        }
        if !(1..=2).contains(&channels) {
            return Err(AppError::UnsupportedFormat(format!(
                "AAC channel configuration {} not supported",
                channels
            )));
        }
        let freq_index = sample_freq_index(sample_rate).unwrap_or(3);
        let mut decoder = FdkDecoder::new(DecTransport::Adts);
        let config_err = |e| AppError::Runtime(format!("AAC decoder config failed: {}", e));
        decoder.set_min_output_channels(channels as usize).map_err(config_err)?;
        decoder.set_max_output_channels(channels as usize).map_err(config_err)?;
        debug!("AAC decoder configured: {}Hz {}ch", sample_rate, channels);
        Ok(Self {
            decoder,
            pcm: vec![0i16; AAC_FRAME_SAMPLES * 8],
            frame: Vec::with_capacity(MAX_FRAME_BYTES * 2),
            sample_rate,
            channels,
            freq_index,
        })
    }

    /// Decode one access unit into interleaved s16le bytes
    ///
    /// Returns empty bytes when the decoder needs more input first.
    pub fn decode(&mut self, au: &[u8]) -> Result<Bytes> {
        let header = adts_header(self.freq_index, self.channels, au.len())?;
        self.frame.clear();
        self.frame.extend_from_slice(&header);
        self.frame.extend_from_slice(au);

        let pending = self
            .decoder
            .fill(&self.frame)
            .map_err(|e| AppError::Runtime(format!("AAC fill failed: {}", e)))?;
        if pending > 0 {
            trace!("AAC decoder left {} bytes unconsumed", pending);
        }
        match self.decoder.decode_frame(&mut self.pcm) {
            Ok(()) => {}
            Err(e) if e == DecoderError::NOT_ENOUGH_BITS => return Ok(Bytes::new()),
            Err(e) => return Err(AppError::Runtime(format!("AAC decode failed: {}", e))),
        }
        let n = self.decoder.decoded_frame_size().min(self.pcm.len());
        // s16le on the little-endian targets this runs on
        Ok(Bytes::copy_from_slice(bytemuck::cast_slice::<i16, u8>(&self.pcm[..n])))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_specific_config() {
        let cfg = AacConfig::default();
        // AAC-LC, 48 kHz (index 3), mono
        assert_eq!(cfg.audio_specific_config(), [0x11, 0x88]);
        assert_eq!(parse_audio_specific_config(&[0x11, 0x88]).unwrap(), (48000, 1));

        let stereo = AacConfig {
            sample_rate: 44100,
            channels: 2,
            ..Default::default()
        };
        assert_eq!(stereo.audio_specific_config(), [0x12, 0x10]);
        assert_eq!(stereo.frame_bytes(), 4096);
    }

    #[test]
    fn test_validate() {
        assert!(AacConfig::default().validate().is_ok());
        let bad_rate = AacConfig {
            sample_rate: 12345,
            ..Default::default()
        };
        assert!(bad_rate.validate().is_err());
        let bad_ch = AacConfig {
            channels: 6,
            ..Default::default()
        };
        assert!(bad_ch.validate().is_err());
    }

    #[test]
    fn test_freq_index() {
        assert_eq!(sample_freq_index(48000), Some(3));
        assert_eq!(sample_freq_index(8000), Some(11));
        assert_eq!(sample_rate_from_index(4), Some(44100));
        assert_eq!(sample_rate_from_index(15), None);
    }

    #[test]
    fn test_s16_samples_little_endian() {
        assert_eq!(s16_samples(&[0x01, 0x00, 0xff, 0xff, 0x07]), vec![1, -1]);
    }

    #[test]
    fn test_adts_header() {
        // 48 kHz mono, 100-byte access unit
        let header = adts_header(3, 1, 100).unwrap();
        assert_eq!(header, [0xff, 0xf1, 0x4c, 0x40, 0x0d, 0x7f, 0xfc]);
        let len = ((header[3] as usize & 0x03) << 11) | ((header[4] as usize) << 3) | (header[5] as usize >> 5);
        assert_eq!(len, 107);
        assert!(adts_header(3, 1, 9000).is_err());
    }

    #[test]
    fn test_decoder_rejects_unsupported_config() {
        assert!(AacDecoder::new(&[0x11]).is_err());
        // object type 5 (SBR)
        assert!(AacDecoder::new(&[0x29, 0x88]).is_err());
        let dec = AacDecoder::new(&AacConfig::default().audio_specific_config()).unwrap();
        assert_eq!((dec.sample_rate(), dec.channels()), (48000, 1));
    }

    #[test]
    fn test_encode_then_decode_tone() {
        let cfg = AacConfig::default();
        let mut enc = AacEncoder::new(cfg).unwrap();
        let mut dec = AacDecoder::new(&enc.audio_specific_config()).unwrap();

        let mut decoded = Vec::new();
        for frame in 0..12 {
            let pcm: Vec<u8> = (0..AAC_FRAME_SAMPLES)
                .flat_map(|i| {
                    let t = (frame * AAC_FRAME_SAMPLES + i) as f32 / cfg.sample_rate as f32;
                    let v = ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16;
                    v.to_le_bytes()
                })
                .collect();
            if let Some(au) = enc.encode(&pcm).unwrap() {
                let out = dec.decode(&au).unwrap();
                if !out.is_empty() {
                    assert_eq!(out.len(), cfg.frame_bytes());
                    decoded.push(out);
                }
            }
        }
        assert!(!decoded.is_empty());
        // past the encoder delay the tone is audible
        let peak = s16_samples(decoded.last().unwrap())
            .into_iter()
            .map(|v| v.unsigned_abs())
            .max()
            .unwrap();
        assert!(peak > 1000, "peak {}", peak);
    }

    #[test]
    fn test_encode_rejects_partial_frame() {
        let mut enc = AacEncoder::new(AacConfig::default()).unwrap();
        assert!(enc.encode(&[0u8; 100]).is_err());
    }
}
