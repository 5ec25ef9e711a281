//! H.264 NAL unit framing: Annex-B start codes, AVCC length prefixes,
//! parameter sets and access-unit splitting.

use crate::error::{AppError, Result};

/// H.264 NAL unit type constants
pub mod nal_type {
    pub const NON_IDR_SLICE: u8 = 1;
    pub const IDR_SLICE: u8 = 5;
    pub const SEI: u8 = 6;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const AUD: u8 = 9;
}

pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// NAL unit type of an H.264 NAL (first header byte)
pub fn h264_type(nal: &[u8]) -> u8 {
    nal.first().map(|b| b & 0x1f).unwrap_or(0)
}

/// True for a coded slice whose `first_mb_in_slice` is zero, i.e. the first
/// slice of a new picture.
pub fn is_first_slice(nal: &[u8]) -> bool {
    matches!(h264_type(nal), nal_type::NON_IDR_SLICE..=nal_type::IDR_SLICE)
        && nal.get(1).map(|b| b & 0x80 != 0).unwrap_or(false)
}

/// Split an Annex-B stream into NAL payloads (start codes stripped)
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let mut end = match starts.get(idx + 1) {
            Some(&next) => next - 3,
            None => data.len(),
        };
        // zero bytes before the next start code belong to it (4-byte codes, trailing_zero_8bits)
        while end > start && data[end - 1] == 0 {
            end -= 1;
        }
        if end > start {
            nals.push(&data[start..end]);
        }
    }
    nals
}

/// NAL types present in an Annex-B buffer, in stream order
pub fn nal_types(data: &[u8]) -> Vec<u8> {
    split_annexb(data).into_iter().map(h264_type).collect()
}

pub fn contains_nal(data: &[u8], types: &[u8]) -> bool {
    split_annexb(data)
        .into_iter()
        .any(|nal| types.contains(&h264_type(nal)))
}

/// Join NAL payloads with 4-byte start codes
pub fn to_annexb<'a>(nals: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for nal in nals {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(nal);
    }
    out
}

/// Annex-B to 4-byte length-prefixed (AVCC) framing
pub fn annexb_to_avcc(data: &[u8]) -> Vec<u8> {
    let nals = split_annexb(data);
    let mut out = Vec::with_capacity(data.len() + nals.len() * 4);
    for nal in nals {
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

/// AVCC sample payload: like [`annexb_to_avcc`] but without in-band
/// SPS/PPS/AUD, which containers carry out of band
pub fn annexb_to_avcc_sample(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for nal in split_annexb(data) {
        if matches!(h264_type(nal), nal_type::SPS | nal_type::PPS | nal_type::AUD) {
            continue;
        }
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

/// AVCC sample that keeps parameter sets in-band
///
/// Used once the stream's SPS/PPS no longer match the container header.
/// An IDR access unit without its own SPS gets `sets` prepended; AUDs are
/// still dropped.
pub fn annexb_to_avcc_inband(data: &[u8], sets: &ParameterSets) -> Vec<u8> {
    let nals = split_annexb(data);
    let has_idr = nals.iter().any(|n| h264_type(n) == nal_type::IDR_SLICE);
    let has_sps = nals.iter().any(|n| h264_type(n) == nal_type::SPS);

    let mut out = Vec::with_capacity(data.len() + sets.sps.len() + sets.pps.len() + 8);
    let prefix = if has_idr && !has_sps {
        vec![sets.sps.as_slice(), sets.pps.as_slice()]
    } else {
        Vec::new()
    };
    for nal in prefix.into_iter().chain(nals) {
        if h264_type(nal) == nal_type::AUD {
            continue;
        }
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

/// Split length-prefixed NALs; `length_size` is 1, 2 or 4
pub fn split_avcc(data: &[u8], length_size: usize) -> Result<Vec<&[u8]>> {
    if !matches!(length_size, 1 | 2 | 4) {
        return Err(AppError::UnsupportedFormat(format!(
            "NAL length size {} not supported",
            length_size
        )));
    }
    let mut nals = Vec::new();
    let mut pos = 0;
    while pos + length_size <= data.len() {
        let len = data[pos..pos + length_size]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        pos += length_size;
        if pos + len > data.len() {
            return Err(AppError::Runtime(format!(
                "NAL length {} exceeds remaining {} bytes",
                len,
                data.len() - pos
            )));
        }
        if len > 0 {
            nals.push(&data[pos..pos + len]);
        }
        pos += len;
    }
    Ok(nals)
}

pub fn avcc_to_annexb(data: &[u8], length_size: usize) -> Result<Vec<u8>> {
    Ok(to_annexb(split_avcc(data, length_size)?))
}

/// First SPS/PPS pair found in an Annex-B buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSets {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

impl ParameterSets {
    pub fn from_annexb(data: &[u8]) -> Option<Self> {
        let mut sps = None;
        let mut pps = None;
        for nal in split_annexb(data) {
            match h264_type(nal) {
                nal_type::SPS if sps.is_none() => sps = Some(nal.to_vec()),
                nal_type::PPS if pps.is_none() => pps = Some(nal.to_vec()),
                _ => {}
            }
        }
        Some(Self { sps: sps?, pps: pps? })
    }

    /// SPS then PPS with start codes, ready to prepend to an IDR
    pub fn to_annexb(&self) -> Vec<u8> {
        to_annexb([self.sps.as_slice(), self.pps.as_slice()])
    }

    /// (profile_idc, constraint flags, level_idc) from the SPS header
    pub fn profile(&self) -> (u8, u8, u8) {
        (
            self.sps.get(1).copied().unwrap_or(0x42),
            self.sps.get(2).copied().unwrap_or(0),
            self.sps.get(3).copied().unwrap_or(0x1e),
        )
    }
}

/// AVCDecoderConfigurationRecord (ISO/IEC 14496-15 `avcC`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfigRecord {
    pub length_size: usize,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
}

impl AvcConfigRecord {
    pub fn from_parameter_sets(ps: &ParameterSets) -> Self {
        Self {
            length_size: 4,
            sps: vec![ps.sps.clone()],
            pps: vec![ps.pps.clone()],
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let short = || AppError::UnsupportedFormat("truncated avcC record".to_string());
        if data.len() < 6 || data[0] != 1 {
            return Err(short());
        }
        let length_size = (data[4] & 0x03) as usize + 1;
        let mut pos = 5;

        let read_sets = |count: usize, pos: &mut usize| -> Result<Vec<Vec<u8>>> {
            let mut sets = Vec::with_capacity(count);
            for _ in 0..count {
                if *pos + 2 > data.len() {
                    return Err(short());
                }
                let len = u16::from_be_bytes([data[*pos], data[*pos + 1]]) as usize;
                *pos += 2;
                if *pos + len > data.len() {
                    return Err(short());
                }
                sets.push(data[*pos..*pos + len].to_vec());
                *pos += len;
            }
            Ok(sets)
        };

        let sps_count = (data[pos] & 0x1f) as usize;
        pos += 1;
        let sps = read_sets(sps_count, &mut pos)?;
        let pps_count = *data.get(pos).ok_or_else(short)? as usize;
        pos += 1;
        let pps = read_sets(pps_count, &mut pos)?;

        Ok(Self { length_size, sps, pps })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let first = self.sps.first().map(Vec::as_slice).unwrap_or(&[]);
        let mut out = vec![
            1,
            first.get(1).copied().unwrap_or(0x42),
            first.get(2).copied().unwrap_or(0),
            first.get(3).copied().unwrap_or(0x1e),
            0xfc | (self.length_size.saturating_sub(1) as u8 & 0x03),
            0xe0 | (self.sps.len() as u8 & 0x1f),
        ];
        for sps in &self.sps {
            out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
            out.extend_from_slice(sps);
        }
        out.push(self.pps.len() as u8);
        for pps in &self.pps {
            out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
            out.extend_from_slice(pps);
        }
        out
    }

    pub fn parameter_sets(&self) -> Option<ParameterSets> {
        Some(ParameterSets {
            sps: self.sps.first()?.clone(),
            pps: self.pps.first()?.clone(),
        })
    }
}

/// Group an Annex-B elementary stream into access units (one picture each).
///
/// A new unit starts at an AUD/SPS/PPS/SEI or at the first slice of a
/// picture once the current unit already holds a slice.
pub fn split_access_units(data: &[u8]) -> Vec<Vec<u8>> {
    let mut units = Vec::new();
    let mut current: Vec<&[u8]> = Vec::new();
    let mut has_slice = false;

    for nal in split_annexb(data) {
        let t = h264_type(nal);
        let starts_unit = matches!(t, nal_type::SEI | nal_type::SPS | nal_type::PPS | nal_type::AUD)
            || is_first_slice(nal);
        if has_slice && starts_unit {
            units.push(to_annexb(current.drain(..)));
            has_slice = false;
        }
        if matches!(t, nal_type::NON_IDR_SLICE..=nal_type::IDR_SLICE) {
            has_slice = true;
        }
        current.push(nal);
    }
    if !current.is_empty() {
        units.push(to_annexb(current));
    }
    units
}

/// Fields of an H.264 sequence parameter set needed to size the output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
}

impl SpsInfo {
    /// Parse an SPS NAL (header byte included)
    pub fn parse(sps: &[u8]) -> Result<Self> {
        if h264_type(sps) != nal_type::SPS || sps.len() < 4 {
            return Err(AppError::UnsupportedFormat("not an SPS NAL unit".to_string()));
        }
        let rbsp = strip_emulation_prevention(&sps[1..]);
        let mut r = BitReader::new(&rbsp);
        let profile_idc = r.bits(8)? as u8;
        r.skip(8)?;
        let level_idc = r.bits(8)? as u8;
        r.ue()?;

        let mut chroma_format_idc = 1;
        if matches!(profile_idc, 100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135) {
            chroma_format_idc = r.ue()?;
            if chroma_format_idc == 3 {
                r.skip(1)?;
            }
            r.ue()?;
            r.ue()?;
            r.skip(1)?;
            if r.flag()? {
                let lists = if chroma_format_idc == 3 { 12 } else { 8 };
                for i in 0..lists {
                    if r.flag()? {
                        r.skip_scaling_list(if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        r.ue()?;
        match r.ue()? {
            0 => {
                r.ue()?;
            }
            1 => {
                r.skip(1)?;
                r.se()?;
                r.se()?;
                for _ in 0..r.ue()? {
                    r.se()?;
                }
            }
            _ => {}
        }
        r.ue()?;
        r.skip(1)?;
        let width_mbs = r.ue()? + 1;
        let height_map_units = r.ue()? + 1;
        let frame_mbs_only = r.flag()?;
        if !frame_mbs_only {
            r.skip(1)?;
        }
        r.skip(1)?;

        let mut width = width_mbs * 16;
        let mut height = (2 - frame_mbs_only as u32) * height_map_units * 16;
        if r.flag()? {
            let (left, right, top, bottom) = (r.ue()?, r.ue()?, r.ue()?, r.ue()?);
            let (crop_x, crop_y) = match chroma_format_idc {
                0 => (1, 2 - frame_mbs_only as u32),
                1 => (2, 2 * (2 - frame_mbs_only as u32)),
                2 => (2, 2 - frame_mbs_only as u32),
                _ => (1, 2 - frame_mbs_only as u32),
            };
            width = width.saturating_sub(crop_x * (left + right));
            height = height.saturating_sub(crop_y * (top + bottom));
        }

        Ok(Self {
            profile_idc,
            level_idc,
            width,
            height,
        })
    }
}

/// Drop the `03` byte of every `00 00 03` sequence
fn strip_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

/// MSB-first bit reader with Exp-Golomb helpers
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bit(&mut self) -> Result<u32> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or_else(|| AppError::UnsupportedFormat("truncated SPS".to_string()))?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Ok(bit as u32)
    }

    fn bits(&mut self, n: u32) -> Result<u32> {
        let mut v = 0;
        for _ in 0..n {
            v = (v << 1) | self.bit()?;
        }
        Ok(v)
    }

    fn flag(&mut self) -> Result<bool> {
        Ok(self.bit()? == 1)
    }

    fn skip(&mut self, n: u32) -> Result<()> {
        self.bits(n).map(|_| ())
    }

    fn ue(&mut self) -> Result<u32> {
        let mut zeros = 0;
        while self.bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return Err(AppError::UnsupportedFormat("Exp-Golomb code too long".to_string()));
            }
        }
        Ok((1u32 << zeros) - 1 + self.bits(zeros)?)
    }

    fn se(&mut self) -> Result<i32> {
        let v = self.ue()?;
        Ok(if v % 2 == 1 { ((v + 1) / 2) as i32 } else { -((v / 2) as i32) })
    }

    fn skip_scaling_list(&mut self, size: usize) -> Result<()> {
        let mut last = 8i32;
        let mut next = 8i32;
        for _ in 0..size {
            if next != 0 {
                next = (last + self.se()? + 256) % 256;
            }
            if next != 0 {
                last = next;
            }
        }
        Ok(())
    }
}
