//! Byte-exact PCM chunking
//!
//! Audio arrives in whatever sizes the microphone hands out; the AAC encoder
//! wants exactly `frame_samples` samples per channel per call. Partial tails
//! are retained across pushes and only whole chunks are released.

use bytes::{Bytes, BytesMut};

use super::SampleFormat;

/// One codec-sized PCM chunk
#[derive(Debug, Clone)]
pub struct PcmChunk {
    pub data: Bytes,
    /// Running sample-count timestamp (time base 1/sample_rate)
    pub pts: i64,
    /// Samples per channel in this chunk
    pub samples: usize,
}

pub struct PcmChunker {
    chunk_bytes: usize,
    bytes_per_frame: usize,
    pending: BytesMut,
    next_pts: i64,
}

impl PcmChunker {
    pub fn new(frame_samples: usize, channels: u16, format: SampleFormat) -> Self {
        let bytes_per_frame = channels.max(1) as usize * format.bytes_per_sample();
        let chunk_bytes = frame_samples.max(1) * bytes_per_frame;
        Self {
            chunk_bytes,
            bytes_per_frame,
            pending: BytesMut::with_capacity(chunk_bytes * 2),
            next_pts: 0,
        }
    }

    /// Append PCM and return every complete chunk now available
    pub fn push(&mut self, pcm: &[u8]) -> Vec<PcmChunk> {
        self.pending.extend_from_slice(pcm);
        let mut chunks = Vec::with_capacity(self.pending.len() / self.chunk_bytes);
        while self.pending.len() >= self.chunk_bytes {
            let data = self.pending.split_to(self.chunk_bytes).freeze();
            let samples = self.chunk_bytes / self.bytes_per_frame;
            chunks.push(PcmChunk {
                data,
                pts: self.next_pts,
                samples,
            });
            self.next_pts += samples as i64;
        }
        chunks
    }

    /// Bytes held back waiting for a full chunk
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    pub fn next_pts(&self) -> i64 {
        self.next_pts
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.next_pts = 0;
    }
}

/// PCM bytes covering one video frame interval, rounded up to whole sample frames
pub fn pcm_bytes_per_video_frame(sample_rate: u32, channels: u16, format: SampleFormat, fps: u32) -> usize {
    let bytes_per_frame = channels.max(1) as usize * format.bytes_per_sample();
    let per_second = sample_rate as usize * bytes_per_frame;
    let fps = fps.max(1) as usize;
    let raw = per_second.div_ceil(fps);
    raw.div_ceil(bytes_per_frame) * bytes_per_frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_chunks_retained() {
        // 4 samples mono s16 = 8 bytes per chunk
        let mut chunker = PcmChunker::new(4, 1, SampleFormat::S16Le);
        assert!(chunker.push(&[0; 5]).is_empty());
        assert_eq!(chunker.pending_len(), 5);

        let chunks = chunker.push(&[1; 13]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].pts, 0);
        assert_eq!(chunks[1].pts, 4);
        assert_eq!(chunks[0].samples, 4);
        assert_eq!(&chunks[0].data[..], &[0, 0, 0, 0, 0, 1, 1, 1]);
        assert_eq!(chunker.pending_len(), 2);
        assert_eq!(chunker.next_pts(), 8);
    }

    #[test]
    fn test_stereo_pts_counts_sample_frames() {
        let mut chunker = PcmChunker::new(1024, 2, SampleFormat::S16Le);
        assert_eq!(chunker.chunk_bytes(), 4096);
        let chunks = chunker.push(&vec![0u8; 4096 * 3]);
        let pts: Vec<i64> = chunks.iter().map(|c| c.pts).collect();
        assert_eq!(pts, vec![0, 1024, 2048]);
        chunker.reset();
        assert_eq!(chunker.next_pts(), 0);
    }

    #[test]
    fn test_bytes_per_video_frame() {
        // 48000 * 2 bytes / 30 fps = 3200 bytes
        assert_eq!(pcm_bytes_per_video_frame(48000, 1, SampleFormat::S16Le, 30), 3200);
        // 44100 * 2 / 30 = 2940
        assert_eq!(pcm_bytes_per_video_frame(44100, 1, SampleFormat::S16Le, 30), 2940);
        // 44100 * 4 / 60 = 2940, already aligned to 4
        assert_eq!(pcm_bytes_per_video_frame(44100, 2, SampleFormat::S16Le, 60), 2940);
        // 8000 * 2 / 7 = 2285.7 -> 2286 bytes -> aligned to 2
        assert_eq!(pcm_bytes_per_video_frame(8000, 1, SampleFormat::S16Le, 7), 2286);
    }
}
