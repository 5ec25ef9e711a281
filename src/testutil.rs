//! Shared fixtures for unit tests: synthetic NAL packets, an in-memory
//! container sink, a small MP4 writer and mock collaborators.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::{AudioRecorder, SampleFormat};
use crate::camera::{Camera, CameraFrame};
use crate::display::{Display, Fit};
use crate::error::{AppError, Result};
use crate::video::channel::{
    CodecChannelConfig, DecodeChannel, DecodeChannelFactory, EncodeChannel, EncodeChannelFactory,
    EncodedOutput, HardwareCodecChannel,
};
use crate::video::format::{PixelFormat, Resolution, Timebase};
use crate::video::frame::Image;
use crate::video::mux::ContainerSink;
use crate::video::nal;
use crate::video::packet::Packet;

pub const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1e, 0xab];
pub const PPS: &[u8] = &[0x68, 0xce, 0x3c, 0x80];
pub const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x00];
pub const P_SLICE: &[u8] = &[0x41, 0x9a, 0x00];
pub const SEI: &[u8] = &[0x06, 0x05, 0x01];

pub fn nal_for_type(nal_type: u8) -> &'static [u8] {
    match nal_type {
        7 => SPS,
        8 => PPS,
        5 => IDR,
        6 => SEI,
        _ => P_SLICE,
    }
}

/// Annex-B packet holding one fake NAL per entry of `types`
pub fn annexb_packet(types: &[u8], pts: i64) -> Packet {
    let data = nal::to_annexb(types.iter().map(|t| nal_for_type(*t)));
    Packet::new(Bytes::from(data), pts, pts, 0)
}

#[derive(Default)]
struct SinkState {
    video: Vec<Packet>,
    audio: Vec<Packet>,
    finished: bool,
}

/// Container sink recording everything written to it
#[derive(Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<SinkState>>,
}

impl MemorySink {
    pub fn video(&self) -> Vec<Packet> {
        self.state.lock().video.clone()
    }

    pub fn audio(&self) -> Vec<Packet> {
        self.state.lock().audio.clone()
    }

    pub fn finished(&self) -> bool {
        self.state.lock().finished
    }
}

impl ContainerSink for MemorySink {
    fn write_video(&mut self, packet: &Packet) -> Result<()> {
        self.state.lock().video.push(packet.clone());
        Ok(())
    }

    fn write_audio(&mut self, packet: &Packet) -> Result<()> {
        self.state.lock().audio.push(packet.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.state.lock().finished = true;
        Ok(())
    }
}

/// One video sample for [`write_test_mp4`]
#[derive(Debug, Clone, Copy)]
pub struct TestSample {
    pub pts: i64,
    pub dts: i64,
    pub duration: u32,
    pub sync: bool,
}

impl TestSample {
    pub fn new(pts: i64, dts: i64, duration: u32, sync: bool) -> Self {
        Self {
            pts,
            dts,
            duration,
            sync,
        }
    }
}

/// Write a VGA H.264 MP4 whose samples carry fake IDR/P slices.
///
/// Sample times come from the durations; `dts` only feeds the composition
/// offset, so callers keep `dts[i + 1] == dts[i] + duration[i]`.
pub fn write_test_mp4(path: &Path, timebase: Timebase, samples: &[TestSample]) {
    use mp4::{AvcConfig, MediaConfig, Mp4Config, Mp4Sample, Mp4Writer, TrackConfig, TrackType};

    let file = std::io::BufWriter::new(std::fs::File::create(path).unwrap());
    let config = Mp4Config {
        major_brand: "isom".parse().unwrap(),
        minor_version: 512,
        compatible_brands: vec!["isom".parse().unwrap(), "avc1".parse().unwrap()],
        timescale: 1000,
    };
    let mut writer = Mp4Writer::write_start(file, &config).unwrap();
    writer
        .add_track(&TrackConfig {
            track_type: TrackType::Video,
            timescale: timebase.den as u32,
            language: "und".to_string(),
            media_conf: MediaConfig::AvcConfig(AvcConfig {
                width: 640,
                height: 480,
                seq_param_set: SPS.to_vec(),
                pic_param_set: PPS.to_vec(),
            }),
        })
        .unwrap();
    for sample in samples {
        let slice = if sample.sync { IDR } else { P_SLICE };
        let bytes = nal::annexb_to_avcc(&nal::to_annexb([slice]));
        writer
            .write_sample(
                1,
                &Mp4Sample {
                    start_time: sample.dts as u64,
                    duration: sample.duration,
                    rendering_offset: (sample.pts - sample.dts) as i32,
                    is_sync: sample.sync,
                    bytes: Bytes::from(bytes),
                },
            )
            .unwrap();
    }
    writer.write_end().unwrap();
}

struct CameraState {
    resolution: Resolution,
    fps: u32,
    reads: u64,
    frees: u64,
    outstanding: HashSet<u64>,
    next_handle: u64,
    fail_every: Option<u64>,
    channels: u32,
}

/// Camera that counts pops and frees and can fail on demand
pub struct MockCamera {
    channel: u32,
    format: PixelFormat,
    state: Mutex<CameraState>,
}

impl MockCamera {
    pub fn new(resolution: Resolution, format: PixelFormat) -> Self {
        Self::with_channel(0, resolution, format)
    }

    fn with_channel(channel: u32, resolution: Resolution, format: PixelFormat) -> Self {
        Self {
            channel,
            format,
            state: Mutex::new(CameraState {
                resolution,
                fps: 30,
                reads: 0,
                frees: 0,
                outstanding: HashSet::new(),
                next_handle: 0,
                fail_every: None,
                channels: 0,
            }),
        }
    }

    /// Every `n`th read fails with a runtime error
    pub fn failing_every(self, n: u64) -> Self {
        self.state.lock().fail_every = Some(n.max(1));
        self
    }

    pub fn reads(&self) -> u64 {
        self.state.lock().reads
    }

    pub fn frees(&self) -> u64 {
        self.state.lock().frees
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }
}

impl Camera for MockCamera {
    fn read(&self, _timeout: Duration) -> Result<CameraFrame> {
        let mut state = self.state.lock();
        state.reads += 1;
        if let Some(n) = state.fail_every {
            if state.reads % n == 0 {
                return Err(AppError::Runtime("injected camera failure".to_string()));
            }
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state.outstanding.insert(handle);
        let mut image = Image::zeroed(state.resolution, self.format);
        let luma = (state.resolution.width * state.resolution.height) as usize;
        image.data_mut()[..luma].fill(16);
        Ok(CameraFrame::new(image, handle))
    }

    fn free(&self, frame: CameraFrame) {
        let mut state = self.state.lock();
        if state.outstanding.remove(&frame.handle()) {
            state.frees += 1;
        }
    }

    fn channel(&self) -> u32 {
        self.channel
    }

    fn width(&self) -> u32 {
        self.state.lock().resolution.width
    }

    fn height(&self) -> u32 {
        self.state.lock().resolution.height
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn fps(&self) -> u32 {
        self.state.lock().fps
    }

    fn set_resolution(&self, width: u32, height: u32) -> Result<()> {
        self.state.lock().resolution = Resolution::new(width, height);
        Ok(())
    }

    fn set_fps(&self, fps: u32) -> Result<()> {
        self.state.lock().fps = fps;
        Ok(())
    }

    fn add_channel(&self, width: u32, height: u32, format: PixelFormat) -> Result<Arc<dyn Camera>> {
        let channel = {
            let mut state = self.state.lock();
            state.channels += 1;
            self.channel + state.channels
        };
        Ok(Arc::new(MockCamera::with_channel(
            channel,
            Resolution::new(width, height),
            format,
        )))
    }
}

/// Display remembering what was pushed to it
#[derive(Default)]
pub struct MockDisplay {
    frames: Mutex<Vec<(Resolution, Fit)>>,
    last: Mutex<Option<Vec<u8>>>,
}

impl MockDisplay {
    pub fn pushes(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn last_fit(&self) -> Option<Fit> {
        self.frames.lock().last().map(|f| f.1)
    }

    pub fn last_data(&self) -> Option<Vec<u8>> {
        self.last.lock().clone()
    }
}

impl Display for MockDisplay {
    fn push(&self, image: &Image, fit: Fit) -> Result<()> {
        self.frames.lock().push((image.resolution(), fit));
        *self.last.lock() = Some(image.data().to_vec());
        Ok(())
    }

    fn width(&self) -> u32 {
        640
    }

    fn height(&self) -> u32 {
        480
    }
}

/// Microphone returning silence
pub struct MockAudio {
    sample_rate: u32,
    channels: u16,
    muted: AtomicBool,
    volume: AtomicU32,
    requested: Mutex<usize>,
}

impl MockAudio {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            muted: AtomicBool::new(false),
            volume: AtomicU32::new(80),
            requested: Mutex::new(0),
        }
    }

    /// PCM bytes handed out so far
    pub fn bytes_read(&self) -> usize {
        *self.requested.lock()
    }
}

impl AudioRecorder for MockAudio {
    fn record_bytes(&self, bytes: usize) -> Result<Bytes> {
        *self.requested.lock() += bytes;
        Ok(Bytes::from(vec![0u8; bytes]))
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
        Ok(1024)
    }

    fn mute(&self, mute: Option<bool>) -> bool {
        if let Some(m) = mute {
            self.muted.store(m, Ordering::SeqCst);
        }
        self.muted.load(Ordering::SeqCst)
    }

    fn volume(&self, volume: Option<u32>) -> u32 {
        if let Some(v) = volume {
            self.volume.store(v.min(100), Ordering::SeqCst);
        }
        self.volume.load(Ordering::SeqCst)
    }
}

/// Open/close/push accounting shared by scripted channels and their test
#[derive(Debug, Default)]
pub struct ChannelLog {
    pub opens: Vec<CodecChannelConfig>,
    pub closes: usize,
    pub pushes: usize,
    /// First luma byte of the most recent encode input
    pub last_luma: Option<u8>,
    /// Make the next decode channel close fail
    pub fail_close: bool,
}

/// Encode channel whose n-th push yields `script[n]` NAL fragments.
///
/// Three or more fragments produce SPS + PPS + IDR (+ P slices), two an
/// SEI + P slice, one a lone P slice. Pushes past the script yield one.
pub struct ScriptedEncodeChannel {
    log: Arc<Mutex<ChannelLog>>,
    script: Vec<usize>,
    config: Option<CodecChannelConfig>,
    queue: VecDeque<EncodedOutput>,
    pushed: usize,
}

impl ScriptedEncodeChannel {
    pub fn new(script: Vec<usize>, log: Arc<Mutex<ChannelLog>>) -> Self {
        Self {
            log,
            script,
            config: None,
            queue: VecDeque::new(),
            pushed: 0,
        }
    }
}

impl HardwareCodecChannel for ScriptedEncodeChannel {
    type Input = Image;
    type Output = EncodedOutput;

    fn channel_id(&self) -> Option<u32> {
        self.config.as_ref().map(|_| 0)
    }

    fn open(&mut self, config: &CodecChannelConfig) -> Result<()> {
        if self.config.is_some() {
            return Err(AppError::Busy("scripted channel already open".to_string()));
        }
        config.validate_encode()?;
        self.log.lock().opens.push(config.clone());
        self.config = Some(config.clone());
        Ok(())
    }

    fn push(&mut self, input: &Image, _timeout: Duration) -> Result<()> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| AppError::NotOpen("scripted channel".to_string()))?;
        if !config.matches(input) {
            return Err(AppError::Config("geometry mismatch".to_string()));
        }
        let count = self.script.get(self.pushed).copied().unwrap_or(1);
        self.pushed += 1;
        {
            let mut log = self.log.lock();
            log.pushes += 1;
            log.last_luma = input.data().first().copied();
        }

        let types: Vec<u8> = match count {
            0 => Vec::new(),
            1 => vec![1],
            2 => vec![6, 1],
            n => [7, 8, 5].into_iter().chain(std::iter::repeat(1).take(n - 3)).collect(),
        };
        if !types.is_empty() {
            let data = nal::to_annexb(types.iter().map(|t| nal_for_type(*t)));
            self.queue
                .push_back(EncodedOutput::from_annexb(&data, config.resolution()));
        }
        Ok(())
    }

    fn pop(&mut self, _timeout: Duration) -> Result<Option<EncodedOutput>> {
        Ok(self.queue.pop_front())
    }

    fn close(&mut self) -> Result<()> {
        if self.config.take().is_some() {
            self.log.lock().closes += 1;
            self.queue.clear();
        }
        Ok(())
    }

    fn config(&self) -> Option<&CodecChannelConfig> {
        self.config.as_ref()
    }
}

pub fn scripted_encode_factory(script: Vec<usize>) -> (EncodeChannelFactory, Arc<Mutex<ChannelLog>>) {
    let log = Arc::new(Mutex::new(ChannelLog::default()));
    let shared = log.clone();
    let factory: EncodeChannelFactory = Arc::new(move || {
        Box::new(ScriptedEncodeChannel::new(script.clone(), shared.clone())) as Box<EncodeChannel>
    });
    (factory, log)
}

/// Decode channel producing one blank frame per pushed picture
pub struct ScriptedDecodeChannel {
    log: Arc<Mutex<ChannelLog>>,
    config: Option<CodecChannelConfig>,
    queue: VecDeque<Image>,
}

impl HardwareCodecChannel for ScriptedDecodeChannel {
    type Input = [u8];
    type Output = Image;

    fn channel_id(&self) -> Option<u32> {
        self.config.as_ref().map(|_| 0)
    }

    fn open(&mut self, config: &CodecChannelConfig) -> Result<()> {
        self.log.lock().opens.push(config.clone());
        self.config = Some(config.clone());
        Ok(())
    }

    fn push(&mut self, input: &[u8], _timeout: Duration) -> Result<()> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| AppError::NotOpen("scripted channel".to_string()))?;
        self.log.lock().pushes += 1;
        if nal::contains_nal(input, &[1, 5]) {
            let resolution = if config.resolution().is_valid() {
                config.resolution()
            } else {
                Resolution::QVGA
            };
            self.queue
                .push_back(Image::zeroed(resolution, config.pixel_format));
        }
        Ok(())
    }

    fn pop(&mut self, _timeout: Duration) -> Result<Option<Image>> {
        Ok(self.queue.pop_front())
    }

    fn close(&mut self) -> Result<()> {
        if self.config.take().is_some() {
            let mut log = self.log.lock();
            log.closes += 1;
            if std::mem::take(&mut log.fail_close) {
                return Err(AppError::Runtime("injected close failure".to_string()));
            }
        }
        Ok(())
    }

    fn config(&self) -> Option<&CodecChannelConfig> {
        self.config.as_ref()
    }
}

pub fn scripted_decode_factory() -> (DecodeChannelFactory, Arc<Mutex<ChannelLog>>) {
    let log = Arc::new(Mutex::new(ChannelLog::default()));
    let shared = log.clone();
    let factory: DecodeChannelFactory = Arc::new(move || {
        Box::new(ScriptedDecodeChannel {
            log: shared.clone(),
            config: None,
            queue: VecDeque::new(),
        }) as Box<DecodeChannel>
    });
    (factory, log)
}

/// Route `tracing` output to the test harness
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("maix_video=debug")
        .try_init();
}
