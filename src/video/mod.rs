//! Video encode/decode pipeline
//!
//! Codec channels sit at the bottom, containers wrap them, and the
//! `Encoder`, `Decoder`, `Video` and `VideoRecorder` front ends compose
//! the two with camera, audio and display collaborators.

pub mod channel;
pub mod convert;
pub mod decoder;
pub mod demux;
pub mod encoder;
pub mod facade;
pub mod format;
pub mod frame;
pub mod mux;
pub mod nal;
pub mod packet;
pub mod recorder;

pub use channel::{CodecChannelConfig, EncodedOutput, HardwareCodecChannel};
pub use convert::{PixelConverter, Yuv420pBuffer};
pub use decoder::Decoder;
pub use demux::ContainerDemuxer;
pub use encoder::{Encoder, EncoderConfig};
pub use facade::{Video, VideoOptions};
pub use format::{CodecType, Container, MediaType, PixelFormat, Resolution, Timebase, VideoType};
pub use frame::{Image, MediaBuffer, Ownership};
pub use mux::ContainerMuxer;
pub use packet::{Context, Packet};
pub use recorder::{Color, RecorderLock, RecorderState, RectOverlay, VideoRecorder};
