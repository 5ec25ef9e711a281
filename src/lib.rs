//! maix-video - video encode/decode pipeline for embedded camera boards
//!
//! This crate provides codec channels, MP4/FLV/raw muxing and demuxing,
//! the `Encoder`/`Decoder`/`Video` front ends and a background
//! `VideoRecorder` that streams a camera to a container file.

pub mod audio;
pub mod camera;
pub mod config;
pub mod display;
pub mod error;
pub mod utils;
pub mod video;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{AppError, ErrorCode, Result};
