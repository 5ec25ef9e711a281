use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hardware timeout: {0}")]
    Timeout(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Not open: {0}")]
    NotOpen(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Buffer empty: {0}")]
    BufferEmpty(String),

    #[error("MP4 error: {0}")]
    Mp4(#[from] mp4::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// Map onto the shared numeric error enumeration
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Config(_) | AppError::InvalidArgs(_) => ErrorCode::Args,
            AppError::ResourceBusy(_) | AppError::Busy(_) => ErrorCode::Busy,
            AppError::Io(_) | AppError::Mp4(_) | AppError::Json(_) => ErrorCode::Io,
            AppError::Timeout(_) => ErrorCode::Timeout,
            AppError::Runtime(_) => ErrorCode::Runtime,
            AppError::NotImplemented(_) | AppError::UnsupportedFormat(_) => ErrorCode::NotImpl,
            AppError::NotOpen(_) => ErrorCode::NotOpen,
            AppError::NotReady(_) => ErrorCode::NotReady,
            AppError::BufferEmpty(_) => ErrorCode::BuffEmpty,
        }
    }

    /// True for errors a caller may simply retry (push/pop deadline expiry)
    pub fn is_timeout(&self) -> bool {
        matches!(self, AppError::Timeout(_))
    }
}

/// Shared error enumeration used for exit codes and status reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum ErrorCode {
    None = 0,
    Args,
    Io,
    Runtime,
    NotImpl,
    Timeout,
    Busy,
    NotOpen,
    NotReady,
    BuffEmpty,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::None => "NONE",
            ErrorCode::Args => "ARGS",
            ErrorCode::Io => "IO",
            ErrorCode::Runtime => "RUNTIME",
            ErrorCode::NotImpl => "NOT_IMPL",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Busy => "BUSY",
            ErrorCode::NotOpen => "NOT_OPEN",
            ErrorCode::NotReady => "NOT_READY",
            ErrorCode::BuffEmpty => "BUFF_EMPTY",
        };
        write!(f, "{}", name)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
