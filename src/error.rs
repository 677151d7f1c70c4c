//! Error types for the audio server

use thiserror::Error;

use crate::protocol::StreamConfig;

/// Main error type for the server
///
/// Control-plane calls return these synchronously. The audio loops never
/// surface per-track failures to callers; they recover locally.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Operation would block")]
    WouldBlock,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not enough data")]
    NotEnoughData,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable negative status code, for transports that carry integers.
    pub fn status_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => -22,
            Error::NotInitialized(_) => -19,
            Error::PermissionDenied(_) => -1,
            Error::OutOfMemory(_) => -12,
            Error::AlreadyExists(_) => -17,
            Error::WouldBlock => -11,
            Error::Timeout(_) => -110,
            Error::NotEnoughData => -61,
            Error::InvalidOperation(_) => -38,
            Error::Hardware(HardwareError::BadValue(_)) => -22,
            Error::Hardware(HardwareError::StandbyRequired) => -38,
            Error::Hardware(_) => -5,
            Error::Config(_) => -22,
            Error::Io(_) => -5,
        }
    }
}

/// Errors reported by a hardware abstraction
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    #[error("Hardware not initialized: {0}")]
    InitFailed(String),

    #[error("Stream config rejected, hardware proposes {proposed:?}")]
    ConfigRejected { proposed: StreamConfig },

    #[error("Bad parameter value: {0}")]
    BadValue(String),

    #[error("Change requires the stream to be in standby")]
    StandbyRequired,

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Stream I/O failed: {0}")]
    Io(String),

    #[error("Device error: {0}")]
    Device(String),
}

/// Result type alias for the server
pub type Result<T> = std::result::Result<T, Error>;
