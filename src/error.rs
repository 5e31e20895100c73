//! Error types for the live session engine

use thiserror::Error;

/// Failures while opening a connection to the remote service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Credential rejected: {0}")]
    Auth(String),

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Timed out")]
    Timeout,
}

/// Failures while enqueueing an outbound message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Capture device errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Capture permission denied: {0}")]
    PermissionDenied(String),

    #[error("Frame encoding failed: {0}")]
    Encoding(String),
}

/// Faults of a live connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportFault {
    #[error("Connection dropped: {0}")]
    Dropped(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Playback device errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("Playback device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse {
        path: std::path::PathBuf,
        message: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Why a session ended up `Faulted`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionFault {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Transport(#[from] TransportFault),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error("Session setup exceeded {0:?}")]
    StartTimeout(std::time::Duration),

    #[error("Reconnect gave up after {attempts} attempts: {last}")]
    ReconnectExhausted { attempts: u32, last: ConnectError },
}
