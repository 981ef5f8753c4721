//! Error types for the relay engine.
//!
//! `PortError` describes what a single capture/playback stream reported;
//! `RelayError` is what the control surface hands back to its caller.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by a capture or playback port.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    /// The device exists but another client holds it
    #[error("device busy: {0}")]
    Busy(String),

    /// No device matched the requested name
    #[error("device not found: {0}")]
    NotFound(String),

    /// The device rejected the requested rate, format or channel count
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    /// Overrun/underrun; the stream was re-prepared and can be used again
    #[error("stream xrun: {0}")]
    Xrun(String),

    /// A single read or write failed but the stream is still usable
    #[error("transient I/O error: {0}")]
    Transient(String),

    /// The device went away or the stream can no longer be recovered
    #[error("device disconnected: {0}")]
    Disconnected(String),

    /// Any other backend failure
    #[error("audio backend error: {0}")]
    Backend(String),
}

impl PortError {
    /// Transient errors are retried inside the relay loop and never surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, PortError::Xrun(_) | PortError::Transient(_))
    }
}

/// Which side of the relay a device error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Capture,
    Playback,
}

impl fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamDirection::Capture => f.write_str("input"),
            StreamDirection::Playback => f.write_str("output"),
        }
    }
}

/// Errors surfaced by the engine's control surface.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Unsupported sample rate, format or sizing; raised before any port opens
    #[error("configuration error: {0}")]
    Config(String),

    /// No usable route exists in the given direction
    #[error("no {0} device available")]
    NoDevice(StreamDirection),

    /// A port could not be opened (busy, missing, unsupported)
    #[error("failed to open audio stream: {0}")]
    OpenFailed(#[source] PortError),

    /// The session ended because the device failed repeatedly or disappeared
    #[error("relay stopped unexpectedly: {0}")]
    Unrecoverable(String),

    /// The relay loop did not acknowledge the stop request in time
    #[error("relay loop did not drain within {0:?}")]
    StopTimeout(Duration),

    /// The relay thread could not be created
    #[error("failed to spawn relay thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl RelayError {
    /// True for the errors that end a running session rather than a start attempt.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, RelayError::Unrecoverable(_) | RelayError::StopTimeout(_))
    }
}

impl From<PortError> for RelayError {
    fn from(err: PortError) -> Self {
        if err.is_transient() {
            RelayError::Unrecoverable(err.to_string())
        } else {
            match err {
                PortError::Disconnected(msg) => RelayError::Unrecoverable(msg),
                other => RelayError::OpenFailed(other),
            }
        }
    }
}

/// Convenience Result type using `RelayError`.
pub type Result<T> = std::result::Result<T, RelayError>;
