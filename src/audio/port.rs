//! Capture and playback port abstractions shared by both engines.
//!
//! A backend opens ports; the relay loop only ever talks to the traits, so
//! the loop itself does not know which engine it is driving.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::device::{DeviceDescriptor, DeviceEnumerator};
use crate::error::{PortError, RelayError};

/// The relay is mono end to end.
pub const CHANNELS: u16 = 1;

/// Which engine drives the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Direct ALSA PCM access: lowest latency, not every driver accepts it
    Native,
    /// cpal streams: works wherever cpal does, one extra buffering hop
    Fallback,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Native => f.write_str("native"),
            BackendKind::Fallback => f.write_str("fallback"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "alsa" => Ok(BackendKind::Native),
            "fallback" | "cpal" => Ok(BackendKind::Fallback),
            other => Err(RelayError::Config(format!("unknown backend: {}", other))),
        }
    }
}

/// Capture-source hint passed to the capture port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    /// Raw microphone signal; voice-processed sources are never selected
    Unprocessed,
    VoiceRecognition,
    VoicePerformance,
}

impl CaptureSource {
    /// Whether a device may be used as the input for this source.
    pub fn allows(&self, device: &DeviceDescriptor) -> bool {
        match self {
            CaptureSource::Unprocessed => !device.voice_processed,
            CaptureSource::VoiceRecognition | CaptureSource::VoicePerformance => true,
        }
    }
}

impl FromStr for CaptureSource {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "unprocessed" => Ok(CaptureSource::Unprocessed),
            "voice_recognition" => Ok(CaptureSource::VoiceRecognition),
            "voice_performance" => Ok(CaptureSource::VoicePerformance),
            other => Err(RelayError::Config(format!("unknown capture source: {}", other))),
        }
    }
}

/// Parameters for opening one port. Format is always mono signed 16-bit.
#[derive(Debug, Clone)]
pub struct PortConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per relay frame
    pub buffer_samples: usize,
    /// `None` opens the backend's configured default device
    pub device: Option<DeviceDescriptor>,
    /// Only meaningful for capture
    pub capture_source: CaptureSource,
}

impl PortConfig {
    pub fn new(sample_rate: u32, buffer_samples: usize) -> Self {
        Self {
            sample_rate,
            channels: CHANNELS,
            buffer_samples,
            device: None,
            capture_source: CaptureSource::Unprocessed,
        }
    }

    pub fn with_device(mut self, device: Option<DeviceDescriptor>) -> Self {
        self.device = device;
        self
    }

    pub fn with_capture_source(mut self, source: CaptureSource) -> Self {
        self.capture_source = source;
        self
    }

    /// Hardware period: half a frame, so one frame spans two interrupts.
    pub fn period_samples(&self) -> usize {
        (self.buffer_samples / 2).max(1)
    }

    /// Device name to open, falling back to the backend's configured default.
    pub fn device_id<'a>(&'a self, fallback: &'a str) -> &'a str {
        match &self.device {
            Some(d) if !d.is_system_default() => d.id.as_str(),
            _ => fallback,
        }
    }
}

/// An opened input stream.
///
/// `read` blocks for at most about one hardware buffer. `Ok(0)` and transient
/// errors mean "nothing this time"; anything else ends the session.
pub trait CapturePort {
    fn start(&mut self) -> Result<(), PortError>;
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, PortError>;
    fn stop(&mut self) -> Result<(), PortError>;
    /// Must tolerate being called more than once.
    fn release(&mut self) -> Result<(), PortError>;
}

/// An opened output stream.
///
/// `write` may accept fewer samples than offered; the caller keeps going.
pub trait PlaybackPort {
    fn start(&mut self) -> Result<(), PortError>;
    fn write(&mut self, buf: &[i16]) -> Result<usize, PortError>;
    fn stop(&mut self) -> Result<(), PortError>;
    /// Must tolerate being called more than once.
    fn release(&mut self) -> Result<(), PortError>;
}

/// One audio engine: device queries plus port factories.
///
/// Ports are opened on the relay thread and never leave it, so they do not
/// need to be `Send`; the backend itself is shared with that thread.
pub trait AudioBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn devices(&self) -> &dyn DeviceEnumerator;

    /// Smallest buffer, in samples, the platform reports as safe for this
    /// configuration. `None` when the platform does not say.
    fn min_buffer_samples(&self, config: &PortConfig) -> Option<usize>;

    fn open_capture(&self, config: &PortConfig) -> Result<Box<dyn CapturePort>, PortError>;

    fn open_playback(&self, config: &PortConfig) -> Result<Box<dyn PlaybackPort>, PortError>;
}

/// Both ports of a session, opened together.
pub struct OpenPorts {
    pub capture: Box<dyn CapturePort>,
    pub playback: Box<dyn PlaybackPort>,
}

/// Open capture then playback. If playback fails the capture port is
/// released before the error is returned.
pub fn open_ports(
    backend: &dyn AudioBackend,
    capture_config: &PortConfig,
    playback_config: &PortConfig,
) -> Result<OpenPorts, PortError> {
    let mut capture = backend.open_capture(capture_config)?;

    match backend.open_playback(playback_config) {
        Ok(playback) => Ok(OpenPorts { capture, playback }),
        Err(e) => {
            log::error!("Failed to open playback stream: {}", e);
            if let Err(e2) = capture.release() {
                log::warn!("Failed to release capture stream after open failure: {}", e2);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_names() {
        assert_eq!("native".parse::<BackendKind>().unwrap(), BackendKind::Native);
        assert_eq!(" Fallback ".parse::<BackendKind>().unwrap(), BackendKind::Fallback);
        assert_eq!("cpal".parse::<BackendKind>().unwrap(), BackendKind::Fallback);
        assert!("oboe".parse::<BackendKind>().is_err());
    }

    #[test]
    fn parses_capture_sources() {
        assert_eq!(
            "voice-recognition".parse::<CaptureSource>().unwrap(),
            CaptureSource::VoiceRecognition
        );
        assert_eq!(
            "unprocessed".parse::<CaptureSource>().unwrap(),
            CaptureSource::Unprocessed
        );
        assert!("camcorder".parse::<CaptureSource>().is_err());
    }

    #[test]
    fn default_sentinel_uses_configured_device() {
        let config = PortConfig::new(48_000, 512).with_device(Some(DeviceDescriptor::system_default()));
        assert_eq!(config.device_id("plughw:0,0"), "plughw:0,0");
        assert_eq!(config.period_samples(), 256);

        let config = config.with_device(Some(DeviceDescriptor::new("hw:1,0", "USB mic")));
        assert_eq!(config.device_id("plughw:0,0"), "hw:1,0");
    }
}
