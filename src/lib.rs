//! Live microphone-to-speaker relay with software gain.
//!
//! `audio::AudioSystem` is the entry point: it picks an engine (direct ALSA or
//! cpal), opens both streams on a dedicated real-time thread and relays frames
//! until stopped.

pub mod audio;
pub mod config;
pub mod error;

pub use audio::{AudioSystem, BackendKind, EngineState, RelayEvent, RelayStatus, StartOutcome};
pub use config::RelayConfig;
pub use error::{PortError, RelayError, Result};
