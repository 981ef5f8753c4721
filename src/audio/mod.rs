pub mod alsa_device;
pub mod audio_system;
pub mod cpal_device;
pub mod device;
pub mod frame;
pub mod gain;
pub mod port;
pub mod priority;
pub mod relay;

pub use audio_system::{AudioSystem, EngineState, RelayEvent, RelayStatus, StartOutcome};
pub use device::{DeviceClass, DeviceDescriptor, DeviceEnumerator, resolve_input_device};
pub use gain::{GainState, apply_gain};
pub use port::{AudioBackend, BackendKind, CapturePort, CaptureSource, PlaybackPort, PortConfig};
pub use relay::RelayCounters;
