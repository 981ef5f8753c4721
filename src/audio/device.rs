//! Input device selection and output route detection.
//!
//! The relay prefers the machine's own microphone: with a headset plugged in,
//! "the microphone" would otherwise resolve to the headset mic and the relay
//! would monitor the wearer instead of the room.

use serde::Serialize;

use super::port::CaptureSource;
use crate::error::PortError;

/// Id used for the platform's default route.
pub const SYSTEM_DEFAULT_ID: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    BuiltInMic,
    WiredHeadset,
    Bluetooth,
    Usb,
    Unknown,
}

impl DeviceClass {
    /// Personal listening devices; routing relay output anywhere else risks feedback.
    pub fn is_headset(&self) -> bool {
        matches!(
            self,
            DeviceClass::WiredHeadset | DeviceClass::Bluetooth | DeviceClass::Usb
        )
    }
}

/// A device as reported by the platform, tagged with its class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    /// Name the backend opens the device by (ALSA PCM name, cpal device name)
    pub id: String,
    /// Human readable description
    pub name: String,
    pub class: DeviceClass,
    /// Echo-cancel / noise-suppression sources exposed by the sound server
    pub voice_processed: bool,
}

impl DeviceDescriptor {
    /// Build a descriptor and classify it from its id and description.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        let name = name.into();
        let label = format!("{} {}", id, name);
        Self {
            class: classify(&label),
            voice_processed: is_voice_processed(&label),
            id,
            name,
        }
    }

    /// Sentinel meaning "let the platform route it".
    pub fn system_default() -> Self {
        Self {
            id: SYSTEM_DEFAULT_ID.to_string(),
            name: "System default".to_string(),
            class: DeviceClass::Unknown,
            voice_processed: false,
        }
    }

    pub fn is_system_default(&self) -> bool {
        self.id == SYSTEM_DEFAULT_ID
    }

    fn matches_hint(&self, hint: &str) -> bool {
        self.id == hint || self.name.eq_ignore_ascii_case(hint)
    }
}

/// Platform query listing the devices a backend can open.
pub trait DeviceEnumerator {
    fn input_devices(&self) -> Result<Vec<DeviceDescriptor>, PortError>;
    fn output_devices(&self) -> Result<Vec<DeviceDescriptor>, PortError>;
}

const BLUETOOTH_MARKERS: &[&str] = &["bluez", "bluetooth", "a2dp", "handsfree", "hfp"];
const USB_MARKERS: &[&str] = &["usb"];
const HEADSET_MARKERS: &[&str] = &["headset", "headphone", "earphone"];
const BUILTIN_MARKERS: &[&str] = &[
    "built-in",
    "builtin",
    "internal",
    "hda intel",
    "pch",
    "analog",
    "microphone",
];
const VOICE_PROCESSING_MARKERS: &[&str] = &[
    "echo-cancel",
    "echo_cancel",
    "echocancel",
    "noise-suppress",
    "noise_suppress",
    "webrtc",
];

fn contains_any(label: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| label.contains(m))
}

/// Guess the device class from platform naming.
///
/// Bus markers win over "analog"/"microphone": a USB headset reports both.
pub fn classify(label: &str) -> DeviceClass {
    let label = label.to_ascii_lowercase();
    if contains_any(&label, BLUETOOTH_MARKERS) {
        DeviceClass::Bluetooth
    } else if contains_any(&label, USB_MARKERS) {
        DeviceClass::Usb
    } else if contains_any(&label, HEADSET_MARKERS) {
        DeviceClass::WiredHeadset
    } else if contains_any(&label, BUILTIN_MARKERS) {
        DeviceClass::BuiltInMic
    } else {
        DeviceClass::Unknown
    }
}

pub fn is_voice_processed(label: &str) -> bool {
    contains_any(&label.to_ascii_lowercase(), VOICE_PROCESSING_MARKERS)
}

/// Pick the capture device for a session. Never fails.
///
/// Order: the caller's hint if it names a usable device, then the first
/// built-in microphone, then the system default sentinel.
pub fn resolve_input_device(
    devices: &dyn DeviceEnumerator,
    hint: Option<&str>,
    source: CaptureSource,
) -> DeviceDescriptor {
    let candidates = match devices.input_devices() {
        Ok(list) => list,
        Err(e) => {
            log::warn!("Input device enumeration failed: {}, using system default", e);
            return DeviceDescriptor::system_default();
        }
    };

    let usable: Vec<DeviceDescriptor> = candidates
        .into_iter()
        .filter(|d| source.allows(d))
        .collect();

    if let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) {
        if let Some(device) = usable.iter().find(|d| d.matches_hint(hint)) {
            log::debug!("Using preferred input device {}", device.id);
            return device.clone();
        }
        log::warn!("Preferred input device '{}' not available", hint);
    }

    match usable.into_iter().find(|d| d.class == DeviceClass::BuiltInMic) {
        Some(device) => {
            log::debug!("Using built-in microphone {} ({})", device.id, device.name);
            device
        }
        None => {
            log::info!("No built-in microphone found, using system default input");
            DeviceDescriptor::system_default()
        }
    }
}

/// Whether relayed audio has somewhere to go.
///
/// With `require_headset` only headset-class outputs count. An enumeration
/// failure is not proof of absence; the playback open will have the final word.
pub fn has_output_route(devices: &dyn DeviceEnumerator, require_headset: bool) -> bool {
    match devices.output_devices() {
        Ok(list) if require_headset => list.iter().any(|d| d.class.is_headset()),
        Ok(list) => !list.is_empty(),
        Err(e) => {
            log::warn!("Output device enumeration failed: {}", e);
            !require_headset
        }
    }
}
