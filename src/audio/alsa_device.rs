//! Native engine: ALSA PCM devices driven with blocking interleaved I/O.

use alsa::device_name::HintIter;
use alsa::pcm::{Access, Format, Frames, HwParams, PCM};
use alsa::{Direction, ValueOr};

use super::device::{DeviceDescriptor, DeviceEnumerator};
use super::port::{AudioBackend, BackendKind, CapturePort, PlaybackPort, PortConfig};
use crate::config::RelayConfig;
use crate::error::PortError;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames (one frame = channels × sample_width)
    pub period_size: usize,
    /// Hardware ring size in frames
    pub buffer_size: usize,
}

fn open_error(device: &str, dir_name: &str, e: alsa::Error) -> PortError {
    let msg = format!("{} device '{}': {}", dir_name, device, e);
    match e.errno() {
        libc::EBUSY | libc::EAGAIN => PortError::Busy(msg),
        libc::ENOENT | libc::ENODEV | libc::ENXIO => PortError::NotFound(msg),
        _ => PortError::Backend(msg),
    }
}

fn unsupported(what: &str, e: alsa::Error) -> PortError {
    PortError::Unsupported(format!("{}: {}", what, e))
}

/// Open a PCM device for capture (recording).
pub fn open_capture(device: &str, config: &PortConfig) -> Result<(PCM, AlsaParams), PortError> {
    open_pcm(device, Direction::Capture, config, "Capture")
}

/// Open a PCM device for playback.
pub fn open_playback(device: &str, config: &PortConfig) -> Result<(PCM, AlsaParams), PortError> {
    open_pcm(device, Direction::Playback, config, "Playback")
}

fn open_pcm(
    device: &str,
    direction: Direction,
    config: &PortConfig,
    dir_name: &str,
) -> Result<(PCM, AlsaParams), PortError> {
    let pcm = PCM::new(device, direction, false).map_err(|e| open_error(device, dir_name, e))?;

    // Configure hardware parameters
    {
        let hwp = HwParams::any(&pcm).map_err(|e| PortError::Backend(e.to_string()))?;
        hwp.set_access(Access::RWInterleaved)
            .map_err(|e| unsupported("interleaved access", e))?;
        hwp.set_format(Format::s16())
            .map_err(|e| unsupported("S16 sample format", e))?;
        hwp.set_channels(config.channels as u32)
            .map_err(|e| unsupported("channel count", e))?;
        hwp.set_rate(config.sample_rate, ValueOr::Nearest)
            .map_err(|e| unsupported("sample rate", e))?;
        hwp.set_period_size_near(config.period_samples() as Frames, ValueOr::Nearest)
            .map_err(|e| unsupported("period size", e))?;
        hwp.set_buffer_size_near((config.buffer_samples * 2) as Frames)
            .map_err(|e| unsupported("buffer size", e))?;
        pcm.hw_params(&hwp)
            .map_err(|e| unsupported("hardware parameters", e))?;
    }

    // Read back actual negotiated parameters
    let params = {
        let hwp = pcm
            .hw_params_current()
            .map_err(|e| PortError::Backend(e.to_string()))?;
        AlsaParams {
            sample_rate: hwp.get_rate().map_err(|e| PortError::Backend(e.to_string()))?,
            channels: hwp.get_channels().map_err(|e| PortError::Backend(e.to_string()))?,
            period_size: hwp.get_period_size().map_err(|e| PortError::Backend(e.to_string()))? as usize,
            buffer_size: hwp.get_buffer_size().map_err(|e| PortError::Backend(e.to_string()))? as usize,
        }
    };

    if params.sample_rate != config.sample_rate {
        return Err(PortError::Unsupported(format!(
            "{} device '{}' runs at {} Hz, session needs {} Hz",
            dir_name, device, params.sample_rate, config.sample_rate
        )));
    }

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}, buffer_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
        params.buffer_size,
    );

    Ok((pcm, params))
}

/// Re-prepare the stream after a failed read/write.
fn recover(pcm: &PCM, e: alsa::Error, dir_name: &str) -> PortError {
    if e.errno() == libc::ENODEV {
        return PortError::Disconnected(format!("{} device removed: {}", dir_name, e));
    }
    // 触发 ALSA 硬件恢复状态机
    match pcm.prepare() {
        Ok(()) => PortError::Xrun(format!("{}: {}", dir_name, e)),
        Err(e2) => PortError::Disconnected(format!(
            "failed to recover PCM {} after '{}': {}",
            dir_name, e, e2
        )),
    }
}

fn released(dir_name: &str) -> PortError {
    PortError::Disconnected(format!("{} stream already released", dir_name))
}

pub struct AlsaCapture {
    pcm: Option<PCM>,
    params: AlsaParams,
}

impl CapturePort for AlsaCapture {
    fn start(&mut self) -> Result<(), PortError> {
        let pcm = self.pcm.as_ref().ok_or_else(|| released("capture"))?;
        pcm.prepare().map_err(|e| PortError::Backend(e.to_string()))?;
        pcm.start().map_err(|e| PortError::Backend(e.to_string()))
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize, PortError> {
        let pcm = self.pcm.as_ref().ok_or_else(|| released("capture"))?;
        let channels = self.params.channels.max(1) as usize;
        match pcm.io_bytes().readi(bytemuck::cast_slice_mut(buf)) {
            Ok(frames) => Ok(frames * channels),
            Err(e) => Err(recover(pcm, e, "capture")),
        }
    }

    fn stop(&mut self) -> Result<(), PortError> {
        match &self.pcm {
            Some(pcm) => pcm.drop().map_err(|e| PortError::Backend(e.to_string())),
            None => Ok(()),
        }
    }

    fn release(&mut self) -> Result<(), PortError> {
        // PCM 在 drop 时关闭设备
        self.pcm.take();
        Ok(())
    }
}

pub struct AlsaPlayback {
    pcm: Option<PCM>,
    params: AlsaParams,
}

impl PlaybackPort for AlsaPlayback {
    fn start(&mut self) -> Result<(), PortError> {
        let pcm = self.pcm.as_ref().ok_or_else(|| released("playback"))?;
        pcm.prepare().map_err(|e| PortError::Backend(e.to_string()))?;

        // 预填充一个周期的静音，避免第一帧到达前就欠载
        let silence = vec![0i16; self.params.period_size * self.params.channels.max(1) as usize];
        pcm.io_bytes()
            .writei(bytemuck::cast_slice(&silence))
            .map_err(|e| recover(pcm, e, "playback"))?;
        Ok(())
    }

    fn write(&mut self, buf: &[i16]) -> Result<usize, PortError> {
        let pcm = self.pcm.as_ref().ok_or_else(|| released("playback"))?;
        let channels = self.params.channels.max(1) as usize;
        match pcm.io_bytes().writei(bytemuck::cast_slice(buf)) {
            Ok(frames) => Ok(frames * channels),
            Err(e) => {
                log::warn!("ALSA XRUN or error: {}, recovering...", e);
                Err(recover(pcm, e, "playback"))
            }
        }
    }

    fn stop(&mut self) -> Result<(), PortError> {
        match &self.pcm {
            Some(pcm) => pcm.drop().map_err(|e| PortError::Backend(e.to_string())),
            None => Ok(()),
        }
    }

    fn release(&mut self) -> Result<(), PortError> {
        self.pcm.take();
        Ok(())
    }
}

/// PCM names from the ALSA hint database.
#[derive(Debug, Default)]
pub struct AlsaDevices;

impl AlsaDevices {
    fn hints(direction: Direction) -> Result<Vec<DeviceDescriptor>, PortError> {
        let hints = HintIter::new_str(None, "pcm")
            .map_err(|e| PortError::Backend(format!("ALSA device hints: {}", e)))?;

        Ok(hints
            .filter(|h| h.direction.is_none_or(|d| d == direction))
            .filter_map(|h| {
                let name = h.name?;
                if name == "null" {
                    return None;
                }
                let desc = h.desc.unwrap_or_default().replace('\n', " ");
                Some(DeviceDescriptor::new(name, desc))
            })
            .collect())
    }
}

impl DeviceEnumerator for AlsaDevices {
    fn input_devices(&self) -> Result<Vec<DeviceDescriptor>, PortError> {
        Self::hints(Direction::Capture)
    }

    fn output_devices(&self) -> Result<Vec<DeviceDescriptor>, PortError> {
        Self::hints(Direction::Playback)
    }
}

/// Direct ALSA engine.
#[derive(Debug)]
pub struct AlsaBackend {
    capture_device: String,
    playback_device: String,
    devices: AlsaDevices,
}

impl AlsaBackend {
    pub fn new(capture_device: impl Into<String>, playback_device: impl Into<String>) -> Self {
        Self {
            capture_device: capture_device.into(),
            playback_device: playback_device.into(),
            devices: AlsaDevices,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.capture_device.clone(), config.playback_device.clone())
    }
}

impl AudioBackend for AlsaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn devices(&self) -> &dyn DeviceEnumerator {
        &self.devices
    }

    fn min_buffer_samples(&self, config: &PortConfig) -> Option<usize> {
        let device = config.device_id(&self.capture_device);
        // 非阻塞打开，仅用于查询硬件能力
        let pcm = PCM::new(device, Direction::Capture, true).ok()?;
        let hwp = HwParams::any(&pcm).ok()?;
        hwp.set_access(Access::RWInterleaved).ok()?;
        hwp.set_format(Format::s16()).ok()?;
        hwp.set_channels(config.channels as u32).ok()?;
        hwp.set_rate(config.sample_rate, ValueOr::Nearest).ok()?;
        let min = hwp.get_buffer_size_min().ok()?;
        usize::try_from(min).ok().filter(|m| *m > 0)
    }

    fn open_capture(&self, config: &PortConfig) -> Result<Box<dyn CapturePort>, PortError> {
        let (pcm, params) = open_capture(config.device_id(&self.capture_device), config)?;
        Ok(Box::new(AlsaCapture {
            pcm: Some(pcm),
            params,
        }))
    }

    fn open_playback(&self, config: &PortConfig) -> Result<Box<dyn PlaybackPort>, PortError> {
        let (pcm, params) = open_playback(config.device_id(&self.playback_device), config)?;
        Ok(Box::new(AlsaPlayback {
            pcm: Some(pcm),
            params,
        }))
    }
}
