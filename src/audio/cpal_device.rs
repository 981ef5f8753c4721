//! Fallback engine: cpal callback streams bridged to blocking ports.
//!
//! The input callback pushes into a lock-free ring that `read` drains; `write`
//! fills a second ring that the output callback drains. Works on any host cpal
//! supports, at the cost of one extra buffer between callback and relay loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BufferSize, BuildStreamError, Device, Host, SampleFormat, SampleRate, Stream, StreamConfig,
    StreamError, SupportedBufferSize, SupportedStreamConfigRange,
};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::device::{DeviceDescriptor, DeviceEnumerator, SYSTEM_DEFAULT_ID};
use super::port::{AudioBackend, BackendKind, CapturePort, PlaybackPort, PortConfig};
use crate::config::RelayConfig;
use crate::error::PortError;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Ring capacity in relay frames (or host callbacks, whichever is larger).
const RING_FRAMES: usize = 4;

/// Callback size assumed when the host picks its own buffer.
const DEFAULT_CALLBACK_ESTIMATE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Input,
    Output,
}

impl Side {
    fn name(self) -> &'static str {
        match self {
            Side::Input => "capture",
            Side::Output => "playback",
        }
    }
}

fn find_device(host: &Host, id: &str, side: Side) -> Result<Device, PortError> {
    if id != SYSTEM_DEFAULT_ID {
        let devices = match side {
            Side::Input => host.input_devices(),
            Side::Output => host.output_devices(),
        };
        let mut devices =
            devices.map_err(|e| PortError::Backend(format!("Failed to enumerate devices: {}", e)))?;
        if let Some(device) = devices.find(|d| d.name().ok().as_deref() == Some(id)) {
            return Ok(device);
        }
        log::warn!("Requested {} device '{}' not found, falling back to default", side.name(), id);
    }

    let device = match side {
        Side::Input => host.default_input_device(),
        Side::Output => host.default_output_device(),
    };
    device.ok_or_else(|| PortError::NotFound(format!("no default {} device", side.name())))
}

/// Channel layout and sample format a device accepts at the session rate.
#[derive(Debug, Clone, Copy)]
struct StreamShape {
    channels: u16,
    format: SampleFormat,
    /// Callback sizes the device accepts
    buffer: SupportedBufferSize,
}

fn negotiate(device: &Device, sample_rate: u32, side: Side) -> Result<StreamShape, PortError> {
    let configs: Vec<SupportedStreamConfigRange> = match side {
        Side::Input => device
            .supported_input_configs()
            .map_err(|e| PortError::Backend(format!("Failed to get device configs: {}", e)))?
            .collect(),
        Side::Output => device
            .supported_output_configs()
            .map_err(|e| PortError::Backend(format!("Failed to get device configs: {}", e)))?
            .collect(),
    };

    // 优先单声道 i16，其次 f32 或多声道（回调里做转换）
    configs
        .iter()
        .filter(|c| c.min_sample_rate().0 <= sample_rate && c.max_sample_rate().0 >= sample_rate)
        .filter(|c| matches!(c.sample_format(), SampleFormat::I16 | SampleFormat::F32))
        .min_by_key(|c| (c.channels() != 1, c.sample_format() != SampleFormat::I16, c.channels()))
        .map(|c| StreamShape {
            channels: c.channels().max(1),
            format: c.sample_format(),
            buffer: *c.buffer_size(),
        })
        .ok_or_else(|| {
            PortError::Unsupported(format!(
                "{} device has no i16/f32 configuration at {} Hz",
                side.name(),
                sample_rate
            ))
        })
}

fn build_error(e: BuildStreamError) -> PortError {
    match e {
        BuildStreamError::DeviceNotAvailable => PortError::NotFound(e.to_string()),
        BuildStreamError::StreamConfigNotSupported | BuildStreamError::InvalidArgument => {
            PortError::Unsupported(e.to_string())
        }
        other => PortError::Backend(other.to_string()),
    }
}

fn on_stream_error(lost: Arc<AtomicBool>, side: Side) -> impl FnMut(StreamError) + Send + 'static {
    move |err| match err {
        StreamError::DeviceNotAvailable => lost.store(true, Ordering::Release),
        other => log::warn!("cpal {} stream error: {}", side.name(), other),
    }
}

fn f32_to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

fn i16_to_f32(s: i16) -> f32 {
    s as f32 / 32768.0
}

/// Downmix interleaved callback data to mono and queue it.
fn push_mono<T: Copy>(
    producer: &mut HeapProd<i16>,
    data: &[T],
    channels: usize,
    convert: impl Fn(T) -> i16,
    overruns: &AtomicU64,
) {
    for frame in data.chunks(channels) {
        let sum: i32 = frame.iter().map(|s| convert(*s) as i32).sum();
        let mono = (sum / frame.len() as i32) as i16;
        if producer.try_push(mono).is_err() {
            overruns.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Fill interleaved callback output from the mono queue, silence on underrun.
fn pop_mono<T: Copy>(
    consumer: &mut HeapCons<i16>,
    data: &mut [T],
    channels: usize,
    convert: impl Fn(i16) -> T,
    underruns: &AtomicU64,
) {
    let mut starved = false;
    for frame in data.chunks_mut(channels) {
        let sample = consumer.try_pop().unwrap_or_else(|| {
            starved = true;
            0
        });
        frame.fill(convert(sample));
    }
    if starved {
        underruns.fetch_add(1, Ordering::Relaxed);
    }
}

/// Ask for one period per callback, clamped to what the device supports.
fn choose_buffer_size(requested: usize, supported: SupportedBufferSize) -> BufferSize {
    match supported {
        SupportedBufferSize::Range { min, max } if max > 0 && min <= max => {
            let requested = u32::try_from(requested.max(1)).unwrap_or(u32::MAX);
            BufferSize::Fixed(requested.clamp(min.max(1), max))
        }
        _ => BufferSize::Default,
    }
}

/// Samples delivered per callback, as far as we know it.
fn callback_samples(buffer: BufferSize) -> usize {
    match buffer {
        BufferSize::Fixed(n) => n as usize,
        BufferSize::Default => DEFAULT_CALLBACK_ESTIMATE,
    }
}

/// Ring large enough for several relay frames and several callbacks.
fn ring_capacity(frame_samples: usize, buffer: BufferSize) -> usize {
    frame_samples.max(callback_samples(buffer)).max(1) * RING_FRAMES
}

fn stream_config(shape: StreamShape, sample_rate: u32, buffer: BufferSize) -> StreamConfig {
    StreamConfig {
        channels: shape.channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: buffer,
    }
}

/// Build a stream with `buffer`; if the device rejects that size, build again
/// with the host default. Returns the stream and the buffer size it runs with.
fn build_with_fallback<S>(
    buffer: BufferSize,
    mut build: impl FnMut(BufferSize) -> Result<S, BuildStreamError>,
) -> Result<(S, BufferSize), PortError> {
    match build(buffer) {
        Err(BuildStreamError::StreamConfigNotSupported | BuildStreamError::InvalidArgument)
            if buffer != BufferSize::Default =>
        {
            log::warn!("Device rejected buffer size {:?}, using the host default", buffer);
            build(BufferSize::Default)
                .map(|stream| (stream, BufferSize::Default))
                .map_err(build_error)
        }
        result => result.map(|stream| (stream, buffer)).map_err(build_error),
    }
}

pub struct CpalCapture {
    stream: Option<Stream>,
    consumer: HeapCons<i16>,
    lost: Arc<AtomicBool>,
    overruns: Arc<AtomicU64>,
    /// Longest a read waits for a full frame
    frame_timeout: Duration,
}

impl CpalCapture {
    fn open(host: &Host, device_id: &str, config: &PortConfig) -> Result<Self, PortError> {
        let device = find_device(host, device_id, Side::Input)?;
        let shape = negotiate(&device, config.sample_rate, Side::Input)?;
        let lost = Arc::new(AtomicBool::new(false));
        let overruns = Arc::new(AtomicU64::new(0));
        let channels = shape.channels as usize;

        let requested = choose_buffer_size(config.period_samples(), shape.buffer);
        let ((stream, consumer), buffer) = build_with_fallback(requested, |buffer| {
            let (mut producer, consumer) =
                HeapRb::<i16>::new(ring_capacity(config.buffer_samples, buffer)).split();
            let stream_config = stream_config(shape, config.sample_rate, buffer);
            let overruns = overruns.clone();
            let on_error = on_stream_error(lost.clone(), Side::Input);
            let stream = match shape.format {
                SampleFormat::I16 => device.build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        push_mono(&mut producer, data, channels, |s| s, &overruns)
                    },
                    on_error,
                    None,
                ),
                _ => device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        push_mono(&mut producer, data, channels, f32_to_i16, &overruns)
                    },
                    on_error,
                    None,
                ),
            }?;
            Ok((stream, consumer))
        })?;

        log::info!(
            "cpal Capture: device={}, rate={}, channels={}, format={:?}, buffer={:?}, ring={}",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            config.sample_rate,
            shape.channels,
            shape.format,
            buffer,
            ring_capacity(config.buffer_samples, buffer),
        );

        // 等待时间覆盖一个完整回调周期
        let wait_samples = config.buffer_samples.max(callback_samples(buffer));
        let frame_secs = wait_samples as f64 / config.sample_rate.max(1) as f64;
        Ok(Self {
            stream: Some(stream),
            consumer,
            lost,
            overruns,
            frame_timeout: Duration::from_secs_f64(frame_secs * 2.0),
        })
    }
}

impl CapturePort for CpalCapture {
    fn start(&mut self) -> Result<(), PortError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| PortError::Disconnected("capture stream already released".into()))?;
        stream.play().map_err(|e| PortError::Backend(e.to_string()))
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize, PortError> {
        let deadline = Instant::now() + self.frame_timeout;
        while self.consumer.occupied_len() < buf.len()
            && !self.lost.load(Ordering::Acquire)
            && Instant::now() < deadline
        {
            thread::sleep(POLL_INTERVAL);
        }
        if self.lost.load(Ordering::Acquire) {
            return Err(PortError::Disconnected("capture device no longer available".into()));
        }
        Ok(self.consumer.pop_slice(buf))
    }

    fn stop(&mut self) -> Result<(), PortError> {
        match &self.stream {
            Some(stream) => stream.pause().map_err(|e| PortError::Backend(e.to_string())),
            None => Ok(()),
        }
    }

    fn release(&mut self) -> Result<(), PortError> {
        if self.stream.take().is_some() {
            let overruns = self.overruns.load(Ordering::Relaxed);
            if overruns > 0 {
                log::info!("Capture ring overflowed {} times", overruns);
            }
        }
        Ok(())
    }
}

pub struct CpalPlayback {
    stream: Option<Stream>,
    producer: HeapProd<i16>,
    lost: Arc<AtomicBool>,
    underruns: Arc<AtomicU64>,
    preroll: usize,
}

impl CpalPlayback {
    fn open(host: &Host, device_id: &str, config: &PortConfig) -> Result<Self, PortError> {
        let device = find_device(host, device_id, Side::Output)?;
        let shape = negotiate(&device, config.sample_rate, Side::Output)?;
        let lost = Arc::new(AtomicBool::new(false));
        let underruns = Arc::new(AtomicU64::new(0));
        let channels = shape.channels as usize;

        let requested = choose_buffer_size(config.period_samples(), shape.buffer);
        let ((stream, producer), buffer) = build_with_fallback(requested, |buffer| {
            let (producer, mut consumer) =
                HeapRb::<i16>::new(ring_capacity(config.buffer_samples, buffer)).split();
            let stream_config = stream_config(shape, config.sample_rate, buffer);
            let underruns = underruns.clone();
            let on_error = on_stream_error(lost.clone(), Side::Output);
            let stream = match shape.format {
                SampleFormat::I16 => device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        pop_mono(&mut consumer, data, channels, |s| s, &underruns)
                    },
                    on_error,
                    None,
                ),
                _ => device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        pop_mono(&mut consumer, data, channels, i16_to_f32, &underruns)
                    },
                    on_error,
                    None,
                ),
            }?;
            Ok((stream, producer))
        })?;

        log::info!(
            "cpal Playback: device={}, rate={}, channels={}, format={:?}, buffer={:?}, ring={}",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            config.sample_rate,
            shape.channels,
            shape.format,
            buffer,
            ring_capacity(config.buffer_samples, buffer),
        );

        Ok(Self {
            stream: Some(stream),
            producer,
            lost,
            underruns,
            preroll: config.period_samples(),
        })
    }
}

impl PlaybackPort for CpalPlayback {
    fn start(&mut self) -> Result<(), PortError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| PortError::Disconnected("playback stream already released".into()))?;
        for _ in 0..self.preroll {
            if self.producer.try_push(0).is_err() {
                break;
            }
        }
        stream.play().map_err(|e| PortError::Backend(e.to_string()))
    }

    fn write(&mut self, buf: &[i16]) -> Result<usize, PortError> {
        if self.lost.load(Ordering::Acquire) {
            return Err(PortError::Disconnected("playback device no longer available".into()));
        }
        Ok(self.producer.push_slice(buf))
    }

    fn stop(&mut self) -> Result<(), PortError> {
        match &self.stream {
            Some(stream) => stream.pause().map_err(|e| PortError::Backend(e.to_string())),
            None => Ok(()),
        }
    }

    fn release(&mut self) -> Result<(), PortError> {
        if self.stream.take().is_some() {
            let underruns = self.underruns.load(Ordering::Relaxed);
            if underruns > 0 {
                log::info!("Playback ring ran dry {} times", underruns);
            }
        }
        Ok(())
    }
}

/// Devices as the default cpal host sees them.
#[derive(Debug, Default)]
pub struct CpalDevices;

impl CpalDevices {
    fn list(side: Side) -> Result<Vec<DeviceDescriptor>, PortError> {
        let host = cpal::default_host();
        let devices = match side {
            Side::Input => host.input_devices(),
            Side::Output => host.output_devices(),
        };
        let devices =
            devices.map_err(|e| PortError::Backend(format!("Failed to enumerate devices: {}", e)))?;

        let list: Vec<DeviceDescriptor> = devices
            .filter_map(|device| device.name().ok())
            .map(|name| DeviceDescriptor::new(name.clone(), name))
            .collect();

        log::debug!("Found {} {} devices", list.len(), side.name());
        Ok(list)
    }
}

impl DeviceEnumerator for CpalDevices {
    fn input_devices(&self) -> Result<Vec<DeviceDescriptor>, PortError> {
        Self::list(Side::Input)
    }

    fn output_devices(&self) -> Result<Vec<DeviceDescriptor>, PortError> {
        Self::list(Side::Output)
    }
}

/// cpal engine.
#[derive(Debug)]
pub struct CpalBackend {
    capture_device: String,
    playback_device: String,
    devices: CpalDevices,
}

impl CpalBackend {
    pub fn new(capture_device: impl Into<String>, playback_device: impl Into<String>) -> Self {
        Self {
            capture_device: capture_device.into(),
            playback_device: playback_device.into(),
            devices: CpalDevices,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.capture_device.clone(), config.playback_device.clone())
    }
}

impl AudioBackend for CpalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fallback
    }

    fn devices(&self) -> &dyn DeviceEnumerator {
        &self.devices
    }

    fn min_buffer_samples(&self, config: &PortConfig) -> Option<usize> {
        let host = cpal::default_host();
        let device = find_device(&host, config.device_id(&self.capture_device), Side::Input).ok()?;
        let supported = device.default_input_config().ok()?;
        match supported.buffer_size() {
            SupportedBufferSize::Range { min, .. } if *min > 0 => Some(*min as usize),
            _ => None,
        }
    }

    fn open_capture(&self, config: &PortConfig) -> Result<Box<dyn CapturePort>, PortError> {
        let host = cpal::default_host();
        let port = CpalCapture::open(&host, config.device_id(&self.capture_device), config)?;
        Ok(Box::new(port))
    }

    fn open_playback(&self, config: &PortConfig) -> Result<Box<dyn PlaybackPort>, PortError> {
        let host = cpal::default_host();
        let port = CpalPlayback::open(&host, config.device_id(&self.playback_device), config)?;
        Ok(Box::new(port))
    }
}
