//! Mock backends for driving `AudioSystem` without sound hardware.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hearing_relay::audio::{
    AudioBackend, AudioSystem, BackendKind, CapturePort, DeviceDescriptor, DeviceEnumerator,
    PlaybackPort, PortConfig, RelayEvent,
};
use hearing_relay::config::RelayConfig;
use hearing_relay::error::PortError;
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// What the mock ports saw.
#[derive(Debug, Default)]
pub struct Probe {
    pub capture_opened: AtomicUsize,
    pub capture_released: AtomicUsize,
    pub playback_opened: AtomicUsize,
    pub playback_released: AtomicUsize,
    /// Device requested by each capture open
    pub capture_devices: Mutex<Vec<DeviceDescriptor>>,
    /// Samples accepted by each playback write
    pub writes: Mutex<Vec<Vec<i16>>>,
}

impl Probe {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<Vec<i16>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    pub fn last_capture_device(&self) -> Option<DeviceDescriptor> {
        self.capture_devices.lock().unwrap().last().cloned()
    }
}

#[derive(Debug, Clone)]
pub enum CaptureScript {
    /// Fill every read with this pattern, forever
    Repeat(Vec<i16>),
    /// Like `Repeat`, then report the device gone after this many reads
    DisconnectAfter(Vec<i16>, usize),
    /// Every second read fails with an xrun
    Flaky(Vec<i16>),
}

struct MockDevices {
    inputs: Vec<DeviceDescriptor>,
    outputs: Vec<DeviceDescriptor>,
}

impl DeviceEnumerator for MockDevices {
    fn input_devices(&self) -> Result<Vec<DeviceDescriptor>, PortError> {
        Ok(self.inputs.clone())
    }

    fn output_devices(&self) -> Result<Vec<DeviceDescriptor>, PortError> {
        Ok(self.outputs.clone())
    }
}

pub fn builtin_mic() -> DeviceDescriptor {
    DeviceDescriptor::new("sysdefault:CARD=PCH", "HDA Intel PCH, ALC3246 Analog")
}

pub fn usb_headset() -> DeviceDescriptor {
    DeviceDescriptor::new("hw:CARD=Headset,DEV=0", "USB Headset, USB Audio")
}

pub fn speaker() -> DeviceDescriptor {
    DeviceDescriptor::new("front:CARD=PCH,DEV=0", "HDA Intel PCH, Front speaker")
}

pub struct MockBackend {
    kind: BackendKind,
    devices: MockDevices,
    script: CaptureScript,
    read_delay: Duration,
    write_chunk: usize,
    min_buffer: Option<usize>,
    fail_capture_open: Option<PortError>,
    fail_playback_open: Option<PortError>,
    pub probe: Arc<Probe>,
}

impl MockBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            devices: MockDevices {
                inputs: vec![usb_headset(), builtin_mic()],
                outputs: vec![speaker()],
            },
            script: CaptureScript::Repeat(vec![1000; 4]),
            read_delay: Duration::from_millis(1),
            write_chunk: usize::MAX,
            min_buffer: Some(4),
            fail_capture_open: None,
            fail_playback_open: None,
            probe: Arc::new(Probe::default()),
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<DeviceDescriptor>) -> Self {
        self.devices.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<DeviceDescriptor>) -> Self {
        self.devices.outputs = outputs;
        self
    }

    pub fn with_script(mut self, script: CaptureScript) -> Self {
        self.script = script;
        self
    }

    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn with_write_chunk(mut self, chunk: usize) -> Self {
        self.write_chunk = chunk;
        self
    }

    pub fn failing_capture_open(mut self, err: PortError) -> Self {
        self.fail_capture_open = Some(err);
        self
    }

    pub fn failing_playback_open(mut self, err: PortError) -> Self {
        self.fail_playback_open = Some(err);
        self
    }

    pub fn into_shared(self) -> (Arc<dyn AudioBackend>, Arc<Probe>) {
        let probe = self.probe.clone();
        (Arc::new(self), probe)
    }
}

impl AudioBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn devices(&self) -> &dyn DeviceEnumerator {
        &self.devices
    }

    fn min_buffer_samples(&self, _config: &PortConfig) -> Option<usize> {
        self.min_buffer
    }

    fn open_capture(&self, config: &PortConfig) -> Result<Box<dyn CapturePort>, PortError> {
        if let Some(e) = &self.fail_capture_open {
            return Err(e.clone());
        }
        self.probe.capture_opened.fetch_add(1, Ordering::SeqCst);
        self.probe
            .capture_devices
            .lock()
            .unwrap()
            .push(config.device.clone().unwrap_or_else(DeviceDescriptor::system_default));
        Ok(Box::new(MockCapture {
            script: self.script.clone(),
            delay: self.read_delay,
            reads: 0,
            released: false,
            probe: self.probe.clone(),
        }))
    }

    fn open_playback(&self, _config: &PortConfig) -> Result<Box<dyn PlaybackPort>, PortError> {
        if let Some(e) = &self.fail_playback_open {
            return Err(e.clone());
        }
        self.probe.playback_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockPlayback {
            chunk: self.write_chunk,
            released: false,
            probe: self.probe.clone(),
        }))
    }
}

struct MockCapture {
    script: CaptureScript,
    delay: Duration,
    reads: usize,
    released: bool,
    probe: Arc<Probe>,
}

fn fill(buf: &mut [i16], pattern: &[i16]) -> usize {
    for (i, sample) in buf.iter_mut().enumerate() {
        *sample = pattern[i % pattern.len()];
    }
    buf.len()
}

impl CapturePort for MockCapture {
    fn start(&mut self) -> Result<(), PortError> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize, PortError> {
        thread::sleep(self.delay);
        self.reads += 1;
        match &self.script {
            CaptureScript::Repeat(pattern) => Ok(fill(buf, pattern)),
            CaptureScript::DisconnectAfter(pattern, limit) => {
                if self.reads > *limit {
                    Err(PortError::Disconnected("mock microphone unplugged".into()))
                } else {
                    Ok(fill(buf, pattern))
                }
            }
            CaptureScript::Flaky(pattern) => {
                if self.reads % 2 == 0 {
                    Err(PortError::Xrun("mock overrun".into()))
                } else {
                    Ok(fill(buf, pattern))
                }
            }
        }
    }

    fn stop(&mut self) -> Result<(), PortError> {
        Ok(())
    }

    fn release(&mut self) -> Result<(), PortError> {
        if !self.released {
            self.released = true;
            self.probe.capture_released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MockPlayback {
    chunk: usize,
    released: bool,
    probe: Arc<Probe>,
}

impl PlaybackPort for MockPlayback {
    fn start(&mut self) -> Result<(), PortError> {
        Ok(())
    }

    fn write(&mut self, buf: &[i16]) -> Result<usize, PortError> {
        let n = buf.len().min(self.chunk);
        self.probe.writes.lock().unwrap().push(buf[..n].to_vec());
        Ok(n)
    }

    fn stop(&mut self) -> Result<(), PortError> {
        Ok(())
    }

    fn release(&mut self) -> Result<(), PortError> {
        if !self.released {
            self.released = true;
            self.probe.playback_released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Four-sample frames, quick backoff, generous handshakes.
pub fn test_config() -> RelayConfig {
    RelayConfig {
        min_period_samples: 4,
        buffer_multiplier: 1,
        default_volume: 1.0,
        read_backoff: Duration::from_millis(1),
        max_consecutive_errors: 50,
        start_timeout: Duration::from_secs(2),
        stop_timeout: Duration::from_secs(2),
        require_headset_output: false,
        ..RelayConfig::builtin()
    }
}

pub fn system_with(
    config: RelayConfig,
    native: Arc<dyn AudioBackend>,
    fallback: Arc<dyn AudioBackend>,
) -> (AudioSystem, UnboundedReceiver<RelayEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AudioSystem::with_backends(config, native, fallback).with_events(tx), rx)
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Next event, waiting at most `timeout`.
pub fn next_event(rx: &mut UnboundedReceiver<RelayEvent>, timeout: Duration) -> Option<RelayEvent> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(event) = rx.try_recv() {
            return Some(event);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(2));
    }
}
