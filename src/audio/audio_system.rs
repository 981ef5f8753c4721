//! The AudioSystem: engine selection, session ownership and the control surface.
//!
//! The relay runs on a dedicated std::thread (NOT a tokio task); callers talk to
//! it through `start` / `stop` / `set_volume`, which only touch atomics and two
//! bounded handshake channels.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::alsa_device::AlsaBackend;
use super::cpal_device::CpalBackend;
use super::device::{DeviceDescriptor, has_output_route, resolve_input_device};
use super::frame::frame_samples;
use super::gain::GainState;
use super::port::{AudioBackend, BackendKind, PortConfig, open_ports};
use super::priority::promote_current_thread;
use super::relay::{LoopExit, LoopTiming, RelayCounters, RelayShared, run_relay};
use crate::config::RelayConfig;
use crate::error::{PortError, RelayError, Result, StreamDirection};

/// Lifecycle of the single relay engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    /// A stop request timed out; the old loop may still hold the devices
    StoppingFailed,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => EngineState::Starting,
            2 => EngineState::Running,
            3 => EngineState::StoppingFailed,
            _ => EngineState::Stopped,
        }
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(EngineState::Stopped as u8))
    }

    fn get(&self) -> EngineState {
        EngineState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: EngineState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// What a successful `start` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { session: Uuid },
    /// A session was already running; nothing was spawned
    AlreadyRunning,
}

/// Lifecycle notifications for an async host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    Started {
        session: Uuid,
        backend: BackendKind,
        device: DeviceDescriptor,
        frame_samples: usize,
    },
    Stopped {
        session: Uuid,
        counters: RelayCounters,
    },
    StoppedUnexpectedly {
        session: Uuid,
        reason: String,
        counters: RelayCounters,
    },
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub state: EngineState,
    pub backend: Option<BackendKind>,
    pub session: Option<Uuid>,
    pub input_device: Option<DeviceDescriptor>,
    pub frame_samples: Option<usize>,
    pub volume: f32,
    pub max_volume: f32,
    pub counters: RelayCounters,
}

struct Session {
    id: Uuid,
    backend: BackendKind,
    device: DeviceDescriptor,
    /// `None` when the start handshake timed out
    frame_len: Option<usize>,
    shared: Arc<RelayShared>,
    done_rx: Receiver<LoopExit>,
    handle: Option<JoinHandle<()>>,
}

impl Session {
    /// Non-blocking check whether the relay thread has finished.
    fn finished(&self) -> Option<Option<LoopExit>> {
        match self.done_rx.try_recv() {
            Ok(exit) => Some(Some(exit)),
            Err(TryRecvError::Disconnected) => Some(None),
            Err(TryRecvError::Empty) => None,
        }
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Relay thread for session {} panicked", self.id);
            }
        }
    }
}

/// Everything the relay thread needs to run one session.
struct SessionPlan {
    id: Uuid,
    backend: Arc<dyn AudioBackend>,
    capture: PortConfig,
    playback: PortConfig,
    min_period_samples: usize,
    buffer_multiplier: usize,
    timing: LoopTiming,
    realtime_priority: i32,
    state: Arc<StateCell>,
    events: Option<UnboundedSender<RelayEvent>>,
}

impl SessionPlan {
    fn emit(&self, event: RelayEvent) {
        if let Some(tx) = &self.events {
            // 接收端已关闭时忽略
            let _ = tx.send(event);
        }
    }
}

/// Engine selector and owner of the (at most one) relay session.
///
/// All methods take `&self`; share it behind an `Arc` between threads/tasks.
pub struct AudioSystem {
    config: RelayConfig,
    native: Arc<dyn AudioBackend>,
    fallback: Arc<dyn AudioBackend>,
    gain: Arc<GainState>,
    state: Arc<StateCell>,
    session: Mutex<Option<Session>>,
    events: Option<UnboundedSender<RelayEvent>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AudioSystem {
    /// ALSA as the native engine, cpal as the fallback.
    pub fn new(config: RelayConfig) -> Self {
        let native = Arc::new(AlsaBackend::from_config(&config));
        let fallback = Arc::new(CpalBackend::from_config(&config));
        Self::with_backends(config, native, fallback)
    }

    pub fn with_backends(
        config: RelayConfig,
        native: Arc<dyn AudioBackend>,
        fallback: Arc<dyn AudioBackend>,
    ) -> Self {
        let gain = Arc::new(GainState::new(config.default_volume, config.max_volume));
        Self {
            config,
            native,
            fallback,
            gain,
            state: Arc::new(StateCell::new()),
            session: Mutex::new(None),
            events: None,
        }
    }

    /// Deliver lifecycle events to `tx`.
    pub fn with_events(mut self, tx: UnboundedSender<RelayEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.state.get() == EngineState::Running
    }

    /// Set the gain applied from the next frame on. Returns the clamped value.
    ///
    /// Works with or without a running session; the value carries over to the
    /// next session.
    pub fn set_volume(&self, volume: f32) -> f32 {
        let applied = self.gain.set(volume);
        log::debug!("Volume set to {:.2} (requested {:.2})", applied, volume);
        applied
    }

    pub fn volume(&self) -> f32 {
        self.gain.get()
    }

    /// Start relaying with the given engine.
    ///
    /// Returns `AlreadyRunning` without side effects if a session is live.
    /// Fails with `NoDevice` when there is no output route, `OpenFailed` when a
    /// port cannot be opened and `Config` for settings the relay cannot use.
    pub fn start(&self, backend: BackendKind, preferred_device: Option<&str>) -> Result<StartOutcome> {
        let mut slot = lock(&self.session);

        if let Some(session) = slot.as_mut() {
            let exit = match session.finished() {
                Some(exit) => exit,
                None if self.state.get() == EngineState::Running => {
                    log::info!("Relay already running (session {}), ignoring start", session.id);
                    return Ok(StartOutcome::AlreadyRunning);
                }
                // 旧会话仍在收尾，再给它一次机会
                None => match session.done_rx.recv_timeout(self.config.stop_timeout) {
                    Ok(exit) => Some(exit),
                    Err(RecvTimeoutError::Disconnected) => None,
                    Err(RecvTimeoutError::Timeout) => {
                        log::error!("Previous relay session {} has not released its devices", session.id);
                        return Err(RelayError::OpenFailed(PortError::Busy(format!(
                            "previous relay session {} still holds the devices",
                            session.id
                        ))));
                    }
                },
            };
            if let Some(mut old) = slot.take() {
                self.reap(&mut old, exit);
            }
        }

        self.config.validate()?;
        self.state.set(EngineState::Starting);

        match self.launch(backend, preferred_device) {
            Ok(session) => {
                let id = session.id;
                let started = session.frame_len.is_some();
                *slot = Some(session);
                if started {
                    Ok(StartOutcome::Started { session: id })
                } else {
                    self.state.set(EngineState::StoppingFailed);
                    Err(RelayError::OpenFailed(PortError::Busy(format!(
                        "audio streams did not open within {:?}",
                        self.config.start_timeout
                    ))))
                }
            }
            Err(e) => {
                self.state.set(EngineState::Stopped);
                log::error!("Failed to start {} relay: {}", backend, e);
                Err(e)
            }
        }
    }

    /// Start with the native engine, retrying once with the fallback engine if
    /// the native one cannot open its streams.
    pub fn start_with_fallback(&self, preferred_device: Option<&str>) -> Result<StartOutcome> {
        match self.start(BackendKind::Native, preferred_device) {
            Err(e @ (RelayError::OpenFailed(_) | RelayError::Config(_))) => {
                log::warn!("Native engine unavailable ({}), trying fallback engine", e);
                self.start(BackendKind::Fallback, preferred_device)
            }
            other => other,
        }
    }

    /// Stop the session and wait (bounded) until both ports are released.
    ///
    /// A no-op when nothing is running. The only error is `StopTimeout`: the
    /// loop did not drain in time, the engine stays in `StoppingFailed` and a
    /// later `stop` or `start` waits for it again.
    pub fn stop(&self) -> Result<()> {
        let mut slot = lock(&self.session);
        let Some(session) = slot.as_mut() else {
            return Ok(());
        };

        session.shared.request_stop();
        let exit = match session.done_rx.recv_timeout(self.config.stop_timeout) {
            Ok(exit) => Some(exit),
            Err(RecvTimeoutError::Disconnected) => None,
            Err(RecvTimeoutError::Timeout) => {
                self.state.set(EngineState::StoppingFailed);
                log::error!(
                    "Relay session {} did not stop within {:?}",
                    session.id,
                    self.config.stop_timeout
                );
                return Err(RelayError::StopTimeout(self.config.stop_timeout));
            }
        };

        if let Some(mut old) = slot.take() {
            self.reap(&mut old, exit);
        }
        Ok(())
    }

    pub fn status(&self) -> RelayStatus {
        let slot = lock(&self.session);
        let session = slot.as_ref();
        RelayStatus {
            state: self.state.get(),
            backend: session.map(|s| s.backend),
            session: session.map(|s| s.id),
            input_device: session.map(|s| s.device.clone()),
            frame_samples: session.and_then(|s| s.frame_len),
            volume: self.gain.get(),
            max_volume: self.gain.max(),
            counters: session.map(|s| s.shared.stats.snapshot()).unwrap_or_default(),
        }
    }

    fn backend(&self, kind: BackendKind) -> Arc<dyn AudioBackend> {
        match kind {
            BackendKind::Native => self.native.clone(),
            BackendKind::Fallback => self.fallback.clone(),
        }
    }

    /// Resolve devices, spawn the relay thread and wait for its ports to open.
    fn launch(&self, kind: BackendKind, preferred_device: Option<&str>) -> Result<Session> {
        let backend = self.backend(kind);

        if !has_output_route(backend.devices(), self.config.require_headset_output) {
            return Err(RelayError::NoDevice(StreamDirection::Playback));
        }
        let device = resolve_input_device(backend.devices(), preferred_device, self.config.capture_source);

        let sample_rate = self.config.sample_rate_for(kind);
        let id = Uuid::new_v4();
        let shared = Arc::new(RelayShared::new(self.gain.clone()));

        let plan = SessionPlan {
            id,
            backend,
            capture: PortConfig::new(sample_rate, self.config.min_period_samples)
                .with_device(Some(device.clone()))
                .with_capture_source(self.config.capture_source),
            playback: PortConfig::new(sample_rate, self.config.min_period_samples),
            min_period_samples: self.config.min_period_samples,
            buffer_multiplier: self.config.buffer_multiplier,
            timing: LoopTiming {
                read_backoff: self.config.read_backoff,
                max_consecutive_errors: self.config.max_consecutive_errors,
            },
            realtime_priority: self.config.realtime_priority,
            state: self.state.clone(),
            events: self.events.clone(),
        };

        log::info!(
            "AudioSystem starting session {}: backend={}, input={} ({}), rate={}Hz",
            id,
            kind,
            device.id,
            device.name,
            sample_rate,
        );

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let handle = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("audio-relay".into())
                .spawn(move || relay_thread(plan, shared, ready_tx, done_tx))?
        };

        let mut session = Session {
            id,
            backend: kind,
            device,
            frame_len: None,
            shared,
            done_rx,
            handle: Some(handle),
        };

        match ready_rx.recv_timeout(self.config.start_timeout) {
            Ok(Ok(frame_len)) => {
                session.frame_len = Some(frame_len);
                Ok(session)
            }
            Ok(Err(e)) => {
                session.join();
                Err(RelayError::OpenFailed(e))
            }
            Err(RecvTimeoutError::Disconnected) => {
                session.join();
                Err(RelayError::Unrecoverable(
                    "relay thread exited before opening its streams".into(),
                ))
            }
            Err(RecvTimeoutError::Timeout) => {
                // 线程可能仍卡在 open 中；保留会话以便之后回收
                log::error!("Relay session {} did not open its streams in time", id);
                session.shared.request_stop();
                Ok(session)
            }
        }
    }

    /// Final bookkeeping for a session whose thread has finished.
    fn reap(&self, session: &mut Session, exit: Option<LoopExit>) {
        session.join();
        self.state.set(EngineState::Stopped);
        let counters = session.shared.stats.snapshot();
        match exit {
            Some(LoopExit::Stopped) => log::info!(
                "Relay session {} stopped: {} frames, {} transient errors, {} short writes",
                session.id,
                counters.frames_relayed,
                counters.transient_errors,
                counters.short_writes,
            ),
            Some(LoopExit::Failed(e)) => {
                log::warn!("Relay session {} had ended unexpectedly: {}", session.id, e)
            }
            None => log::warn!("Relay session {} ended without reporting", session.id),
        }
    }
}

impl Drop for AudioSystem {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("AudioSystem dropped while relay was still draining: {}", e);
        }
    }
}

// ======================== Relay thread ========================

fn relay_thread(
    mut plan: SessionPlan,
    shared: Arc<RelayShared>,
    ready_tx: Sender<std::result::Result<usize, PortError>>,
    done_tx: Sender<LoopExit>,
) {
    promote_current_thread(plan.realtime_priority);

    // 1. Size the frame from the platform's minimum safe buffer
    let min_buffer = plan
        .backend
        .min_buffer_samples(&plan.capture)
        .unwrap_or(0)
        .max(plan.min_period_samples);
    let frame_len = frame_samples(min_buffer, plan.buffer_multiplier);
    plan.capture.buffer_samples = frame_len;
    plan.playback.buffer_samples = frame_len;

    // 2. Open both ports; a failure leaves nothing open
    let ports = match open_ports(plan.backend.as_ref(), &plan.capture, &plan.playback) {
        Ok(ports) => ports,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if !shared.stop_requested() {
        plan.state.set(EngineState::Running);
        plan.emit(RelayEvent::Started {
            session: plan.id,
            backend: plan.backend.kind(),
            device: plan.capture.device.clone().unwrap_or_else(DeviceDescriptor::system_default),
            frame_samples: frame_len,
        });
    }
    let _ = ready_tx.send(Ok(frame_len));

    log::info!(
        "Relay session {} running: frame={} samples ({} min buffer x{}), rate={}Hz",
        plan.id,
        frame_len,
        min_buffer,
        plan.buffer_multiplier,
        plan.capture.sample_rate,
    );

    // 3. Relay until stopped or broken
    let exit = run_relay(ports, frame_len, &shared, plan.timing);

    let counters = shared.stats.snapshot();
    match &exit {
        LoopExit::Stopped => plan.emit(RelayEvent::Stopped {
            session: plan.id,
            counters,
        }),
        LoopExit::Failed(e) => {
            log::error!("Relay session {} stopped unexpectedly: {}", plan.id, e);
            plan.emit(RelayEvent::StoppedUnexpectedly {
                session: plan.id,
                reason: e.to_string(),
                counters,
            });
        }
    }

    plan.state.set(EngineState::Stopped);
    let _ = done_tx.send(exit);
}
