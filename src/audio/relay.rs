//! The relay loop: capture → gain → playback, one frame per iteration.
//!
//! Runs on the dedicated relay thread. The only cross-thread state it touches
//! is `RelayShared` (volume, stop flag, counters), all atomics.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use serde::Serialize;

use super::frame::AudioFrame;
use super::gain::{GainState, apply_gain};
use super::port::{CapturePort, OpenPorts, PlaybackPort};
use crate::error::PortError;

/// Per-session counters, bumped by the relay thread.
#[derive(Debug, Default)]
pub struct RelayStats {
    frames: AtomicU64,
    samples: AtomicU64,
    transient_errors: AtomicU64,
    short_writes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayCounters {
    pub frames_relayed: u64,
    pub samples_relayed: u64,
    pub transient_errors: u64,
    pub short_writes: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayCounters {
        RelayCounters {
            frames_relayed: self.frames.load(Ordering::Relaxed),
            samples_relayed: self.samples.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
            short_writes: self.short_writes.load(Ordering::Relaxed),
        }
    }
}

/// Everything the control thread and the relay thread both see.
#[derive(Debug)]
pub struct RelayShared {
    pub gain: Arc<GainState>,
    pub stats: RelayStats,
    stop: AtomicBool,
}

impl RelayShared {
    pub fn new(gain: Arc<GainState>) -> Self {
        Self {
            gain,
            stats: RelayStats::default(),
            stop: AtomicBool::new(false),
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Error policy of the loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopTiming {
    /// Sleep after an empty or failed read
    pub read_backoff: Duration,
    /// Empty/failed reads (or stalled writes) in a row before giving up
    pub max_consecutive_errors: u32,
}

/// Why the loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Stop was requested
    Stopped,
    /// A port failed in a way the loop cannot recover from
    Failed(PortError),
}

/// Run a whole session on the current thread: start both ports, relay until
/// stopped or broken, then stop and release both ports.
pub fn run_relay(
    ports: OpenPorts,
    frame_len: usize,
    shared: &RelayShared,
    timing: LoopTiming,
) -> LoopExit {
    let OpenPorts {
        mut capture,
        mut playback,
    } = ports;

    let exit = match start_ports(capture.as_mut(), playback.as_mut()) {
        Ok(()) => {
            let frame = AudioFrame::new(frame_len);
            relay_frames(capture.as_mut(), playback.as_mut(), frame, shared, timing)
        }
        Err(e) => {
            log::error!("Failed to start audio streams: {}", e);
            LoopExit::Failed(e)
        }
    };

    teardown(capture.as_mut(), playback.as_mut());
    exit
}

// 先启动播放，保证第一帧到达时输出端已就绪
fn start_ports(capture: &mut dyn CapturePort, playback: &mut dyn PlaybackPort) -> Result<(), PortError> {
    playback.start()?;
    capture.start()
}

fn relay_frames(
    capture: &mut dyn CapturePort,
    playback: &mut dyn PlaybackPort,
    mut frame: AudioFrame,
    shared: &RelayShared,
    timing: LoopTiming,
) -> LoopExit {
    let mut consecutive_errors = 0u32;

    while !shared.stop_requested() {
        let read = match capture.read(frame.as_mut_slice()) {
            Ok(n) => n,
            Err(e) if e.is_transient() => {
                if consecutive_errors == 0 {
                    log::warn!("Capture error: {}, backing off", e);
                }
                0
            }
            Err(e) => {
                log::error!("Capture stream failed: {}", e);
                return LoopExit::Failed(e);
            }
        };

        if read == 0 {
            consecutive_errors += 1;
            shared.stats.transient_errors.fetch_add(1, Ordering::Relaxed);
            if consecutive_errors >= timing.max_consecutive_errors {
                log::error!(
                    "Capture produced no data for {} consecutive reads",
                    consecutive_errors
                );
                return LoopExit::Failed(PortError::Disconnected(format!(
                    "capture produced no data for {} consecutive reads",
                    consecutive_errors
                )));
            }
            thread::sleep(timing.read_backoff);
            continue;
        }
        consecutive_errors = 0;

        // 每帧只读取一次音量，修改在下一帧生效
        let samples = frame.filled_mut(read);
        apply_gain(samples, shared.gain.get());

        let written = match write_all(playback, samples, shared, timing) {
            Ok(n) => n,
            Err(e) => {
                log::error!("Playback stream failed: {}", e);
                return LoopExit::Failed(e);
            }
        };

        // 停止时可能只写出了部分帧
        if written == read {
            shared.stats.frames.fetch_add(1, Ordering::Relaxed);
        }
        shared.stats.samples.fetch_add(written as u64, Ordering::Relaxed);
    }

    LoopExit::Stopped
}

/// Keep writing until the whole frame is accepted. Returns the samples written.
///
/// Partial writes are normal. Writes that accept nothing are retried after a
/// backoff, up to the consecutive-error limit. A stop request abandons the
/// rest of the frame.
fn write_all(
    playback: &mut dyn PlaybackPort,
    samples: &[i16],
    shared: &RelayShared,
    timing: LoopTiming,
) -> Result<usize, PortError> {
    let total = samples.len();
    let mut written = 0usize;
    let mut stalls = 0u32;
    let mut short = false;

    while written < total {
        match playback.write(&samples[written..]) {
            Ok(n) if n > 0 => {
                written = (written + n).min(total);
                if written < total {
                    short = true;
                }
                stalls = 0;
                continue;
            }
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                log::warn!("Playback error: {}, retrying", e);
                shared.stats.transient_errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => return Err(e),
        }

        stalls += 1;
        if stalls >= timing.max_consecutive_errors {
            return Err(PortError::Disconnected(format!(
                "playback accepted nothing for {} attempts ({} of {} samples written)",
                stalls, written, total
            )));
        }
        if shared.stop_requested() {
            log::debug!("Stop requested, dropping {} unwritten samples", total - written);
            break;
        }
        thread::sleep(timing.read_backoff);
    }

    if short {
        shared.stats.short_writes.fetch_add(1, Ordering::Relaxed);
    }
    Ok(written)
}

/// Stop and release both ports. Every step is attempted; failures are logged.
fn teardown(capture: &mut dyn CapturePort, playback: &mut dyn PlaybackPort) {
    if let Err(e) = playback.stop() {
        log::warn!("Failed to stop playback stream: {}", e);
    }
    if let Err(e) = capture.stop() {
        log::warn!("Failed to stop capture stream: {}", e);
    }
    if let Err(e) = playback.release() {
        log::warn!("Failed to release playback stream: {}", e);
    }
    if let Err(e) = capture.release() {
        log::warn!("Failed to release capture stream: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Journal = Arc<Mutex<Vec<&'static str>>>;

    struct ScriptedCapture {
        script: VecDeque<Result<Vec<i16>, PortError>>,
        shared: Arc<RelayShared>,
        journal: Journal,
        reads: usize,
        // When the script runs dry: keep returning 0 instead of requesting stop
        starve: bool,
        gain_change: Option<(usize, f32)>,
    }

    impl ScriptedCapture {
        fn new(script: Vec<Result<Vec<i16>, PortError>>, shared: &Arc<RelayShared>, journal: &Journal) -> Self {
            Self {
                script: script.into(),
                shared: shared.clone(),
                journal: journal.clone(),
                reads: 0,
                starve: false,
                gain_change: None,
            }
        }
    }

    impl CapturePort for ScriptedCapture {
        fn start(&mut self) -> Result<(), PortError> {
            self.journal.lock().unwrap().push("capture.start");
            Ok(())
        }

        fn read(&mut self, buf: &mut [i16]) -> Result<usize, PortError> {
            if let Some((at, gain)) = self.gain_change {
                if self.reads == at {
                    self.shared.gain.set(gain);
                }
            }
            self.reads += 1;
            match self.script.pop_front() {
                Some(Ok(samples)) => {
                    buf[..samples.len()].copy_from_slice(&samples);
                    Ok(samples.len())
                }
                Some(Err(e)) => Err(e),
                None => {
                    if !self.starve {
                        self.shared.request_stop();
                    }
                    Ok(0)
                }
            }
        }

        fn stop(&mut self) -> Result<(), PortError> {
            self.journal.lock().unwrap().push("capture.stop");
            Ok(())
        }

        fn release(&mut self) -> Result<(), PortError> {
            self.journal.lock().unwrap().push("capture.release");
            Ok(())
        }
    }

    struct ChunkedPlayback {
        chunk: usize,
        sink: Arc<Mutex<Vec<i16>>>,
        journal: Journal,
        writes: usize,
        fail_on_write: Option<usize>,
        fail_stop: bool,
        // Total samples accepted before every write returns 0
        capacity: usize,
        accepted: usize,
        stop_when_full: Option<Arc<RelayShared>>,
    }

    impl ChunkedPlayback {
        fn new(chunk: usize, journal: &Journal) -> Self {
            Self {
                chunk,
                sink: Arc::new(Mutex::new(Vec::new())),
                journal: journal.clone(),
                writes: 0,
                fail_on_write: None,
                fail_stop: false,
                capacity: usize::MAX,
                accepted: 0,
                stop_when_full: None,
            }
        }
    }

    impl PlaybackPort for ChunkedPlayback {
        fn start(&mut self) -> Result<(), PortError> {
            self.journal.lock().unwrap().push("playback.start");
            Ok(())
        }

        fn write(&mut self, buf: &[i16]) -> Result<usize, PortError> {
            self.writes += 1;
            if self.fail_on_write == Some(self.writes) {
                return Err(PortError::Disconnected("unplugged".into()));
            }
            let room = self.capacity - self.accepted;
            let n = buf.len().min(self.chunk).min(room);
            if n == 0 {
                if let Some(shared) = &self.stop_when_full {
                    shared.request_stop();
                }
            }
            self.accepted += n;
            self.sink.lock().unwrap().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn stop(&mut self) -> Result<(), PortError> {
            self.journal.lock().unwrap().push("playback.stop");
            if self.fail_stop {
                return Err(PortError::Backend("stop failed".into()));
            }
            Ok(())
        }

        fn release(&mut self) -> Result<(), PortError> {
            self.journal.lock().unwrap().push("playback.release");
            Ok(())
        }
    }

    fn timing(max_errors: u32) -> LoopTiming {
        LoopTiming {
            read_backoff: Duration::from_millis(0),
            max_consecutive_errors: max_errors,
        }
    }

    fn shared(volume: f32) -> Arc<RelayShared> {
        Arc::new(RelayShared::new(Arc::new(GainState::new(volume, 4.0))))
    }

    fn ports(capture: ScriptedCapture, playback: ChunkedPlayback) -> OpenPorts {
        OpenPorts {
            capture: Box::new(capture),
            playback: Box::new(playback),
        }
    }

    #[test]
    fn relays_frame_with_gain_applied() {
        let shared = shared(2.0);
        let journal = Journal::default();
        let capture = ScriptedCapture::new(vec![Ok(vec![100, -100, 20000, -20000])], &shared, &journal);
        let playback = ChunkedPlayback::new(usize::MAX, &journal);
        let sink = playback.sink.clone();

        let exit = run_relay(ports(capture, playback), 4, &shared, timing(10));

        assert_eq!(exit, LoopExit::Stopped);
        assert_eq!(*sink.lock().unwrap(), vec![200, -200, 32767, -32768]);
        assert_eq!(shared.stats.snapshot().frames_relayed, 1);
    }

    #[test]
    fn partial_writes_are_completed() {
        let shared = shared(1.0);
        let journal = Journal::default();
        let frames: Vec<Vec<i16>> = (0..3).map(|f| (0..10).map(|i| f * 10 + i).collect()).collect();
        let expected: Vec<i16> = frames.concat();
        let capture = ScriptedCapture::new(frames.into_iter().map(Ok).collect(), &shared, &journal);
        let playback = ChunkedPlayback::new(3, &journal);
        let sink = playback.sink.clone();

        run_relay(ports(capture, playback), 10, &shared, timing(10));

        assert_eq!(*sink.lock().unwrap(), expected);
        let counters = shared.stats.snapshot();
        assert_eq!(counters.samples_relayed, 30);
        assert_eq!(counters.short_writes, 3);
    }

    #[test]
    fn volume_change_applies_from_next_frame() {
        let shared = shared(1.0);
        let journal = Journal::default();
        let mut capture = ScriptedCapture::new(vec![Ok(vec![1000]); 4], &shared, &journal);
        capture.gain_change = Some((2, 3.0));
        let playback = ChunkedPlayback::new(usize::MAX, &journal);
        let sink = playback.sink.clone();

        run_relay(ports(capture, playback), 1, &shared, timing(10));

        assert_eq!(*sink.lock().unwrap(), vec![1000, 1000, 3000, 3000]);
    }

    #[test]
    fn transient_reads_back_off_without_writing() {
        let shared = shared(1.0);
        let journal = Journal::default();
        let capture = ScriptedCapture::new(
            vec![
                Err(PortError::Xrun("overrun".into())),
                Ok(vec![]),
                Ok(vec![7, 8]),
            ],
            &shared,
            &journal,
        );
        let playback = ChunkedPlayback::new(usize::MAX, &journal);
        let sink = playback.sink.clone();

        let exit = run_relay(ports(capture, playback), 2, &shared, timing(10));

        assert_eq!(exit, LoopExit::Stopped);
        assert_eq!(*sink.lock().unwrap(), vec![7, 8]);
        // two scripted failures plus the final empty read that stopped the loop
        assert_eq!(shared.stats.snapshot().transient_errors, 3);
    }

    #[test]
    fn starved_capture_becomes_unrecoverable() {
        let shared = shared(1.0);
        let journal = Journal::default();
        let mut capture = ScriptedCapture::new(vec![], &shared, &journal);
        capture.starve = true;
        let playback = ChunkedPlayback::new(usize::MAX, &journal);

        let exit = run_relay(ports(capture, playback), 2, &shared, timing(5));

        assert!(matches!(exit, LoopExit::Failed(PortError::Disconnected(_))));
        let journal = journal.lock().unwrap();
        assert!(journal.contains(&"capture.release"));
        assert!(journal.contains(&"playback.release"));
    }

    #[test]
    fn hard_capture_error_ends_session_and_tears_down() {
        let shared = shared(1.0);
        let journal = Journal::default();
        let capture = ScriptedCapture::new(
            vec![Ok(vec![1]), Err(PortError::Disconnected("mic gone".into()))],
            &shared,
            &journal,
        );
        let mut playback = ChunkedPlayback::new(usize::MAX, &journal);
        playback.fail_stop = true;

        let exit = run_relay(ports(capture, playback), 1, &shared, timing(10));

        assert_eq!(exit, LoopExit::Failed(PortError::Disconnected("mic gone".into())));
        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "playback.start",
                "capture.start",
                "playback.stop",
                "capture.stop",
                "playback.release",
                "capture.release",
            ]
        );
    }

    #[test]
    fn playback_failure_mid_frame_ends_session() {
        let shared = shared(1.0);
        let journal = Journal::default();
        let capture = ScriptedCapture::new(vec![Ok(vec![1, 2, 3, 4])], &shared, &journal);
        let mut playback = ChunkedPlayback::new(2, &journal);
        playback.fail_on_write = Some(2);

        let exit = run_relay(ports(capture, playback), 4, &shared, timing(10));

        assert!(matches!(exit, LoopExit::Failed(PortError::Disconnected(_))));
        assert_eq!(shared.stats.snapshot().frames_relayed, 0);
    }

    #[test]
    fn stop_during_stalled_write_counts_only_delivered_samples() {
        let shared = shared(1.0);
        let journal = Journal::default();
        let capture = ScriptedCapture::new(vec![Ok(vec![1, 2, 3, 4])], &shared, &journal);
        let mut playback = ChunkedPlayback::new(usize::MAX, &journal);
        playback.capacity = 3;
        playback.stop_when_full = Some(shared.clone());
        let sink = playback.sink.clone();

        let exit = run_relay(ports(capture, playback), 4, &shared, timing(10));

        assert_eq!(exit, LoopExit::Stopped);
        assert_eq!(*sink.lock().unwrap(), vec![1, 2, 3]);
        let counters = shared.stats.snapshot();
        assert_eq!(counters.samples_relayed, 3);
        assert_eq!(counters.frames_relayed, 0);
        assert_eq!(counters.short_writes, 1);
    }
}
