//! Real-time scheduling for the relay thread.

/// What the scheduler actually granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityGrant {
    /// SCHED_FIFO at the given priority
    Realtime(i32),
    /// Real-time was refused; the thread runs with this nice value instead
    Niced(i32),
    /// Nothing could be changed (no privileges, or unsupported platform)
    Unchanged,
}

#[cfg(target_os = "linux")]
const FALLBACK_NICE: i32 = -11;

/// Ask for real-time scheduling on the calling thread.
///
/// Without CAP_SYS_NICE or an rtprio limit the request is refused; the loop
/// still runs, just with a weaker guarantee against underruns.
#[cfg(unix)]
pub fn promote_current_thread(requested: i32) -> PriorityGrant {
    unsafe {
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        let min = libc::sched_get_priority_min(libc::SCHED_FIFO);
        let priority = requested.clamp(min.max(1), max.max(1));

        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = priority;
        if libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) == 0 {
            log::info!("Relay thread running with SCHED_FIFO priority {}", priority);
            return PriorityGrant::Realtime(priority);
        }
    }

    log::warn!("Real-time scheduling refused, audio may crackle under load");
    lower_nice()
}

#[cfg(target_os = "linux")]
fn lower_nice() -> PriorityGrant {
    // 在 Linux 上 setpriority 作用于单个线程 (tid)
    let result = unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS, tid, FALLBACK_NICE)
    };
    if result == 0 {
        log::info!("Relay thread running with nice {}", FALLBACK_NICE);
        PriorityGrant::Niced(FALLBACK_NICE)
    } else {
        PriorityGrant::Unchanged
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn lower_nice() -> PriorityGrant {
    PriorityGrant::Unchanged
}

#[cfg(not(unix))]
pub fn promote_current_thread(_requested: i32) -> PriorityGrant {
    log::warn!("Real-time scheduling is not supported on this platform");
    PriorityGrant::Unchanged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_never_fails_the_caller() {
        let grant = std::thread::spawn(|| promote_current_thread(80))
            .join()
            .unwrap();
        match grant {
            PriorityGrant::Realtime(p) => assert!(p >= 1),
            PriorityGrant::Niced(n) => assert!(n < 0),
            PriorityGrant::Unchanged => {}
        }
    }
}
