use crate::{
    error::{BridgeError, Result},
    hw::config,
    hw::status::EngineShared,
    hw::usb::isoch::{IsoCore, PollStats},
};
#[cfg(unix)]
use nix::libc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const WORKER_THREAD_NAME: &str = "iso-worker";
#[cfg(unix)]
const RT_POLICY: i32 = libc::SCHED_FIFO;
const RT_PRIORITY_WORKER: i32 = 18;
/// Upper bound on one wait, so a stop request is seen promptly.
const POLL_SLICE: Duration = Duration::from_millis(2);
const PROFILE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct WorkerProfiler {
    report_at: Instant,
    poll_count: u64,
    completion_count: u64,
    watchdog_count: u64,
    busy_time_ns: u128,
}

impl WorkerProfiler {
    fn new() -> Self {
        Self {
            report_at: Instant::now() + PROFILE_INTERVAL,
            poll_count: 0,
            completion_count: 0,
            watchdog_count: 0,
            busy_time_ns: 0,
        }
    }

    fn record(&mut self, stats: PollStats, elapsed: Duration) {
        self.poll_count += 1;
        self.completion_count += stats.completions as u64;
        if stats.watchdog {
            self.watchdog_count += 1;
        }
        if stats.completions > 0 {
            self.busy_time_ns += elapsed.as_nanos();
        }
    }

    fn maybe_report(&mut self, period_frames: usize, sample_rate: u32) {
        let now = Instant::now();
        if now < self.report_at {
            return;
        }
        let expected_pps = if period_frames > 0 {
            sample_rate as f64 / period_frames as f64
        } else {
            0.0
        };
        let avg_us = if self.completion_count > 0 {
            (self.busy_time_ns / self.completion_count as u128) as f64 / 1_000.0
        } else {
            0.0
        };
        info!(
            "iso worker profile: expected_periods_per_sec={:.1} polls={} completions={} watchdog={} completion_avg_us={:.1}",
            expected_pps, self.poll_count, self.completion_count, self.watchdog_count, avg_us
        );
        self.report_at = now + PROFILE_INTERVAL;
        self.poll_count = 0;
        self.completion_count = 0;
        self.watchdog_count = 0;
        self.busy_time_ns = 0;
    }
}

fn configure_rt_thread(name: &str, priority: i32) -> std::result::Result<(), String> {
    #[cfg(unix)]
    {
        let thread = unsafe { libc::pthread_self() };
        let param = unsafe {
            let mut p = std::mem::zeroed::<libc::sched_param>();
            p.sched_priority = priority;
            p
        };
        let rc = unsafe { libc::pthread_setschedparam(thread, RT_POLICY, &param) };
        if rc != 0 {
            return Err(format!(
                "pthread_setschedparam({}, prio {}) failed with errno {}",
                name, priority, rc
            ));
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = name;
        let _ = priority;
        Err("Realtime thread priority is not supported on this platform".to_string())
    }
}

/// Owns the worker thread while streaming. The core moves into the thread
/// on spawn and comes back out of `join`.
#[derive(Debug)]
pub struct IsoWorker {
    handle: Option<JoinHandle<IsoCore>>,
    shared: Arc<EngineShared>,
}

impl IsoWorker {
    pub fn spawn(core: IsoCore) -> Result<Self> {
        let shared = core.shared();
        shared.set_running(true);
        let handle = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || work(core))
            .map_err(|e| {
                shared.set_running(false);
                BridgeError::HardwareMalfunction(format!("cannot spawn worker: {e}"))
            })?;
        Ok(Self {
            handle: Some(handle),
            shared,
        })
    }

    /// Signals the loop to exit without waiting for it.
    pub fn request_stop(&self) -> Result<()> {
        if self.shared.request_stop() || self.is_finished() {
            return Err(BridgeError::AlreadyStopped);
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Waits for the thread to exit and takes the core back.
    pub fn join(mut self) -> Result<IsoCore> {
        self.shared.request_stop();
        let handle = self
            .handle
            .take()
            .ok_or(BridgeError::InvalidState("worker already joined"))?;
        handle.join().map_err(|_| {
            self.shared.set_running(false);
            BridgeError::HardwareMalfunction("worker thread panicked".to_string())
        })
    }
}

impl Drop for IsoWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.shared.request_stop();
            let _ = handle.join();
        }
    }
}

fn work(mut core: IsoCore) -> IsoCore {
    if let Err(e) = configure_rt_thread(WORKER_THREAD_NAME, RT_PRIORITY_WORKER) {
        warn!("iso worker realtime priority not enabled: {}", e);
    }
    let mut profiler = if config::env_flag(config::HW_PROFILE_ENV) {
        info!(
            "iso worker profile enabled: period_frames={} sample_rate={}",
            core.period_frames(),
            core.sample_rate()
        );
        Some(WorkerProfiler::new())
    } else {
        None
    };
    let shared = core.shared();
    while !shared.stop_requested() {
        let started = Instant::now();
        let stats = core.poll(POLL_SLICE);
        if let Some(p) = profiler.as_mut() {
            p.record(stats, started.elapsed());
            p.maybe_report(core.period_frames(), core.sample_rate());
        }
    }
    core.shutdown();
    shared.set_running(false);
    core
}
