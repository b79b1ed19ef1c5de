use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineCounters {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub malformed: u64,
    pub transfer_errors: u64,
    pub overruns: u64,
    /// Host output periods replaced before the worker drained them.
    pub output_overruns: u64,
    pub underruns: u64,
    pub padded_periods: u64,
    pub stale_periods: u64,
    pub skipped_exchanges: u64,
    pub captured_periods: u64,
    pub exchanged_periods: u64,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub rx_packets: AtomicU64,
    pub tx_packets: AtomicU64,
    pub malformed: AtomicU64,
    pub transfer_errors: AtomicU64,
    pub overruns: AtomicU64,
    pub output_overruns: AtomicU64,
    pub underruns: AtomicU64,
    pub padded_periods: AtomicU64,
    pub stale_periods: AtomicU64,
    pub skipped_exchanges: AtomicU64,
    pub captured_periods: AtomicU64,
    pub exchanged_periods: AtomicU64,
}

pub fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

impl Counters {
    pub fn snapshot(&self) -> EngineCounters {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineCounters {
            rx_packets: get(&self.rx_packets),
            tx_packets: get(&self.tx_packets),
            malformed: get(&self.malformed),
            transfer_errors: get(&self.transfer_errors),
            overruns: get(&self.overruns),
            output_overruns: get(&self.output_overruns),
            underruns: get(&self.underruns),
            padded_periods: get(&self.padded_periods),
            stale_periods: get(&self.stale_periods),
            skipped_exchanges: get(&self.skipped_exchanges),
            captured_periods: get(&self.captured_periods),
            exchanged_periods: get(&self.exchanged_periods),
        }
    }
}

/// Period-ready signal from the worker to whoever paces the host thread.
///
/// The worker side only bumps an atomic and notifies; it never takes the
/// mutex, so it cannot be held up by a waiter. A waiter re-checks the
/// sequence in short slices, which bounds the cost of a missed wakeup.
#[derive(Debug, Default)]
pub struct PeriodSignal {
    seq: AtomicU64,
    lock: Mutex<()>,
    cvar: Condvar,
}

const WAIT_SLICE: Duration = Duration::from_millis(2);

impl PeriodSignal {
    pub fn current(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn notify(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
        self.cvar.notify_all();
    }

    /// Waits until the sequence moves past `seen`. Returns the new sequence,
    /// or `None` on timeout.
    pub fn wait_past(&self, seen: u64, timeout: Duration) -> Option<u64> {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = match self.lock.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        loop {
            let now_seq = self.current();
            if now_seq != seen {
                return Some(now_seq);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            guard = match self.cvar.wait_timeout(guard, slice) {
                Ok((g, _)) => g,
                Err(p) => p.into_inner().0,
            };
        }
    }
}

/// State shared between the facade, the worker thread and the gate.
#[derive(Debug, Default)]
pub struct EngineShared {
    present: AtomicBool,
    running: AtomicBool,
    stop: AtomicBool,
    pub counters: Counters,
    pub period: PeriodSignal,
}

impl EngineShared {
    pub fn new(present: bool) -> Self {
        let shared = Self::default();
        shared.present.store(present, Ordering::Release);
        shared
    }

    pub fn present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }

    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::Release);
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub fn request_stop(&self) -> bool {
        self.stop.swap(true, Ordering::AcqRel)
    }

    pub fn clear_stop(&self) {
        self.stop.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub present: bool,
    pub running: bool,
    pub sample_rate: u32,
    pub period_frames: usize,
    pub input_channels: usize,
    pub output_channels: usize,
    pub counters: EngineCounters,
}
