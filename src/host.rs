use isobridge_engine::hw::usb::sample::SAMPLE_MAX;
use isobridge_engine::{
    BufferSwitchGate, ExchangeOutcome, HostDoubleBuffer, HostProcess, SwitchInfo,
};
use std::time::{Duration, Instant};
use tracing::debug;

/// Routes input slot `n` to output slot `n` and meters the input peak.
#[derive(Debug, Default)]
pub struct PassThrough {
    pub periods: u64,
    pub stale: u64,
    pub peak: i32,
}

impl HostProcess for PassThrough {
    fn buffer_switch(&mut self, info: SwitchInfo, buffers: &mut HostDoubleBuffer) {
        self.periods += 1;
        if !info.fresh {
            self.stale += 1;
        }
        let frames = buffers.frames();
        for slot in 0..buffers.input_map().len() {
            for frame in 0..frames {
                let v = buffers.input_sample(info.index, slot, frame).saturating_abs();
                self.peak = self.peak.max(v);
            }
        }
        let routes = buffers.input_map().len().min(buffers.output_map().len());
        for slot in 0..routes {
            buffers.route(info.index, slot, slot);
        }
    }
}

impl PassThrough {
    pub fn peak_dbfs(&self) -> f64 {
        if self.peak <= 0 {
            return f64::NEG_INFINITY;
        }
        20.0 * (f64::from(self.peak) / f64::from(SAMPLE_MAX)).log10()
    }
}

/// Plays the host's realtime thread until `until`: waits for each period and
/// exchanges buffers. A skipped exchange is retried without waiting for a new
/// period, since the worker holds the next one back until this one is read.
/// A period that never arrives is exchanged anyway, as a stale one. Returns
/// early if the gate goes inactive.
pub fn run_periods(
    gate: &BufferSwitchGate,
    buffers: &mut HostDoubleBuffer,
    process: &mut PassThrough,
    until: Instant,
    mut keep_going: impl FnMut() -> bool,
) -> bool {
    let mut seq = gate.period_seq();
    let mut owed = false;
    while Instant::now() < until && keep_going() {
        if !owed {
            match gate.wait_period(seq, PERIOD_WAIT) {
                Some(next) => seq = next,
                None => debug!("no period within {PERIOD_WAIT:?}, exchanging anyway"),
            }
        }
        match gate.exchange(buffers, process) {
            ExchangeOutcome::Exchanged { .. } => owed = false,
            ExchangeOutcome::Skipped => {
                owed = true;
                std::thread::sleep(SKIP_BACKOFF);
            }
            ExchangeOutcome::Inactive => return false,
        }
    }
    true
}

const PERIOD_WAIT: Duration = Duration::from_millis(100);
const SKIP_BACKOFF: Duration = Duration::from_micros(200);

#[cfg(test)]
mod tests {
    use super::*;
    use isobridge_engine::HostLayout;
    use isobridge_engine::hw::status::EngineShared;
    use isobridge_engine::hw::usb::pipeline::{PadPolicy, StagePipeline};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    // Stands in for the isochronous worker: fills a 4 frame mono period every
    // couple of milliseconds and rotates it once the host has read the last
    // one. The fifth period is announced while the region is still held.
    fn spawn_worker(
        mut pipeline: StagePipeline,
        shared: Arc<EngineShared>,
        stop: Arc<AtomicBool>,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let region = pipeline.exchange();
            let mut rotations = 0;
            while !stop.load(Ordering::Acquire) {
                if !pipeline.fill_full() {
                    let _ = pipeline.write_fill_chunk(&[0_u8; 12], 4);
                }
                if pipeline.rotate_fill_to_exchange() {
                    rotations += 1;
                    if rotations == 5 {
                        let held = region.lock().unwrap();
                        shared.period.notify();
                        std::thread::sleep(Duration::from_millis(20));
                        drop(held);
                    } else {
                        shared.period.notify();
                    }
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        })
    }

    #[test]
    fn skipped_exchange_is_retried_until_streaming_resumes() {
        let pipeline = StagePipeline::new(1, 1, 4, PadPolicy::Silence);
        let shared = Arc::new(EngineShared::new(true));
        let gate = BufferSwitchGate::new(pipeline.exchange(), 4, 1, 1, shared.clone());
        let stop = Arc::new(AtomicBool::new(false));
        let worker = spawn_worker(pipeline, shared.clone(), stop.clone());

        let mut buffers = HostDoubleBuffer::new(vec![0], vec![0], 4, HostLayout::Planar);
        let mut process = PassThrough::default();
        let until = Instant::now() + Duration::from_millis(400);
        assert!(run_periods(&gate, &mut buffers, &mut process, until, || true));
        stop.store(true, Ordering::Release);
        worker.join().unwrap();

        let counters = shared.counters.snapshot();
        assert!(counters.skipped_exchanges >= 1);
        assert!(process.periods >= 20, "only {} periods", process.periods);
    }

    #[test]
    fn pass_through_counts_stale_periods() {
        let mut buffers = HostDoubleBuffer::new(vec![0, 1], vec![0], 2, HostLayout::Planar);
        buffers.fill_bytes(0);
        let gate = BufferSwitchGate::new(
            StagePipeline::new(2, 1, 2, PadPolicy::Silence).exchange(),
            2,
            2,
            1,
            Arc::new(EngineShared::new(true)),
        );
        let mut process = PassThrough::default();
        gate.exchange(&mut buffers, &mut process);
        assert_eq!(process.periods, 1);
        assert_eq!(process.stale, 1);
        assert_eq!(process.peak_dbfs(), f64::NEG_INFINITY);
    }
}
