//! Isochronous streaming core: transfer pools, packet codecs and the stage
//! pipeline, driven from the worker thread.
//!
//! Nothing in here may fail the worker. Bad packets, refused submissions and
//! bus errors are counted and streaming continues; only a disconnect changes
//! the core's mode, turning it into a drain that waits for `Stop`.

use super::header::{HEADER_LEN, HeaderCodec};
use super::pipeline::{SharedExchange, StagePipeline};
use super::sample;
use super::transfer::{Direction, SlotState, TransferPool};
use crate::error::{BridgeError, Result};
use crate::hw::options::HwOptions;
use crate::hw::status::{EngineShared, bump};
use crate::hw::traits::{Completion, TransferStatus, Transport};
use crate::message::{Message, Notifier};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Completions drained per wakeup before the watchdog is checked again.
const MAX_BATCH: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub completions: usize,
    pub watchdog: bool,
}

pub struct IsoCore {
    transport: Box<dyn Transport>,
    rx_pool: TransferPool,
    tx_pool: TransferPool,
    rx_codec: HeaderCodec,
    tx_codec: HeaderCodec,
    pipeline: StagePipeline,
    shared: Arc<EngineShared>,
    notifier: Notifier,
    sample_rate: u32,
    watchdog: Duration,
    stop_timeout: Duration,
    deadline: Instant,
    tx_sequence: u8,
    tx_credit: usize,
    credit_cap: usize,
    silence_threshold: usize,
    disconnected: bool,
    malfunction: bool,
}

impl std::fmt::Debug for IsoCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsoCore")
            .field("rx_in_flight", &self.rx_pool.in_flight())
            .field("tx_in_flight", &self.tx_pool.in_flight())
            .field("tx_credit", &self.tx_credit)
            .field("disconnected", &self.disconnected)
            .field("malfunction", &self.malfunction)
            .finish()
    }
}

impl IsoCore {
    /// Allocates every transfer buffer and pipeline region up front; nothing
    /// is allocated once streaming starts.
    pub fn new(
        transport: Box<dyn Transport>,
        options: &HwOptions,
        sample_rate: u32,
        shared: Arc<EngineShared>,
        notifier: Notifier,
    ) -> Self {
        let packet_frames = options.packet_frames.max(1);
        let rx_codec = HeaderCodec::new(sample::frame_bytes(options.input_channels), packet_frames);
        let tx_codec =
            HeaderCodec::new(sample::frame_bytes(options.output_channels), packet_frames);
        let period = options.period_frames;
        let watchdog = options.watchdog_for(sample_rate);
        Self {
            transport,
            rx_pool: TransferPool::new(
                Direction::Receive,
                options.transfers,
                rx_codec.packet_bytes(),
            ),
            tx_pool: TransferPool::new(
                Direction::Transmit,
                options.transfers,
                tx_codec.packet_bytes(),
            ),
            rx_codec,
            tx_codec,
            pipeline: StagePipeline::new(
                options.input_channels,
                options.output_channels,
                period,
                options.pad,
            ),
            shared,
            notifier,
            sample_rate,
            watchdog,
            stop_timeout: options.stop_timeout,
            deadline: Instant::now() + watchdog,
            tx_sequence: 0,
            tx_credit: 0,
            credit_cap: period * 4,
            silence_threshold: period * 2,
            disconnected: false,
            malfunction: false,
        }
    }

    pub fn exchange(&self) -> SharedExchange {
        self.pipeline.exchange()
    }

    pub fn shared(&self) -> Arc<EngineShared> {
        self.shared.clone()
    }

    pub fn period_frames(&self) -> usize {
        self.pipeline.period_frames()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn malfunction(&self) -> bool {
        self.malfunction
    }

    pub fn is_present(&self) -> bool {
        !self.disconnected && self.transport.is_present()
    }

    pub fn in_flight(&self) -> (usize, usize) {
        (self.rx_pool.in_flight(), self.tx_pool.in_flight())
    }

    /// Gives the transport back so the device can be reopened later.
    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }

    /// Queues the first receive batch and fills every transmit slot with a
    /// nominal packet of silence.
    pub fn open(&mut self) -> Result<()> {
        self.prime_transmits();
        self.submit_receives().map_err(|e| match e {
            BridgeError::NotPresent => {
                BridgeError::DeviceUnavailable("device vanished during open".to_string())
            }
            other => BridgeError::DeviceUnavailable(other.to_string()),
        })
    }

    /// Prepares for the worker loop. Called on the facade thread before the
    /// core moves into the worker.
    pub fn start(&mut self) -> Result<()> {
        if self.malfunction {
            return Err(BridgeError::HardwareMalfunction(
                "transfers from the previous run were never returned".to_string(),
            ));
        }
        if !self.is_present() {
            return Err(BridgeError::NotPresent);
        }
        self.shared.clear_stop();
        self.pipeline.reset();
        self.tx_credit = 0;
        self.prime_transmits();
        self.submit_receives()?;
        while let Some(idx) = self.tx_pool.next_submit() {
            self.submit(Direction::Transmit, idx, self.tx_codec.packet_bytes())?;
        }
        self.deadline = Instant::now() + self.watchdog;
        Ok(())
    }

    /// Waits up to `max_wait` (less if the watchdog is due sooner) for
    /// completions and processes them.
    pub fn poll(&mut self, max_wait: Duration) -> PollStats {
        let mut stats = PollStats::default();
        let wait = self
            .deadline
            .saturating_duration_since(Instant::now())
            .min(max_wait);
        if let Some(c) = self.transport.wait_completion(wait) {
            self.handle_completion(c);
            stats.completions += 1;
            while stats.completions < MAX_BATCH {
                let Some(c) = self.transport.wait_completion(Duration::ZERO) else {
                    break;
                };
                self.handle_completion(c);
                stats.completions += 1;
            }
        }
        if Instant::now() >= self.deadline {
            stats.watchdog = self.on_watchdog();
        }
        stats
    }

    /// Cancels everything outstanding and waits for the buffers to come
    /// home. Returns false if some never did; the core is then unusable.
    pub fn shutdown(&mut self) -> bool {
        self.transport.cancel_all();
        let deadline = Instant::now() + self.stop_timeout;
        while !(self.rx_pool.all_home() && self.tx_pool.all_home()) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let Some(c) = self.transport.wait_completion(deadline - now) else {
                continue;
            };
            let pool = self.pool_mut(c.direction);
            if pool.slot(c.slot).map(|s| s.state()) == Some(SlotState::InFlight) {
                let slot = c.slot;
                let _ = pool.complete(slot, c.buffer, c.actual);
                pool.finish(slot);
            }
        }
        self.rx_pool.finish_all();
        self.tx_pool.finish_all();
        let (rx, tx) = self.in_flight();
        if rx + tx > 0 {
            error!(
                "stop left {} receive and {} transmit transfers with the device",
                rx, tx
            );
            self.malfunction = true;
            return false;
        }
        true
    }

    fn pool(&self, direction: Direction) -> &TransferPool {
        match direction {
            Direction::Receive => &self.rx_pool,
            Direction::Transmit => &self.tx_pool,
        }
    }

    fn pool_mut(&mut self, direction: Direction) -> &mut TransferPool {
        match direction {
            Direction::Receive => &mut self.rx_pool,
            Direction::Transmit => &mut self.tx_pool,
        }
    }

    fn submit(&mut self, direction: Direction, idx: usize, len: usize) -> Result<()> {
        let buffer = self.pool_mut(direction).begin_submit(idx, len)?;
        if let Err(rejected) = self.transport.submit(direction, idx, buffer, len) {
            self.pool_mut(direction).abort_submit(idx, rejected.buffer);
            if rejected.error == BridgeError::NotPresent {
                self.on_disconnect();
            } else {
                let n = bump(&self.shared.counters.transfer_errors);
                debug!("{:?} submit #{} refused: {}", direction, n, rejected.error);
            }
            return Err(rejected.error);
        }
        Ok(())
    }

    fn submit_receives(&mut self) -> Result<()> {
        let len = self.rx_pool.slot_bytes();
        while let Some(idx) = self.rx_pool.next_submit() {
            self.submit(Direction::Receive, idx, len)?;
        }
        Ok(())
    }

    fn refill_transmits(&mut self) {
        while let Some(idx) = self.tx_pool.next_submit() {
            let len = self.prepare_transmit(idx);
            if self.submit(Direction::Transmit, idx, len).is_err() {
                break;
            }
        }
    }

    fn prime_transmits(&mut self) {
        let nominal = self.tx_codec.nominal_frames();
        for idx in 0..self.tx_pool.capacity() {
            let Some(buf) = self.tx_pool.buffer_mut(idx) else {
                continue;
            };
            buf.fill(0);
            if let Err(e) = self.tx_codec.encode(buf, self.tx_sequence, nominal) {
                warn!("cannot prime transmit slot {}: {}", idx, e);
                continue;
            }
            self.tx_sequence = self.tx_sequence.wrapping_add(1);
        }
    }

    fn handle_completion(&mut self, c: Completion) {
        let Completion {
            direction,
            slot,
            buffer,
            actual,
            status,
        } = c;
        if self.pool(direction).slot(slot).map(|s| s.state()) != Some(SlotState::InFlight) {
            debug!("ignoring stray {:?} completion for slot {}", direction, slot);
            return;
        }
        if let Err(e) = self.pool_mut(direction).complete(slot, buffer, actual) {
            debug!("{:?} slot {}: {}", direction, slot, e);
        }

        match status {
            TransferStatus::Disconnected => {
                self.pool_mut(direction).finish(slot);
                self.on_disconnect();
                return;
            }
            TransferStatus::Cancelled => {
                self.pool_mut(direction).finish(slot);
                return;
            }
            TransferStatus::Error => {
                let n = bump(&self.shared.counters.transfer_errors);
                if n.is_power_of_two() {
                    warn!("{:?} transfer error #{}", direction, n);
                }
            }
            TransferStatus::Completed => {}
        }

        match direction {
            Direction::Receive => {
                if status == TransferStatus::Completed {
                    self.on_receive(slot);
                }
                self.rx_pool.finish(slot);
                if !self.disconnected {
                    let _ = self.submit_receives();
                }
            }
            Direction::Transmit => {
                if status == TransferStatus::Completed {
                    bump(&self.shared.counters.tx_packets);
                }
                self.tx_pool.finish(slot);
                if !self.disconnected {
                    self.refill_transmits();
                }
            }
        }
    }

    fn on_receive(&mut self, slot: usize) {
        bump(&self.shared.counters.rx_packets);
        let decoded = match self.rx_pool.data(slot).map(|d| self.rx_codec.decode(d)) {
            Some(Ok(decoded)) => decoded,
            Some(Err(e)) => {
                let n = bump(&self.shared.counters.malformed);
                if n.is_power_of_two() {
                    warn!("malformed input packet #{}: {}", n, e);
                } else {
                    debug!("malformed input packet #{}: {}", n, e);
                }
                return;
            }
            None => return,
        };

        let frame_bytes = self.rx_codec.frame_bytes();
        let mut offset = decoded.payload_offset;
        let mut remaining = decoded.frames;
        while remaining > 0 {
            // A rotation deferred on an earlier packet is retried here, once
            // the host may have read the exchange region.
            if self.pipeline.fill_full() {
                self.rotate_input();
            }
            let Some(data) = self.rx_pool.data(slot) else {
                break;
            };
            match self.pipeline.write_fill_chunk(&data[offset..], remaining) {
                Ok(0) => break,
                Ok(n) => {
                    offset += n * frame_bytes;
                    remaining -= n;
                }
                Err(_) => {
                    let n = bump(&self.shared.counters.overruns);
                    debug!("input overrun #{}, {} frames dropped", n, remaining);
                    break;
                }
            }
            if self.pipeline.fill_full() {
                self.rotate_input();
            }
        }
        self.tx_credit = (self.tx_credit + decoded.frames).min(self.credit_cap);
    }

    fn rotate_input(&mut self) {
        if self.pipeline.rotate_fill_to_exchange() {
            bump(&self.shared.counters.captured_periods);
            self.deadline = Instant::now() + self.watchdog;
            self.shared.period.notify();
        }
    }

    /// Builds the next outgoing packet in slot `idx` and returns its length.
    /// Output is paced by input: a packet carries at most as many frames as
    /// were captured since the last one.
    fn prepare_transmit(&mut self, idx: usize) -> usize {
        let frame_bytes = self.tx_codec.frame_bytes();
        let wanted = self.tx_credit.min(self.tx_codec.nominal_frames());
        let Some(buf) = self.tx_pool.buffer_mut(idx) else {
            return 0;
        };
        let payload = &mut buf[HEADER_LEN..];
        let mut produced = 0;
        while produced < wanted {
            if self.pipeline.drain_remaining() == 0 && !self.pipeline.rotate_exchange_to_drain()
            {
                break;
            }
            match self
                .pipeline
                .read_drain_chunk(&mut payload[produced * frame_bytes..], wanted - produced)
            {
                Ok(0) | Err(_) => break,
                Ok(n) => produced += n,
            }
        }
        let mut frames = produced;
        if produced < wanted && self.tx_credit > self.silence_threshold {
            // Host is more than two periods behind; keep the device fed.
            payload[produced * frame_bytes..wanted * frame_bytes].fill(0);
            frames = wanted;
            bump(&self.shared.counters.underruns);
        }
        self.tx_credit -= frames;
        match self.tx_codec.encode(buf, self.tx_sequence, frames) {
            Ok(len) => {
                self.tx_sequence = self.tx_sequence.wrapping_add(1);
                len
            }
            Err(e) => {
                warn!("cannot encode transmit packet: {}", e);
                0
            }
        }
    }

    fn on_watchdog(&mut self) -> bool {
        self.deadline = Instant::now() + self.watchdog;
        if self.disconnected {
            return false;
        }
        if !self.pipeline.fill_full() {
            let padded = self.pipeline.pad_fill();
            if padded > 0 {
                let n = bump(&self.shared.counters.padded_periods);
                debug!("watchdog padded {} frames (#{})", padded, n);
                self.tx_credit = (self.tx_credit + padded).min(self.credit_cap);
            }
        }
        self.rotate_input();
        let _ = self.submit_receives();
        self.refill_transmits();
        true
    }

    fn on_disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        self.shared.set_present(false);
        info!("device disconnected, streaming halted until stop");
        self.notifier.send(Message::DeviceStopped { error: true });
        self.notifier.send(Message::ResetRequest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::usb::sample::{pack, unpack};
    use crate::hw::usb::sim::{SimConfig, SimDevice};

    fn setup(watchdog: Duration) -> (SimDevice, IsoCore) {
        let dev = SimDevice::new(SimConfig {
            input_channels: 2,
            output_channels: 2,
            packet_frames: 4,
            ..SimConfig::default()
        });
        let options = HwOptions {
            input_channels: 2,
            output_channels: 2,
            period_frames: 8,
            fifo_frames: 64,
            transfers: 4,
            packet_frames: 4,
            watchdog: Some(watchdog),
            ..HwOptions::default()
        };
        let core = IsoCore::new(
            Box::new(dev.transport()),
            &options,
            48_000,
            Arc::new(EngineShared::new(true)),
            Notifier::disabled(),
        );
        (dev, core)
    }

    fn pump(core: &mut IsoCore, rounds: usize) {
        for _ in 0..rounds {
            core.poll(Duration::from_millis(1));
        }
    }

    #[test]
    fn open_submits_receives_and_start_primes_transmits() {
        let (dev, mut core) = setup(Duration::from_secs(1));
        core.open().unwrap();
        assert_eq!(dev.pending_receives(), 4);
        assert_eq!(dev.pending_transmits(), 0);
        core.start().unwrap();
        assert_eq!(dev.pending_transmits(), 4);
        assert_eq!(core.in_flight(), (4, 4));

        // Primed packets are nominal silence.
        dev.release_transmits(4);
        assert_eq!(dev.sent_channel(0), vec![0; 16]);
        assert!(core.shutdown());
    }

    #[test]
    fn captured_frames_reach_the_exchange_region() {
        let (dev, mut core) = setup(Duration::from_secs(1));
        core.open().unwrap();
        core.start().unwrap();
        let samples: Vec<i32> = (0..16).collect();
        dev.push_input(&samples);
        pump(&mut core, 4);

        let counters = core.shared().counters.snapshot();
        assert_eq!(counters.rx_packets, 2);
        assert_eq!(counters.captured_periods, 1);
        let ex = core.exchange();
        let ex = ex.lock().unwrap();
        assert!(ex.input_fresh());
        let right = ex.input().channel(1);
        assert_eq!(unpack(&right[0..]), 1);
        assert_eq!(unpack(&right[7 * 3..]), 15);
        drop(ex);
        assert!(core.shutdown());
    }

    #[test]
    fn malformed_packet_is_counted_and_skipped() {
        let (dev, mut core) = setup(Duration::from_secs(1));
        core.open().unwrap();
        core.start().unwrap();
        dev.push_raw(vec![0x00, 0, 4, 0]);
        dev.push_input(&[1; 16]);
        pump(&mut core, 4);
        let counters = core.shared().counters.snapshot();
        assert_eq!(counters.malformed, 1);
        assert_eq!(counters.captured_periods, 1);
        assert!(core.shutdown());
    }

    #[test]
    fn watchdog_pads_a_starved_period() {
        let (dev, mut core) = setup(Duration::from_millis(2));
        core.open().unwrap();
        core.start().unwrap();
        dev.push_input(&[3; 4]);
        std::thread::sleep(Duration::from_millis(5));
        pump(&mut core, 2);
        let counters = core.shared().counters.snapshot();
        assert!(counters.padded_periods >= 1);
        assert!(counters.captured_periods >= 1);
        assert!(core.shutdown());
    }

    #[test]
    fn transmit_is_paced_by_captured_frames() {
        let (dev, mut core) = setup(Duration::from_secs(1));
        core.open().unwrap();
        core.start().unwrap();
        {
            let ex = core.exchange();
            let mut ex = ex.lock().unwrap();
            let out = ex.output_mut();
            for f in 0..8 {
                let at = out.layout(0).at(f);
                pack(f as i32 + 1, &mut out.as_bytes_mut()[at..]);
            }
            ex.publish_output();
        }
        // Nothing captured yet: released slots come back empty.
        dev.release_transmits(4);
        pump(&mut core, 4);
        dev.release_transmits(4);
        assert_eq!(dev.sent_channel(0).len(), 16);

        dev.push_input(&[0; 16]);
        pump(&mut core, 4);
        dev.release_transmits(4);
        pump(&mut core, 4);
        dev.release_transmits(4);
        let sent = dev.sent_channel(0);
        assert_eq!(&sent[16..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(core.shutdown());
    }

    #[test]
    fn disconnect_stops_resubmission() {
        let (dev, mut core) = setup(Duration::from_secs(1));
        core.open().unwrap();
        core.start().unwrap();
        dev.set_present(false);
        pump(&mut core, 4);
        assert!(!core.shared().present());
        assert_eq!(core.in_flight(), (0, 0));
        assert_eq!(dev.pending_receives(), 0);
        assert!(core.shutdown());
        assert!(matches!(core.start(), Err(BridgeError::NotPresent)));
    }

    #[test]
    fn deferred_rotation_resumes_once_host_catches_up() {
        let (dev, mut core) = setup(Duration::from_secs(1));
        core.open().unwrap();
        core.start().unwrap();
        // Two periods: the second stays in the fill region because the host
        // has not read the first.
        let samples: Vec<i32> = (0..32).collect();
        dev.push_input(&samples);
        pump(&mut core, 4);
        let counters = core.shared().counters.snapshot();
        assert_eq!(counters.captured_periods, 1);
        assert_eq!(counters.overruns, 0);

        core.exchange().lock().unwrap().consume_input();
        dev.push_input(&[7; 16]);
        pump(&mut core, 4);

        let counters = core.shared().counters.snapshot();
        assert_eq!(counters.overruns, 0);
        assert_eq!(counters.captured_periods, 2);
        let ex = core.exchange();
        let ex = ex.lock().unwrap();
        assert!(ex.input_fresh());
        assert_eq!(unpack(&ex.input().channel(0)[0..]), 16);
        assert_eq!(unpack(&ex.input().channel(1)[7 * 3..]), 31);
        drop(ex);
        assert!(core.shutdown());
    }

    #[test]
    fn unreturned_transfers_are_a_malfunction() {
        let (dev, mut core) = setup(Duration::from_secs(1));
        core.stop_timeout = Duration::from_millis(10);
        core.open().unwrap();
        core.start().unwrap();
        dev.set_hold(true);
        assert!(!core.shutdown());
        assert!(core.malfunction());
        assert!(matches!(
            core.start(),
            Err(BridgeError::HardwareMalfunction(_))
        ));
    }
}
