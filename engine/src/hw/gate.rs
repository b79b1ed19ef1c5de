//! Host side of the bridge: the ping/pong buffers the host reads and writes,
//! and the gate that swaps them against the exchange region once per period.
//!
//! `BufferSwitchGate::exchange` is called on the host's realtime thread. It
//! never waits: if the worker holds the exchange guard the period is skipped
//! and the active index stays where it was.

use crate::hw::status::{EngineShared, bump};
use crate::hw::usb::pipeline::SharedExchange;
use crate::hw::usb::sample::{self, Layout, SAMPLE_BYTES};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, TryLockError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostLayout {
    Planar,
    Interleaved,
}

#[derive(Debug, Clone)]
struct HostHalf {
    input: Vec<u8>,
    output: Vec<u8>,
}

/// Two buffer sets, one live for the host at a time. Channel slots map to
/// device channels through `input_map` / `output_map`.
#[derive(Debug, Clone)]
pub struct HostDoubleBuffer {
    frames: usize,
    halves: [HostHalf; 2],
    input_map: Vec<usize>,
    output_map: Vec<usize>,
    layout: HostLayout,
    active: usize,
}

impl HostDoubleBuffer {
    pub fn new(
        input_map: Vec<usize>,
        output_map: Vec<usize>,
        frames: usize,
        layout: HostLayout,
    ) -> Self {
        let half = HostHalf {
            input: vec![0_u8; input_map.len() * frames * SAMPLE_BYTES],
            output: vec![0_u8; output_map.len() * frames * SAMPLE_BYTES],
        };
        Self {
            frames,
            halves: [half.clone(), half],
            input_map,
            output_map,
            layout,
            active: 0,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn input_map(&self) -> &[usize] {
        &self.input_map
    }

    pub fn output_map(&self) -> &[usize] {
        &self.output_map
    }

    pub fn input_layout(&self, slot: usize) -> Layout {
        match self.layout {
            HostLayout::Planar => Layout::planar(slot, self.frames),
            HostLayout::Interleaved => Layout::interleaved(slot, self.input_map.len()),
        }
    }

    pub fn output_layout(&self, slot: usize) -> Layout {
        match self.layout {
            HostLayout::Planar => Layout::planar(slot, self.frames),
            HostLayout::Interleaved => Layout::interleaved(slot, self.output_map.len()),
        }
    }

    pub fn input_bytes(&self, half: usize) -> &[u8] {
        &self.halves[half & 1].input
    }

    pub fn output_bytes(&self, half: usize) -> &[u8] {
        &self.halves[half & 1].output
    }

    /// Copies input slot `from` into output slot `to` within one half.
    pub fn route(&mut self, half: usize, from: usize, to: usize) {
        if from >= self.input_map.len() || to >= self.output_map.len() {
            return;
        }
        let src = self.input_layout(from);
        let dst = self.output_layout(to);
        let h = &mut self.halves[half & 1];
        sample::copy_channel(&h.input, src, &mut h.output, dst, self.frames);
    }

    pub fn input_sample(&self, half: usize, slot: usize, frame: usize) -> i32 {
        let at = self.input_layout(slot).at(frame);
        sample::unpack(&self.halves[half & 1].input[at..])
    }

    pub fn set_output_sample(&mut self, half: usize, slot: usize, frame: usize, value: i32) {
        let at = self.output_layout(slot).at(frame);
        sample::pack(value, &mut self.halves[half & 1].output[at..]);
    }

    /// Overwrites every byte of both halves; handy for spotting regions the
    /// gate never wrote.
    pub fn fill_bytes(&mut self, byte: u8) {
        for half in self.halves.iter_mut() {
            half.input.fill(byte);
            half.output.fill(byte);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SwitchInfo {
    /// Index of the half the host should now read and write.
    pub index: usize,
    pub sample_position: u64,
    pub system_time_ns: u64,
    /// False when the engine had no new period and the input repeats stale
    /// data.
    pub fresh: bool,
}

/// The host's buffer-ready callback.
pub trait HostProcess {
    fn buffer_switch(&mut self, info: SwitchInfo, buffers: &mut HostDoubleBuffer);
}

impl<F> HostProcess for F
where
    F: FnMut(SwitchInfo, &mut HostDoubleBuffer),
{
    fn buffer_switch(&mut self, info: SwitchInfo, buffers: &mut HostDoubleBuffer) {
        self(info, buffers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Exchanged { index: usize, fresh: bool },
    /// The guard was busy; nothing copied, index unchanged.
    Skipped,
    /// No device open or the buffers do not match the negotiated period.
    Inactive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SamplePosition {
    pub samples: u64,
    pub system_time_ns: u64,
}

#[derive(Debug)]
pub struct BufferSwitchGate {
    exchange: SharedExchange,
    frames: usize,
    input_channels: usize,
    output_channels: usize,
    active: AtomicBool,
    shared: Arc<EngineShared>,
    epoch: Instant,
    sample_position: AtomicU64,
    system_time_ns: AtomicU64,
}

impl BufferSwitchGate {
    pub fn new(
        exchange: SharedExchange,
        frames: usize,
        input_channels: usize,
        output_channels: usize,
        shared: Arc<EngineShared>,
    ) -> Self {
        Self {
            exchange,
            frames,
            input_channels,
            output_channels,
            active: AtomicBool::new(true),
            shared,
            epoch: Instant::now(),
            sample_position: AtomicU64::new(0),
            system_time_ns: AtomicU64::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn period_frames(&self) -> usize {
        self.frames
    }

    /// The shared region itself, for diagnostics and contention tests.
    pub fn exchange_region(&self) -> SharedExchange {
        self.exchange.clone()
    }

    pub fn sample_position(&self) -> SamplePosition {
        SamplePosition {
            samples: self.sample_position.load(Ordering::Acquire),
            system_time_ns: self.system_time_ns.load(Ordering::Acquire),
        }
    }

    pub fn reset_position(&self) {
        self.sample_position.store(0, Ordering::Release);
        self.system_time_ns.store(0, Ordering::Release);
    }

    /// Current period sequence, for use with `wait_period`.
    pub fn period_seq(&self) -> u64 {
        self.shared.period.current()
    }

    /// Blocks until the worker rotates a new period in. For the host's
    /// pacing thread only, never for `exchange` itself.
    ///
    /// The worker does not rotate again until the host has read the current
    /// period, so after a `Skipped` exchange the host must call `exchange`
    /// again rather than wait for the next sequence.
    pub fn wait_period(&self, seen: u64, timeout: Duration) -> Option<u64> {
        self.shared.period.wait_past(seen, timeout)
    }

    pub fn exchange(
        &self,
        host: &mut HostDoubleBuffer,
        process: &mut dyn HostProcess,
    ) -> ExchangeOutcome {
        if !self.is_active() || host.frames != self.frames {
            return ExchangeOutcome::Inactive;
        }
        let mut ex = match self.exchange.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                bump(&self.shared.counters.skipped_exchanges);
                return ExchangeOutcome::Skipped;
            }
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };

        let next = host.active ^ 1;
        let fresh = ex.input_fresh();
        for (slot, &channel) in host.input_map.iter().enumerate() {
            if channel >= self.input_channels {
                continue;
            }
            let dst_layout = host.input_layout(slot);
            sample::copy_channel(
                ex.input().as_bytes(),
                ex.input().layout(channel),
                &mut host.halves[next].input,
                dst_layout,
                self.frames,
            );
        }
        ex.consume_input();

        let out = ex.output_mut();
        out.clear();
        for (slot, &channel) in host.output_map.iter().enumerate() {
            if channel >= self.output_channels {
                continue;
            }
            let dst_layout = out.layout(channel);
            sample::copy_channel(
                &host.halves[host.active].output,
                host.output_layout(slot),
                out.as_bytes_mut(),
                dst_layout,
                self.frames,
            );
        }
        if ex.publish_output() {
            bump(&self.shared.counters.output_overruns);
        }
        drop(ex);

        if !fresh {
            bump(&self.shared.counters.stale_periods);
        }
        bump(&self.shared.counters.exchanged_periods);
        host.active = next;
        let position = self
            .sample_position
            .fetch_add(self.frames as u64, Ordering::AcqRel)
            + self.frames as u64;
        let now = self.epoch.elapsed().as_nanos() as u64;
        self.system_time_ns.store(now, Ordering::Release);

        process.buffer_switch(
            SwitchInfo {
                index: next,
                sample_position: position,
                system_time_ns: now,
                fresh,
            },
            host,
        );
        ExchangeOutcome::Exchanged { index: next, fresh }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::usb::pipeline::ExchangeRegion;
    use std::sync::Mutex;

    fn gate(frames: usize) -> BufferSwitchGate {
        let exchange = Arc::new(Mutex::new(ExchangeRegion::new(2, 2, frames)));
        BufferSwitchGate::new(exchange, frames, 2, 2, Arc::new(EngineShared::new(true)))
    }

    fn noop(_: SwitchInfo, _: &mut HostDoubleBuffer) {}

    #[test]
    fn skipped_period_keeps_index() {
        let g = gate(4);
        let mut host = HostDoubleBuffer::new(vec![0, 1], vec![0, 1], 4, HostLayout::Planar);
        let region = g.exchange_region();
        let held = region.lock().unwrap();
        assert_eq!(g.exchange(&mut host, &mut noop), ExchangeOutcome::Skipped);
        assert_eq!(host.active_index(), 0);
        drop(held);
        assert_eq!(
            g.exchange(&mut host, &mut noop),
            ExchangeOutcome::Exchanged {
                index: 1,
                fresh: false
            }
        );
        assert_eq!(host.active_index(), 1);
        let counters = g.shared.counters.snapshot();
        assert_eq!(counters.skipped_exchanges, 1);
        assert_eq!(counters.stale_periods, 1);
    }

    #[test]
    fn host_output_lands_on_mapped_device_channels() {
        let g = gate(2);
        let mut host = HostDoubleBuffer::new(vec![1], vec![1, 0], 2, HostLayout::Interleaved);
        host.set_output_sample(0, 0, 0, 11);
        host.set_output_sample(0, 1, 1, -22);
        let mut seen = None;
        let mut cb = |info: SwitchInfo, _: &mut HostDoubleBuffer| seen = Some(info);
        g.exchange(&mut host, &mut cb);
        assert_eq!(seen.map(|i| i.index), Some(1));
        assert_eq!(seen.map(|i| i.sample_position), Some(2));

        let region = g.exchange_region();
        let mut ex = region.lock().unwrap();
        assert!(ex.output_fresh());
        let out = ex.output_mut();
        assert_eq!(sample::unpack(&out.channel(1)[0..]), 11);
        assert_eq!(sample::unpack(&out.channel(0)[3..]), -22);
    }

    #[test]
    fn undrained_host_output_counts_as_output_overrun() {
        let g = gate(4);
        let mut host = HostDoubleBuffer::new(vec![0], vec![0], 4, HostLayout::Planar);
        g.exchange(&mut host, &mut noop);
        g.exchange(&mut host, &mut noop);
        let counters = g.shared.counters.snapshot();
        assert_eq!(counters.output_overruns, 1);
        assert_eq!(counters.overruns, 0);
    }

    #[test]
    fn route_copies_between_mapped_slots() {
        let mut host = HostDoubleBuffer::new(vec![0, 1], vec![0, 1], 3, HostLayout::Interleaved);
        host.halves[1].input.fill(0);
        let at = host.input_layout(1).at(2);
        sample::pack(-5, &mut host.halves[1].input[at..]);
        host.route(1, 1, 0);
        host.route(1, 9, 0);
        assert_eq!(host.output_bytes(1)[..3], [0, 0, 0]);
        let at = host.output_layout(0).at(2);
        assert_eq!(sample::unpack(&host.output_bytes(1)[at..]), -5);
        assert!(host.output_bytes(0).iter().all(|&b| b == 0));
    }

    #[test]
    fn closed_gate_is_inert() {
        let g = gate(4);
        g.deactivate();
        let mut host = HostDoubleBuffer::new(vec![0], vec![0], 4, HostLayout::Planar);
        let mut called = false;
        let mut cb = |_: SwitchInfo, _: &mut HostDoubleBuffer| called = true;
        assert_eq!(g.exchange(&mut host, &mut cb), ExchangeOutcome::Inactive);
        assert!(!called);

        let g = gate(8);
        assert_eq!(g.exchange(&mut host, &mut noop), ExchangeOutcome::Inactive);
    }
}
