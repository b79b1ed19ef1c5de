//! In-process device speaking the packet format of a real interface.
//!
//! `SimDevice` is the control handle (inject input, pace transmits,
//! disconnect), `SimTransport` is the side handed to the bridge. Both share
//! one mutex-protected state and a condvar that wakes the worker when a
//! completion is queued.

use super::header::HeaderCodec;
use super::sample::{self, SAMPLE_BYTES, SAMPLE_MAX};
use super::transfer::Direction;
use crate::error::{BridgeError, Result};
use crate::hw::traits::{Completion, DeviceInfo, Rejected, TransferStatus, Transport};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    pub name: String,
    pub sample_rate: u32,
    pub input_channels: usize,
    pub output_channels: usize,
    pub packet_frames: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            name: "Sim USB Audio".to_string(),
            sample_rate: 48_000,
            input_channels: 32,
            output_channels: 32,
            packet_frames: 16,
        }
    }
}

/// What the device captures when nothing was injected.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum SimSource {
    #[default]
    Idle,
    Tone {
        hz: f32,
    },
}

#[derive(Debug)]
enum Inbound {
    Packet(Vec<u8>),
    Error,
}

#[derive(Debug)]
struct Pending {
    slot: usize,
    buffer: Box<[u8]>,
    len: usize,
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    rx_codec: HeaderCodec,
    tx_codec: HeaderCodec,
    present: bool,
    refuse_allocation: bool,
    hold: bool,
    loopback: bool,
    record: bool,
    source: SimSource,
    phase: f64,
    rx_sequence: u8,
    inbound: VecDeque<Inbound>,
    pending_rx: VecDeque<Pending>,
    pending_tx: VecDeque<Pending>,
    completions: VecDeque<Completion>,
    sent: Vec<Vec<i32>>,
    sent_packets: usize,
    bad_transmits: usize,
}

impl SimState {
    fn new(config: SimConfig) -> Self {
        let rx_codec = HeaderCodec::new(
            sample::frame_bytes(config.input_channels),
            config.packet_frames,
        );
        let tx_codec = HeaderCodec::new(
            sample::frame_bytes(config.output_channels),
            config.packet_frames,
        );
        Self {
            sent: vec![Vec::new(); config.output_channels],
            config,
            rx_codec,
            tx_codec,
            present: true,
            refuse_allocation: false,
            hold: false,
            loopback: false,
            record: true,
            source: SimSource::Idle,
            phase: 0.0,
            rx_sequence: 0,
            inbound: VecDeque::new(),
            pending_rx: VecDeque::new(),
            pending_tx: VecDeque::new(),
            completions: VecDeque::new(),
            sent_packets: 0,
            bad_transmits: 0,
        }
    }

    /// Builds one input packet from interleaved samples.
    fn encode_input(&mut self, samples: &[i32], frames: usize) -> Vec<u8> {
        let channels = self.config.input_channels;
        let mut packet = vec![0_u8; self.rx_codec.packet_bytes()];
        let len = match self.rx_codec.encode(&mut packet, self.rx_sequence, frames) {
            Ok(len) => len,
            Err(e) => {
                warn!("sim input packet not encodable: {}", e);
                return Vec::new();
            }
        };
        self.rx_sequence = self.rx_sequence.wrapping_add(1);
        for (i, value) in samples.iter().take(frames * channels).enumerate() {
            let at = super::header::HEADER_LEN + i * SAMPLE_BYTES;
            sample::pack(*value, &mut packet[at..]);
        }
        packet.truncate(len);
        packet
    }

    fn generate_tone(&mut self) {
        let SimSource::Tone { hz } = self.source else {
            return;
        };
        let frames = self.config.packet_frames;
        let channels = self.config.input_channels;
        let step = std::f64::consts::TAU * f64::from(hz) / f64::from(self.config.sample_rate);
        let mut samples = Vec::with_capacity(frames * channels);
        for _ in 0..frames {
            let value = (self.phase.sin() * f64::from(SAMPLE_MAX) * 0.25) as i32;
            samples.extend(std::iter::repeat_n(value, channels));
            self.phase = (self.phase + step) % std::f64::consts::TAU;
        }
        let packet = self.encode_input(&samples, frames);
        self.inbound.push_back(Inbound::Packet(packet));
    }

    fn deliver(&mut self) -> bool {
        let mut delivered = false;
        while !self.pending_rx.is_empty() && !self.inbound.is_empty() {
            let (Some(mut pending), Some(inbound)) =
                (self.pending_rx.pop_front(), self.inbound.pop_front())
            else {
                break;
            };
            let (actual, status) = match inbound {
                Inbound::Packet(packet) => {
                    let n = packet.len().min(pending.len).min(pending.buffer.len());
                    pending.buffer[..n].copy_from_slice(&packet[..n]);
                    (n, TransferStatus::Completed)
                }
                Inbound::Error => (0, TransferStatus::Error),
            };
            self.completions.push_back(Completion {
                direction: Direction::Receive,
                slot: pending.slot,
                buffer: pending.buffer,
                actual,
                status,
            });
            delivered = true;
        }
        delivered
    }

    fn transmit_one(&mut self) -> bool {
        let Some(pending) = self.pending_tx.pop_front() else {
            return false;
        };
        let data = &pending.buffer[..pending.len.min(pending.buffer.len())];
        match self.tx_codec.decode(data) {
            Ok(decoded) => {
                let channels = self.config.output_channels;
                let payload = &data[decoded.payload_offset..];
                let mut frames_out = Vec::with_capacity(decoded.frames * channels);
                for f in 0..decoded.frames {
                    for ch in 0..channels {
                        let at = (f * channels + ch) * SAMPLE_BYTES;
                        frames_out.push(sample::unpack(&payload[at..]));
                    }
                }
                if self.record {
                    for (i, value) in frames_out.iter().enumerate() {
                        self.sent[i % channels].push(*value);
                    }
                }
                if self.loopback && decoded.frames > 0 {
                    let in_ch = self.config.input_channels;
                    let mut looped = vec![0_i32; decoded.frames * in_ch];
                    for f in 0..decoded.frames {
                        for ch in 0..in_ch.min(channels) {
                            looped[f * in_ch + ch] = frames_out[f * channels + ch];
                        }
                    }
                    let packet = self.encode_input(&looped, decoded.frames);
                    self.inbound.push_back(Inbound::Packet(packet));
                }
            }
            Err(e) => {
                debug!("sim device dropped transmit packet: {}", e);
                self.bad_transmits += 1;
            }
        }
        self.sent_packets += 1;
        self.completions.push_back(Completion {
            direction: Direction::Transmit,
            slot: pending.slot,
            actual: pending.len,
            buffer: pending.buffer,
            status: TransferStatus::Completed,
        });
        true
    }

    fn flush_pending(&mut self, status: TransferStatus) {
        for (direction, queue) in [
            (Direction::Receive, &mut self.pending_rx),
            (Direction::Transmit, &mut self.pending_tx),
        ] {
            for pending in queue.drain(..) {
                self.completions.push_back(Completion {
                    direction,
                    slot: pending.slot,
                    buffer: pending.buffer,
                    actual: 0,
                    status,
                });
            }
        }
    }
}

#[derive(Debug)]
struct SimShared {
    state: Mutex<SimState>,
    cvar: Condvar,
}

impl SimShared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimDevice {
    shared: Arc<SimShared>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimDevice {
    pub fn new(config: SimConfig) -> Self {
        Self {
            shared: Arc::new(SimShared {
                state: Mutex::new(SimState::new(config)),
                cvar: Condvar::new(),
            }),
        }
    }

    pub fn transport(&self) -> SimTransport {
        SimTransport {
            shared: self.shared.clone(),
        }
    }

    pub fn config(&self) -> SimConfig {
        self.shared.lock().config.clone()
    }

    /// Unplugging completes every outstanding transfer as disconnected.
    pub fn set_present(&self, present: bool) {
        let mut st = self.shared.lock();
        st.present = present;
        if !present {
            st.flush_pending(TransferStatus::Disconnected);
            self.shared.cvar.notify_all();
        }
    }

    /// Makes `probe` fail as if the interface could not be claimed.
    pub fn set_refuse_allocation(&self, refuse: bool) {
        self.shared.lock().refuse_allocation = refuse;
    }

    /// While held, the device ignores cancellation and keeps every
    /// submitted transfer.
    pub fn set_hold(&self, hold: bool) {
        self.shared.lock().hold = hold;
    }

    pub fn set_loopback(&self, loopback: bool) {
        self.shared.lock().loopback = loopback;
    }

    pub fn set_recording(&self, record: bool) {
        self.shared.lock().record = record;
    }

    pub fn set_source(&self, source: SimSource) {
        self.shared.lock().source = source;
    }

    /// Queues interleaved input samples, split into nominal sized packets.
    pub fn push_input(&self, samples: &[i32]) {
        let mut st = self.shared.lock();
        let channels = st.config.input_channels.max(1);
        let per_packet = st.config.packet_frames.max(1) * channels;
        for chunk in samples.chunks(per_packet) {
            let frames = chunk.len() / channels;
            let packet = st.encode_input(chunk, frames);
            st.inbound.push_back(Inbound::Packet(packet));
        }
        if st.deliver() {
            self.shared.cvar.notify_all();
        }
    }

    /// Queues raw bytes as the next captured packet, header included.
    pub fn push_raw(&self, packet: Vec<u8>) {
        let mut st = self.shared.lock();
        st.inbound.push_back(Inbound::Packet(packet));
        if st.deliver() {
            self.shared.cvar.notify_all();
        }
    }

    /// The next receive transfer completes with a bus error.
    pub fn push_error(&self) {
        let mut st = self.shared.lock();
        st.inbound.push_back(Inbound::Error);
        if st.deliver() {
            self.shared.cvar.notify_all();
        }
    }

    /// Sends up to `n` queued transmit packets out on the bus.
    pub fn release_transmits(&self, n: usize) -> usize {
        let mut st = self.shared.lock();
        let mut released = 0;
        while released < n && st.transmit_one() {
            released += 1;
        }
        st.deliver();
        if released > 0 {
            self.shared.cvar.notify_all();
        }
        released
    }

    /// One bus interval: one packet out, one packet in.
    pub fn clock_packet(&self) {
        let mut st = self.shared.lock();
        if !st.present {
            return;
        }
        let sent = st.transmit_one();
        if st.inbound.is_empty() {
            st.generate_tone();
        }
        if st.deliver() || sent {
            self.shared.cvar.notify_all();
        }
    }

    pub fn pending_transmits(&self) -> usize {
        self.shared.lock().pending_tx.len()
    }

    pub fn pending_receives(&self) -> usize {
        self.shared.lock().pending_rx.len()
    }

    pub fn wait_pending_transmits(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pending_transmits() >= n {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    pub fn sent_channel(&self, channel: usize) -> Vec<i32> {
        self.shared
            .lock()
            .sent
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    pub fn sent_packets(&self) -> usize {
        self.shared.lock().sent_packets
    }

    pub fn bad_transmits(&self) -> usize {
        self.shared.lock().bad_transmits
    }

    /// Spawns a thread that clocks the bus at the configured packet rate.
    pub fn start_clock(&self) -> Result<SimClock> {
        let cfg = self.config();
        let interval = Duration::from_nanos(
            cfg.packet_frames as u64 * 1_000_000_000 / u64::from(cfg.sample_rate.max(1)),
        );
        let stop = Arc::new(AtomicBool::new(false));
        let device = self.clone();
        let flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("sim-bus-clock".to_string())
            .spawn(move || {
                let mut next = Instant::now();
                while !flag.load(Ordering::Acquire) {
                    device.clock_packet();
                    next += interval;
                    let now = Instant::now();
                    if next > now {
                        std::thread::sleep(next - now);
                    } else {
                        next = now;
                    }
                }
            })
            .map_err(|e| BridgeError::DeviceUnavailable(e.to_string()))?;
        Ok(SimClock {
            stop,
            handle: Some(handle),
        })
    }
}

/// Stops the bus clock thread when dropped.
#[derive(Debug)]
pub struct SimClock {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for SimClock {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug)]
pub struct SimTransport {
    shared: Arc<SimShared>,
}

impl Transport for SimTransport {
    fn probe(&mut self) -> Result<DeviceInfo> {
        let st = self.shared.lock();
        if st.refuse_allocation {
            return Err(BridgeError::DeviceUnavailable(
                "cannot allocate transfer resources".to_string(),
            ));
        }
        if !st.present {
            return Err(BridgeError::DeviceUnavailable(format!(
                "{} not found",
                st.config.name
            )));
        }
        Ok(DeviceInfo {
            name: st.config.name.clone(),
            sample_rate: st.config.sample_rate,
            max_input_channels: st.config.input_channels,
            max_output_channels: st.config.output_channels,
        })
    }

    fn is_present(&self) -> bool {
        self.shared.lock().present
    }

    fn submit(
        &mut self,
        direction: Direction,
        slot: usize,
        buffer: Box<[u8]>,
        len: usize,
    ) -> std::result::Result<(), Rejected> {
        let mut st = self.shared.lock();
        if !st.present {
            return Err(Rejected {
                buffer,
                error: BridgeError::NotPresent,
            });
        }
        let pending = Pending { slot, buffer, len };
        match direction {
            Direction::Receive => {
                st.pending_rx.push_back(pending);
                if st.deliver() {
                    self.shared.cvar.notify_all();
                }
            }
            Direction::Transmit => st.pending_tx.push_back(pending),
        }
        Ok(())
    }

    fn wait_completion(&mut self, timeout: Duration) -> Option<Completion> {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.lock();
        loop {
            if let Some(c) = st.completions.pop_front() {
                return Some(c);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            st = match self.shared.cvar.wait_timeout(st, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn cancel_all(&mut self) {
        let mut st = self.shared.lock();
        if st.hold {
            return;
        }
        st.flush_pending(TransferStatus::Cancelled);
        self.shared.cvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SimDevice {
        SimDevice::new(SimConfig {
            input_channels: 2,
            output_channels: 2,
            packet_frames: 4,
            ..SimConfig::default()
        })
    }

    fn buffer(len: usize) -> Box<[u8]> {
        vec![0_u8; len].into_boxed_slice()
    }

    #[test]
    fn injected_input_completes_pending_receives_in_order() {
        let dev = small();
        let mut t = dev.transport();
        t.submit(Direction::Receive, 0, buffer(64), 64).unwrap();
        t.submit(Direction::Receive, 1, buffer(64), 64).unwrap();
        dev.push_input(&(0..16).collect::<Vec<i32>>());

        let first = t.wait_completion(Duration::from_millis(10)).unwrap();
        assert_eq!(first.slot, 0);
        assert_eq!(first.status, TransferStatus::Completed);
        assert_eq!(first.actual, 4 + 4 * 6);
        assert_eq!(sample::unpack(&first.buffer[4 + 3..]), 1);
        let second = t.wait_completion(Duration::from_millis(10)).unwrap();
        assert_eq!(second.slot, 1);
        assert_eq!(second.buffer[1], 1);
    }

    #[test]
    fn unplug_returns_everything_as_disconnected() {
        let dev = small();
        let mut t = dev.transport();
        t.submit(Direction::Receive, 0, buffer(8), 8).unwrap();
        t.submit(Direction::Transmit, 0, buffer(8), 8).unwrap();
        dev.set_present(false);
        assert!(!t.is_present());
        for _ in 0..2 {
            let c = t.wait_completion(Duration::from_millis(10)).unwrap();
            assert_eq!(c.status, TransferStatus::Disconnected);
        }
        assert!(t.submit(Direction::Receive, 1, buffer(8), 8).is_err());
        assert!(matches!(t.probe(), Err(BridgeError::DeviceUnavailable(_))));
    }

    #[test]
    fn held_device_ignores_cancel() {
        let dev = small();
        let mut t = dev.transport();
        t.submit(Direction::Transmit, 0, buffer(8), 8).unwrap();
        dev.set_hold(true);
        t.cancel_all();
        assert!(t.wait_completion(Duration::from_millis(5)).is_none());
        dev.set_hold(false);
        t.cancel_all();
        let c = t.wait_completion(Duration::from_millis(5)).unwrap();
        assert_eq!(c.status, TransferStatus::Cancelled);
    }

    #[test]
    fn transmitted_frames_are_recorded_and_looped_back() {
        let dev = small();
        dev.set_loopback(true);
        let mut t = dev.transport();
        let codec = HeaderCodec::new(6, 4);
        let mut packet = buffer(codec.packet_bytes());
        let len = codec.encode(&mut packet, 0, 2).unwrap();
        for (i, v) in [5, -5, 6, -6].iter().enumerate() {
            sample::pack(*v, &mut packet[4 + i * 3..]);
        }
        t.submit(Direction::Transmit, 0, packet, len).unwrap();
        assert_eq!(dev.release_transmits(4), 1);
        assert_eq!(dev.sent_channel(0), vec![5, 6]);
        assert_eq!(dev.sent_channel(1), vec![-5, -6]);

        t.submit(Direction::Receive, 0, buffer(64), 64).unwrap();
        let tx = t.wait_completion(Duration::from_millis(5)).unwrap();
        assert_eq!(tx.direction, Direction::Transmit);
        let rx = t.wait_completion(Duration::from_millis(5)).unwrap();
        assert_eq!(rx.direction, Direction::Receive);
        assert_eq!(sample::unpack(&rx.buffer[4 + 3..]), -5);
    }
}
