//! The driver object the host talks to.
//!
//! `Bridge` owns the device transport while closed, the streaming core while
//! opened, and the worker thread while running. Queries return values cached
//! at `open`; the device is only probed there.

use crate::error::{BridgeError, Result};
use crate::hw::gate::{BufferSwitchGate, HostDoubleBuffer, HostLayout, SamplePosition};
use crate::hw::latency::{self, Latencies};
use crate::hw::options::HwOptions;
use crate::hw::status::{DeviceStatus, EngineCounters, EngineShared};
use crate::hw::traits::{DeviceInfo, MidiTransport, Transport};
use crate::hw::usb::isoch::IsoCore;
use crate::hw_worker::IsoWorker;
use crate::message::{Message, Notifier};
use crate::settings::Settings;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const DRIVER_NAME: &str = "isobridge";
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BridgeState {
    Closed,
    Opened,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferSize {
    pub min: usize,
    pub max: usize,
    pub preferred: usize,
    pub granularity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SampleType {
    Int24Lsb,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub channel: usize,
    pub is_input: bool,
    pub is_active: bool,
    pub group: usize,
    pub sample_type: SampleType,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClockSource {
    pub index: usize,
    pub name: String,
    pub is_current: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRequest {
    pub is_input: bool,
    pub channel: usize,
}

impl ChannelRequest {
    pub fn input(channel: usize) -> Self {
        Self {
            is_input: true,
            channel,
        }
    }

    pub fn output(channel: usize) -> Self {
        Self {
            is_input: false,
            channel,
        }
    }
}

pub struct Bridge {
    options: HwOptions,
    notifier: Notifier,
    transport: Option<Box<dyn Transport>>,
    midi: Option<Box<dyn MidiTransport>>,
    midi_open: bool,
    state: BridgeState,
    device: Option<DeviceInfo>,
    input_channels: usize,
    output_channels: usize,
    period_frames: usize,
    fifo_frames: usize,
    shared: Arc<EngineShared>,
    core: Option<IsoCore>,
    worker: Option<IsoWorker>,
    gate: Option<Arc<BufferSwitchGate>>,
    active_inputs: Vec<usize>,
    active_outputs: Vec<usize>,
    malfunction: bool,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("state", &self.state)
            .field("device", &self.device)
            .field("input_channels", &self.input_channels)
            .field("output_channels", &self.output_channels)
            .field("malfunction", &self.malfunction)
            .finish()
    }
}

impl Bridge {
    pub fn new(transport: Box<dyn Transport>, options: HwOptions, notifier: Notifier) -> Self {
        Self {
            options,
            notifier,
            transport: Some(transport),
            midi: None,
            midi_open: false,
            state: BridgeState::Closed,
            device: None,
            input_channels: 0,
            output_channels: 0,
            period_frames: options.period_frames,
            fifo_frames: options.fifo_frames,
            shared: Arc::new(EngineShared::new(false)),
            core: None,
            worker: None,
            gate: None,
            active_inputs: Vec::new(),
            active_outputs: Vec::new(),
            malfunction: false,
        }
    }

    pub fn with_midi(mut self, midi: Box<dyn MidiTransport>) -> Self {
        self.midi = Some(midi);
        self
    }

    pub fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    pub fn driver_version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn options(&self) -> &HwOptions {
        &self.options
    }

    /// Only while closed; the next `open` picks the new options up.
    pub fn set_options(&mut self, options: HwOptions) -> Result<()> {
        if self.state != BridgeState::Closed {
            return Err(BridgeError::InvalidState("options can only change while closed"));
        }
        self.options = options;
        Ok(())
    }

    /// Takes reloaded settings. While a device is open the new values only
    /// apply after the host resets the driver, so a reset is requested.
    /// Returns false when nothing changed.
    pub fn apply_settings(&mut self, settings: &Settings) -> bool {
        let next = HwOptions {
            input_channels: settings.input_channels(),
            output_channels: settings.output_channels(),
            period_frames: settings.period_frames(),
            fifo_frames: settings.fifo_frames(),
            ..self.options
        };
        let cur = &self.options;
        if (cur.input_channels, cur.output_channels, cur.period_frames, cur.fifo_frames)
            == (
                next.input_channels,
                next.output_channels,
                next.period_frames,
                next.fifo_frames,
            )
        {
            return false;
        }
        self.options = next;
        if self.state != BridgeState::Closed {
            info!("settings changed while open, requesting reset");
            self.notifier.send(Message::ResetRequest);
        }
        true
    }

    /// Reported by whatever watches the device clock. A rate other than the
    /// one negotiated at open asks the host to reset.
    pub fn device_sample_rate_changed(&mut self, rate: u32) -> bool {
        let Some(info) = self.device.as_ref() else {
            return false;
        };
        if info.sample_rate == rate {
            return false;
        }
        info!("device clock moved from {} to {} Hz", info.sample_rate, rate);
        self.notifier.send(Message::SampleRateChanged(rate));
        self.notifier.send(Message::ResetRequest);
        true
    }

    pub fn open(&mut self) -> Result<()> {
        if self.state != BridgeState::Closed {
            return Err(BridgeError::InvalidState("already open"));
        }
        let mut transport = self.transport.take().ok_or_else(|| {
            BridgeError::DeviceUnavailable("transport lost by a previous session".to_string())
        })?;
        let info = match transport.probe() {
            Ok(info) => info,
            Err(e) => {
                self.transport = Some(transport);
                return Err(match e {
                    BridgeError::DeviceUnavailable(_) => e,
                    other => BridgeError::DeviceUnavailable(other.to_string()),
                });
            }
        };

        let mut options = self.options;
        if options.input_channels > info.max_input_channels {
            warn!(
                "{} inputs requested, {} offers {}",
                options.input_channels, info.name, info.max_input_channels
            );
            options.input_channels = info.max_input_channels;
        }
        if options.output_channels > info.max_output_channels {
            warn!(
                "{} outputs requested, {} offers {}",
                options.output_channels, info.name, info.max_output_channels
            );
            options.output_channels = info.max_output_channels;
        }

        let shared = Arc::new(EngineShared::new(true));
        let mut core = IsoCore::new(
            transport,
            &options,
            info.sample_rate,
            shared.clone(),
            self.notifier.clone(),
        );
        if let Err(e) = core.open() {
            core.shutdown();
            self.transport = Some(core.into_transport());
            return Err(e);
        }

        self.gate = Some(Arc::new(BufferSwitchGate::new(
            core.exchange(),
            options.period_frames,
            options.input_channels,
            options.output_channels,
            shared.clone(),
        )));
        if let Some(midi) = self.midi.as_mut() {
            match midi.open() {
                Ok(()) => self.midi_open = true,
                Err(e) => warn!("MIDI transport not opened: {}", e),
            }
        }
        info!(
            "opened {} at {} Hz, {} in / {} out, period {}",
            info.name,
            info.sample_rate,
            options.input_channels,
            options.output_channels,
            options.period_frames
        );
        self.input_channels = options.input_channels;
        self.output_channels = options.output_channels;
        self.period_frames = options.period_frames;
        self.fifo_frames = options.fifo_frames;
        self.device = Some(info);
        self.shared = shared;
        self.core = Some(core);
        self.malfunction = false;
        self.state = BridgeState::Opened;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        match self.state {
            BridgeState::Closed => return Err(BridgeError::InvalidState("not open")),
            BridgeState::Running => return Err(BridgeError::InvalidState("already running")),
            BridgeState::Opened => {}
        }
        self.reap_worker()?;
        if self.malfunction {
            return Err(BridgeError::HardwareMalfunction(
                "device did not stop cleanly; close and reopen".to_string(),
            ));
        }
        let mut core = self
            .core
            .take()
            .ok_or(BridgeError::InvalidState("engine core missing"))?;
        if let Err(e) = core.start() {
            self.core = Some(core);
            if e == BridgeError::NotPresent {
                self.shared.set_present(false);
            }
            return Err(e);
        }
        if let Some(gate) = &self.gate {
            gate.reset_position();
        }
        self.worker = Some(IsoWorker::spawn(core)?);
        self.state = BridgeState::Running;
        debug!("streaming started");
        Ok(())
    }

    pub fn stop(&mut self, wait: bool) -> Result<()> {
        match self.state {
            BridgeState::Closed => return Err(BridgeError::InvalidState("not open")),
            BridgeState::Opened => return Err(BridgeError::AlreadyStopped),
            BridgeState::Running => {}
        }
        self.state = BridgeState::Opened;
        let worker = self
            .worker
            .take()
            .ok_or(BridgeError::InvalidState("worker missing"))?;
        if let Err(e) = worker.request_stop() {
            debug!("stop: {}", e);
        }
        if wait {
            self.finish_worker(worker)
        } else {
            self.worker = Some(worker);
            Ok(())
        }
    }

    /// Idempotent. Waits for a worker left behind by `stop(false)`.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            BridgeState::Closed => return Ok(()),
            BridgeState::Running => {
                return Err(BridgeError::InvalidState("stop before closing"));
            }
            BridgeState::Opened => {}
        }
        if let Err(e) = self.reap_worker() {
            warn!("close: {}", e);
        }
        if let Some(gate) = self.gate.take() {
            gate.deactivate();
        }
        if let Some(mut core) = self.core.take() {
            // Receives queued by open are still with the device if we never ran.
            if !core.malfunction() && core.in_flight() != (0, 0) && !core.shutdown() {
                warn!("close: transfers still with the device");
            }
            self.transport = Some(core.into_transport());
        }
        if self.midi_open {
            if let Some(midi) = self.midi.as_mut() {
                midi.close();
            }
            self.midi_open = false;
        }
        self.shared.set_present(false);
        self.active_inputs.clear();
        self.active_outputs.clear();
        self.device = None;
        self.state = BridgeState::Closed;
        info!("closed");
        Ok(())
    }

    fn reap_worker(&mut self) -> Result<()> {
        match self.worker.take() {
            Some(worker) => self.finish_worker(worker),
            None => Ok(()),
        }
    }

    fn finish_worker(&mut self, worker: IsoWorker) -> Result<()> {
        match worker.join() {
            Ok(core) => {
                let clean = !core.malfunction();
                self.core = Some(core);
                if clean {
                    Ok(())
                } else {
                    self.malfunction = true;
                    Err(BridgeError::HardwareMalfunction(
                        "transfers still pending after stop".to_string(),
                    ))
                }
            }
            Err(e) => {
                error!("worker lost: {}", e);
                self.malfunction = true;
                Err(e)
            }
        }
    }

    fn require_open(&self) -> Result<&DeviceInfo> {
        match (&self.state, &self.device) {
            (BridgeState::Closed, _) | (_, None) => Err(BridgeError::InvalidState("not open")),
            (_, Some(info)) => Ok(info),
        }
    }

    pub fn gate(&self) -> Option<Arc<BufferSwitchGate>> {
        self.gate.clone()
    }

    pub fn channels(&self) -> Result<(usize, usize)> {
        self.require_open()?;
        Ok((self.input_channels, self.output_channels))
    }

    pub fn latencies(&self) -> Result<Latencies> {
        self.require_open()?;
        Ok(latency::latencies(
            self.period_frames,
            self.fifo_frames,
        ))
    }

    pub fn buffer_size(&self) -> Result<BufferSize> {
        self.require_open()?;
        let period = self.period_frames;
        Ok(BufferSize {
            min: period,
            max: period,
            preferred: period,
            granularity: 0,
        })
    }

    pub fn sample_rate(&self) -> Result<u32> {
        Ok(self.require_open()?.sample_rate)
    }

    /// The rate the host would see; falls back to 48 kHz while closed.
    pub fn nominal_sample_rate(&self) -> u32 {
        self.device
            .as_ref()
            .map_or(DEFAULT_SAMPLE_RATE, |d| d.sample_rate)
    }

    pub fn can_sample_rate(&self, rate: u32) -> Result<()> {
        if self.require_open()?.sample_rate == rate {
            Ok(())
        } else {
            Err(BridgeError::NoClock(rate))
        }
    }

    pub fn set_sample_rate(&mut self, rate: u32) -> Result<()> {
        self.can_sample_rate(rate)
    }

    pub fn clock_sources(&self) -> Result<Vec<ClockSource>> {
        self.require_open()?;
        Ok(vec![ClockSource {
            index: 0,
            name: "Internal".to_string(),
            is_current: true,
        }])
    }

    pub fn set_clock_source(&mut self, index: usize) -> Result<()> {
        self.require_open()?;
        if index == 0 {
            Ok(())
        } else {
            Err(BridgeError::NotPresent)
        }
    }

    pub fn channel_info(&self, channel: usize, is_input: bool) -> Result<ChannelInfo> {
        let info = self.require_open()?;
        let (count, active, dir) = if is_input {
            (self.input_channels, &self.active_inputs, "In")
        } else {
            (self.output_channels, &self.active_outputs, "Out")
        };
        if channel >= count {
            return Err(BridgeError::InvalidParameter(format!(
                "{} channel {} out of range (0..{})",
                dir, channel, count
            )));
        }
        Ok(ChannelInfo {
            channel,
            is_input,
            is_active: active.contains(&channel),
            group: 0,
            sample_type: SampleType::Int24Lsb,
            name: format!("{} {} {}", info.name, dir, channel + 1),
        })
    }

    /// Builds the host's ping/pong buffers for the requested channels.
    /// Requests naming channels the device does not have are skipped.
    pub fn create_buffers(
        &mut self,
        requests: &[ChannelRequest],
        layout: HostLayout,
    ) -> Result<HostDoubleBuffer> {
        self.require_open()?;
        if self.state == BridgeState::Running {
            return Err(BridgeError::InvalidState("buffers cannot change while running"));
        }
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for req in requests {
            let (limit, map) = if req.is_input {
                (self.input_channels, &mut inputs)
            } else {
                (self.output_channels, &mut outputs)
            };
            if req.channel >= limit {
                warn!(
                    "skipping buffer for {} channel {}",
                    if req.is_input { "input" } else { "output" },
                    req.channel
                );
                continue;
            }
            map.push(req.channel);
        }
        if inputs.is_empty() && outputs.is_empty() {
            return Err(BridgeError::InvalidParameter(
                "no valid channels requested".to_string(),
            ));
        }
        self.active_inputs = inputs.clone();
        self.active_outputs = outputs.clone();
        Ok(HostDoubleBuffer::new(
            inputs,
            outputs,
            self.period_frames,
            layout,
        ))
    }

    pub fn dispose_buffers(&mut self) -> Result<()> {
        self.require_open()?;
        if self.state == BridgeState::Running {
            return Err(BridgeError::InvalidState("buffers cannot change while running"));
        }
        self.active_inputs.clear();
        self.active_outputs.clear();
        Ok(())
    }

    pub fn sample_position(&self) -> Result<SamplePosition> {
        self.require_open()?;
        Ok(self
            .gate
            .as_ref()
            .map(|g| g.sample_position())
            .unwrap_or_default())
    }

    pub fn counters(&self) -> EngineCounters {
        self.shared.counters.snapshot()
    }

    pub fn status(&self) -> DeviceStatus {
        let opened = self.state != BridgeState::Closed;
        DeviceStatus {
            present: opened && self.shared.present(),
            running: self.state == BridgeState::Running && self.shared.running(),
            sample_rate: self.nominal_sample_rate(),
            period_frames: if opened {
                self.period_frames
            } else {
                self.options.period_frames
            },
            input_channels: if opened { self.input_channels } else { 0 },
            output_channels: if opened { self.output_channels } else { 0 },
            counters: self.counters(),
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if self.state == BridgeState::Running {
            let _ = self.stop(true);
        }
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::usb::sim::{SimConfig, SimDevice};

    fn bridge() -> (SimDevice, Bridge) {
        let dev = SimDevice::new(SimConfig {
            name: "Test Box".to_string(),
            input_channels: 4,
            output_channels: 4,
            packet_frames: 16,
            ..SimConfig::default()
        });
        let options = HwOptions {
            input_channels: 4,
            output_channels: 6,
            ..HwOptions::default()
        };
        let bridge = Bridge::new(Box::new(dev.transport()), options, Notifier::disabled());
        (dev, bridge)
    }

    #[test]
    fn queries_need_an_open_device() {
        let (_dev, mut b) = bridge();
        assert!(matches!(b.channels(), Err(BridgeError::InvalidState(_))));
        assert_eq!(b.nominal_sample_rate(), DEFAULT_SAMPLE_RATE);
        b.open().unwrap();
        assert_eq!(b.channels().unwrap(), (4, 4));
        assert_eq!(b.sample_rate().unwrap(), 48_000);
        assert_eq!(b.latencies().unwrap().output, 128);
        assert_eq!(b.buffer_size().unwrap().preferred, 64);
        assert!(b.can_sample_rate(48_000).is_ok());
        assert_eq!(b.set_sample_rate(44_100), Err(BridgeError::NoClock(44_100)));
        assert_eq!(b.clock_sources().unwrap().len(), 1);
        assert!(b.set_clock_source(1).is_err());
        b.close().unwrap();
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let (_dev, mut b) = bridge();
        assert!(matches!(b.start(), Err(BridgeError::InvalidState(_))));
        assert!(matches!(b.stop(true), Err(BridgeError::InvalidState(_))));
        assert!(b.close().is_ok());
        b.open().unwrap();
        assert!(matches!(b.open(), Err(BridgeError::InvalidState(_))));
        b.start().unwrap();
        assert!(matches!(b.close(), Err(BridgeError::InvalidState(_))));
        b.stop(true).unwrap();
        assert_eq!(b.stop(true), Err(BridgeError::AlreadyStopped));
        assert_eq!(b.state(), BridgeState::Opened);
        b.close().unwrap();
        assert!(b.close().is_ok());
        assert_eq!(b.state(), BridgeState::Closed);
    }

    #[test]
    fn reloaded_settings_and_clock_changes_request_reset() {
        let dev = SimDevice::new(SimConfig::default());
        let (notifier, mut rx) = crate::init();
        let mut b = Bridge::new(Box::new(dev.transport()), HwOptions::default(), notifier);
        assert!(!b.device_sample_rate_changed(44_100));
        assert!(!b.apply_settings(&Settings::default()));

        let smaller = Settings::from_toml_str("NrIns = 0\nNrSamples = 128").unwrap();
        assert!(b.apply_settings(&smaller));
        assert!(rx.try_recv().is_err());

        b.open().unwrap();
        assert_eq!(b.channels().unwrap(), (2, 32));
        assert_eq!(b.buffer_size().unwrap().preferred, 128);
        assert!(!b.device_sample_rate_changed(48_000));
        assert!(b.device_sample_rate_changed(96_000));
        assert_eq!(rx.try_recv().unwrap(), Message::SampleRateChanged(96_000));
        assert_eq!(rx.try_recv().unwrap(), Message::ResetRequest);

        assert!(b.apply_settings(&Settings::default()));
        assert_eq!(rx.try_recv().unwrap(), Message::ResetRequest);
        // Still the negotiated values until the host reopens.
        assert_eq!(b.channels().unwrap(), (2, 32));
        b.close().unwrap();
    }

    #[test]
    fn absent_hardware_fails_open_and_keeps_transport() {
        let (dev, mut b) = bridge();
        dev.set_refuse_allocation(true);
        assert!(matches!(b.open(), Err(BridgeError::DeviceUnavailable(_))));
        assert_eq!(b.state(), BridgeState::Closed);
        dev.set_refuse_allocation(false);
        b.open().unwrap();
    }

    #[test]
    fn channel_info_and_buffer_maps() {
        let (_dev, mut b) = bridge();
        b.open().unwrap();
        let host = b
            .create_buffers(
                &[
                    ChannelRequest::input(1),
                    ChannelRequest::input(9),
                    ChannelRequest::output(0),
                ],
                HostLayout::Planar,
            )
            .unwrap();
        assert_eq!(host.input_map(), &[1]);
        assert_eq!(host.output_map(), &[0]);

        let info = b.channel_info(1, true).unwrap();
        assert_eq!(info.name, "Test Box In 2");
        assert!(info.is_active);
        assert_eq!(info.sample_type, SampleType::Int24Lsb);
        assert!(!b.channel_info(2, true).unwrap().is_active);
        assert!(matches!(
            b.channel_info(4, false),
            Err(BridgeError::InvalidParameter(_))
        ));
        b.dispose_buffers().unwrap();
        assert!(!b.channel_info(1, true).unwrap().is_active);
    }
}
