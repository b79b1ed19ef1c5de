use crate::error::{BridgeError, Result};
use crate::hw::usb::transfer::Direction;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub sample_rate: u32,
    pub max_input_channels: usize,
    pub max_output_channels: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    Cancelled,
    Disconnected,
}

/// A finished transfer. The buffer handed over at submission comes back
/// here, whatever the status.
#[derive(Debug)]
pub struct Completion {
    pub direction: Direction,
    pub slot: usize,
    pub buffer: Box<[u8]>,
    pub actual: usize,
    pub status: TransferStatus,
}

/// A submission the transport refused; the buffer is returned untouched.
#[derive(Debug)]
pub struct Rejected {
    pub buffer: Box<[u8]>,
    pub error: BridgeError,
}

/// Raw isochronous access to the device. The engine's worker thread is the
/// only caller once streaming starts.
pub trait Transport: Send {
    /// Queries the device. Only called from `Open`.
    fn probe(&mut self) -> Result<DeviceInfo>;
    fn is_present(&self) -> bool;
    fn submit(
        &mut self,
        direction: Direction,
        slot: usize,
        buffer: Box<[u8]>,
        len: usize,
    ) -> std::result::Result<(), Rejected>;
    /// Blocks for at most `timeout` waiting for the next completion.
    fn wait_completion(&mut self, timeout: Duration) -> Option<Completion>;
    /// Asks the device to finish every outstanding transfer. Cancelled
    /// transfers still come back through `wait_completion`.
    fn cancel_all(&mut self);
}

pub trait MidiTransport: Send {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);
}
