use thiserror::Error;

/// Failures surfaced by the bridge.
///
/// Per-packet and per-period conditions (`MalformedHeader`, `Overrun`,
/// `Underrun`) are absorbed inside the worker loop and only show up in the
/// engine counters. The header codec returns `MalformedHeader`, the stage
/// pipeline returns `Overrun` from a full fill region and `Underrun` from a
/// dry drain region.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("device not present")]
    NotPresent,
    #[error("malformed packet header: {0}")]
    MalformedHeader(&'static str),
    #[error("fill region overrun")]
    Overrun,
    #[error("drain region underrun")]
    Underrun,
    #[error("engine already stopped")]
    AlreadyStopped,
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("hardware malfunction: {0}")]
    HardwareMalfunction(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("sample rate {0} not supported")]
    NoClock(u32),
    #[error("settings: {0}")]
    Settings(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
