pub mod bridge;
pub mod config;
pub mod gate;
pub mod latency;
pub mod options;
pub mod status;
pub mod traits;
pub mod usb;
