pub mod error;
pub mod hw;
pub mod hw_worker;
pub mod message;
pub mod settings;

pub use error::{BridgeError, Result};
pub use hw::bridge::{Bridge, BridgeState, ChannelRequest};
pub use hw::gate::{
    BufferSwitchGate, ExchangeOutcome, HostDoubleBuffer, HostLayout, HostProcess, SwitchInfo,
};
pub use hw::options::HwOptions;
pub use message::{Message, Notifier};
pub use settings::Settings;

use tokio::sync::mpsc::{Receiver, channel};

/// Creates the notification channel the bridge reports device events on.
pub fn init() -> (Notifier, Receiver<Message>) {
    let (tx, rx) = channel::<Message>(32);
    (Notifier::new(tx), rx)
}
