use tokio::sync::mpsc::Sender;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Device-level notifications delivered to the host asynchronously.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// The host should stop, close and reopen the driver.
    ResetRequest,
    DeviceStopped { error: bool },
    SampleRateChanged(u32),
}

/// Non-blocking handle on the host's notification channel. Safe to use from
/// the worker thread: a full or closed channel drops the message.
#[derive(Clone, Debug, Default)]
pub struct Notifier {
    tx: Option<Sender<Message>>,
}

impl Notifier {
    pub fn new(tx: Sender<Message>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, message: Message) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(m)) => warn!("notification channel full, dropping {:?}", m),
            Err(TrySendError::Closed(m)) => debug!("notification channel closed, dropping {:?}", m),
        }
    }
}
