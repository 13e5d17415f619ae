/// Caller-facing callback interface

use tokio::sync::mpsc;
use tracing::error;

/// Receives session lifecycle and detection callbacks
///
/// Callbacks run on the session's notification thread, one at a time and in
/// the order the session produced them.
pub trait HotwordListener: Send + Sync {
    fn on_initializing(&self) {}

    fn on_initialized(&self) {}

    fn on_start_detect(&self) {}

    fn on_hotword_detect(&self, hotword_id: u32);
}

/// Callback as a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerEvent {
    Initializing,
    Initialized,
    StartDetect,
    HotwordDetect(u32),
}

impl ListenerEvent {
    /// Invoke the matching callback on `listener`
    pub fn deliver(self, listener: &dyn HotwordListener) {
        match self {
            Self::Initializing => listener.on_initializing(),
            Self::Initialized => listener.on_initialized(),
            Self::StartDetect => listener.on_start_detect(),
            Self::HotwordDetect(id) => listener.on_hotword_detect(id),
        }
    }
}

/// Forwards callbacks into a tokio channel for async consumers
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ListenerEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ListenerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ListenerEvent) {
        if let Err(e) = self.tx.send(event) {
            error!("Failed to forward {:?}: receiver dropped", e.0);
        }
    }
}

impl HotwordListener for ChannelListener {
    fn on_initializing(&self) {
        self.forward(ListenerEvent::Initializing);
    }

    fn on_initialized(&self) {
        self.forward(ListenerEvent::Initialized);
    }

    fn on_start_detect(&self) {
        self.forward(ListenerEvent::StartDetect);
    }

    fn on_hotword_detect(&self, hotword_id: u32) {
        self.forward(ListenerEvent::HotwordDetect(hotword_id));
    }
}
