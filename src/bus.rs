//! Process-wide notification bus

use serde_json::Value;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

const BUS_CAPACITY: usize = 64;

/// Code carried by every outage-started message
pub const OUTAGE_CODE: &str = "TELEMETRY_OUTAGE";

#[derive(Clone, Debug, PartialEq)]
pub struct OutageFault {
    pub code: &'static str,
    pub message: String,
}

impl fmt::Display for OutageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for OutageFault {}

#[derive(Clone, Debug, PartialEq)]
pub enum BusMessage {
    OutageStarted(OutageFault),
    OutageEnded,
    CredentialsChanged,
    Custom { name: String, data: Value },
}

impl BusMessage {
    pub fn name(&self) -> &str {
        match self {
            BusMessage::OutageStarted(_) => "outageStarted",
            BusMessage::OutageEnded => "outageEnded",
            BusMessage::CredentialsChanged => "credentialsChanged",
            BusMessage::Custom { name, .. } => name,
        }
    }
}

/// Publish/subscribe channel shared by the pipeline components.
///
/// Cloning yields another handle onto the same channel.
#[derive(Clone, Debug)]
pub struct NotificationBus {
    sender: broadcast::Sender<BusMessage>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, message: BusMessage) {
        let name = message.name().to_string();
        match self.sender.send(message) {
            Ok(receivers) => debug!("Published {} to {} subscribers", name, receivers),
            Err(_) => debug!("Published {} with no subscribers", name),
        }
    }
}
