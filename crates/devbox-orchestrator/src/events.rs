use devbox_common::{LiveEvent, Severity};
use tokio::sync::broadcast;
use tracing::debug;

pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Fan-out of [`LiveEvent`]s to every live observer.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LiveEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.tx.subscribe()
    }

    /// Number of observers the event reached. Zero observers is not an error.
    pub fn publish(&self, event: LiveEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                debug!("No observers for live event");
                0
            }
        }
    }

    pub fn notify(&self, message: impl Into<String>, severity: Severity) -> usize {
        self.publish(LiveEvent::notification(message, severity))
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
