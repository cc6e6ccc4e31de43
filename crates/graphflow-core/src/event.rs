use tokio::sync::broadcast;

use crate::types::FlowEvent;

/// Default number of events a slow subscriber may lag behind.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Broadcast bus for run events.
///
/// Every subscriber sees every event published after it subscribed.
/// Subscribers that fall more than `capacity` events behind lose the
/// oldest ones (`RecvError::Lagged`).
pub struct EventBus {
    tx: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; returns how many subscribers received it.
    pub fn publish(&self, event: FlowEvent) -> usize {
        // No receivers is not an error
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
