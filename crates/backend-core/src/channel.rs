use tokio::sync::broadcast;

use crate::types::SyncEvent;

/// Broadcast event stream handed to UI subscribers. Dropping it unsubscribes.
pub type EventStream = broadcast::Receiver<SyncEvent>;

/// Push-style notification bus shared by the sync runtime.
#[derive(Clone, Debug)]
pub struct SyncEventBus {
    event_tx: broadcast::Sender<SyncEvent>,
}

impl SyncEventBus {
    pub fn new(event_buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to emitted events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Default for SyncEventBus {
    fn default() -> Self {
        Self::new(512)
    }
}
