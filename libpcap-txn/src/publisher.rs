use crate::event::TransactionEvent;
use crossbeam_channel::Sender;
use tracing::debug;

/// Destination of transaction events
pub trait Publisher: Send + Sync {
    fn publish(&self, event: TransactionEvent);
}

impl Publisher for Sender<TransactionEvent> {
    fn publish(&self, event: TransactionEvent) {
        if self.send(event).is_err() {
            debug!("publisher: receiver disconnected, dropping event");
        }
    }
}

/// Publisher discarding all events
#[derive(Clone, Copy, Debug, Default)]
pub struct NullPublisher;

impl Publisher for NullPublisher {
    fn publish(&self, _event: TransactionEvent) {}
}
