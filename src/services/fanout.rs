use serde::Serialize;
use tokio::sync::broadcast;

use crate::services::alerts::{Alert, AlertEvent};
use crate::services::evaluator::EvaluatedReading;

/// Envelope pushed to every live dashboard subscriber.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum StreamEvent {
    SensorData(EvaluatedReading),
    AlertCreated(Alert),
    AlertUpdated(Alert),
    AlertResolved(Alert),
    InitialSnapshot(Vec<EvaluatedReading>),
}

impl From<AlertEvent> for StreamEvent {
    fn from(event: AlertEvent) -> Self {
        match event {
            AlertEvent::Created(alert) => Self::AlertCreated(alert),
            AlertEvent::Updated(alert) => Self::AlertUpdated(alert),
            AlertEvent::Resolved(alert) => Self::AlertResolved(alert),
        }
    }
}

/// Broadcast hub for live dashboard sessions. Holds no undelivered-message
/// queue beyond the channel's fixed capacity: a subscriber that falls
/// behind observes `Lagged` and simply misses frames.
#[derive(Debug)]
pub struct RealtimeFanout {
    tx: broadcast::Sender<StreamEvent>,
}

impl RealtimeFanout {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    /// Sends to all currently-connected subscribers. Returns how many
    /// receivers the event reached; zero subscribers is not an error.
    pub fn broadcast(&self, event: StreamEvent) -> usize {
        match self.tx.send(event) {
            Ok(delivered) => delivered,
            Err(_) => 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
