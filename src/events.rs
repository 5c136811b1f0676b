//! Fan-out of state-change notifications to external subscribers.
//!
//! Grounded on the teacher's direct use of a `tokio::sync::broadcast::Sender<Event>`
//! field on `UsenetDownloader` (`event_tx`), wrapped here in a small named type
//! since the design calls the component out explicitly as a first-class
//! collaborator (`EventBus`) rather than an implementation detail of the facade.

use crate::types::Event;
use tokio::sync::broadcast;

/// Default channel capacity. Slow subscribers that fall this far behind the
/// publisher start missing events (`broadcast::error::RecvError::Lagged`)
/// rather than applying backpressure to the publisher — the same tradeoff
/// the teacher's unbounded-publish, drop-on-lag broadcast channel makes.
const DEFAULT_CAPACITY: usize = 256;

/// Topic-tagged fan-out of [`Event`]s.
///
/// Cheap to clone: cloning shares the same underlying channel, the same way
/// cloning a `broadcast::Sender` does.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Build a bus with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Build a bus with an explicit channel capacity, for callers that expect
    /// many subscribers or bursty publishing.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to every current subscriber. A publish with zero
    /// subscribers is not an error — it's the common case when no external
    /// collaborator has attached yet.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events. Events published before this call are not
    /// replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::QueueItemAdded {
            id: uuid::Uuid::nil(),
            file_name: "movie.nzb".into(),
        });
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, Event::QueueItemAdded { .. }));
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish(Event::QueueItemPriorityChanged {
            id: uuid::Uuid::nil(),
            priority: Priority::High,
        });
        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(Event::HistoryItemRemoved {
            id: uuid::Uuid::nil(),
        });
    }
}
