//! In-process event bus.
//!
//! A broadcast channel carrying [`EventEnvelope`]s. Publishers hand over
//! envelopes already stamped with their per-execution sequence (the outbox
//! lives on the aggregate); the bus only fans out. Sinks subscribe and run
//! as independent tasks.

use tokio::sync::broadcast;

use crate::domain::models::EventEnvelope;

/// Configuration for the event bus.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Channel capacity for the broadcast channel.
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { channel_capacity: 1024 }
    }
}

/// Central bus broadcasting engine events to sinks.
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity);
        Self { sender }
    }

    /// Publish an envelope. Send errors (no subscribers) are ignored.
    pub fn publish(&self, envelope: EventEnvelope) {
        let _ = self.sender.send(envelope);
    }

    /// Publish a batch in order.
    pub fn publish_all(&self, envelopes: Vec<EventEnvelope>) {
        for envelope in envelopes {
            self.publish(envelope);
        }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{EventEnvelope, ExecutionEvent, TriggeredBy};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_publish_preserves_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let execution_id = Uuid::new_v4();

        bus.publish_all(vec![
            EventEnvelope::new(
                execution_id,
                1,
                ExecutionEvent::ProcessStarted {
                    process_id: Uuid::new_v4(),
                    process_name: "p".into(),
                    triggered_by: TriggeredBy::manual("alice"),
                },
            ),
            EventEnvelope::new(
                execution_id,
                2,
                ExecutionEvent::StepStarted { step_id: "a".into() },
            ),
        ]);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert!(first.sequence < second.sequence);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(EventEnvelope::new(
            Uuid::new_v4(),
            1,
            ExecutionEvent::StepStarted { step_id: "a".into() },
        ));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
