//! In-process `EventBus` implementation. Models at-least-once delivery,
//! bounded exponential backoff retry, and a dead-letter sink — the shape a
//! real broker client would have behind the same trait — grounded in the
//! retry/dead-letter bookkeeping of `jwilger-caxton`'s `message_router`.

use super::{Delivery, Event, EventBus, EventEnvelope};
use crate::error::AppError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

struct Topic {
    tx: mpsc::Sender<Delivery>,
    rx: Arc<Mutex<mpsc::Receiver<Delivery>>>,
}

pub struct InMemoryEventBus {
    topics: DashMap<String, Topic>,
    dead_letters: Arc<Mutex<Vec<EventEnvelope>>>,
    max_attempts: u32,
    base_backoff: Duration,
    capacity: usize,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_retry_policy(5, Duration::from_millis(100), 1024)
    }

    pub fn with_retry_policy(max_attempts: u32, base_backoff: Duration, capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            dead_letters: Arc::new(Mutex::new(Vec::new())),
            max_attempts,
            base_backoff,
            capacity,
        }
    }

    fn topic_sender(&self, event_type: &str) -> mpsc::Sender<Delivery> {
        self.topics
            .entry(event_type.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.capacity);
                Topic {
                    tx,
                    rx: Arc::new(Mutex::new(rx)),
                }
            })
            .tx
            .clone()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: Event) -> Result<(), AppError> {
        let envelope = EventEnvelope::new(&event);
        let sender = self.topic_sender(&envelope.event_type);
        let delivery = Delivery {
            envelope,
            requeue: sender.clone(),
            dead_letters: self.dead_letters.clone(),
            attempt: 1,
            max_attempts: self.max_attempts,
            base_backoff: self.base_backoff,
        };
        // "Producers receive confirmation only after the bus has durably
        // stored the envelope" (spec.md §4.3) — here, once it is queued;
        // retry/DLQ bookkeeping then lives on the `Delivery` itself and
        // runs independently of this call.
        sender
            .send(delivery)
            .await
            .map_err(|e| AppError::Transient(format!("event bus channel closed: {e}")))
    }

    fn subscribe(&self, event_type: &str) -> Arc<Mutex<mpsc::Receiver<Delivery>>> {
        // Ensure the topic exists so subscribing before any publish still
        // observes later deliveries.
        self.topic_sender(event_type);
        self.topics.get(event_type).expect("topic just created").rx.clone()
    }

    async fn dead_letters(&self) -> Vec<EventEnvelope> {
        self.dead_letters.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageSent;
    use chrono::Utc;

    fn sample_event() -> Event {
        Event::MessageSent(MessageSent {
            conversation_id: "c1".to_string(),
            message_id: "m1".to_string(),
            user_id: "u1".to_string(),
            content: "hi".to_string(),
            role: "User".to_string(),
            sent_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn delivers_and_acks() {
        let bus = InMemoryEventBus::new();
        let rx = bus.subscribe("MessageSent");
        bus.publish(sample_event()).await.unwrap();

        let delivery = rx.lock().await.recv().await.unwrap();
        assert_eq!(delivery.envelope.event_type, "MessageSent");
        delivery.ack();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(bus.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn nack_retries_then_dead_letters() {
        let bus = InMemoryEventBus::with_retry_policy(2, Duration::from_millis(5), 16);
        let rx = bus.subscribe("MessageSent");
        bus.publish(sample_event()).await.unwrap();

        let first = rx.lock().await.recv().await.unwrap();
        first.nack().await;

        let second = rx.lock().await.recv().await.unwrap();
        second.nack().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.dead_letters().await.len(), 1);
    }
}
