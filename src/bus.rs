//! At-least-once, durable-enough transport between the gateway and the
//! orchestration worker (spec.md §4.3).

mod inmemory;

pub use inmemory::InMemoryEventBus;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping every event on the bus (spec.md §3, §6 wire format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub correlation_id: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(event: &Event) -> Self {
        Self {
            event_type: event.type_name().to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            occurred_at: Utc::now(),
            payload: event.to_payload(),
        }
    }
}

/// Published by the gateway when a user turn is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSent {
    pub conversation_id: String,
    pub message_id: String,
    pub user_id: String,
    pub content: String,
    pub role: String,
    pub sent_at: DateTime<Utc>,
}

/// Published by the orchestrator once the LLM reply is ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub conversation_id: String,
    pub message_id: String,
    pub content: String,
    pub tokens_used: u64,
    pub model_name: String,
    pub produced_at: DateTime<Utc>,
    #[serde(default)]
    pub is_error: bool,
}

/// Sibling-flow events from the longer-running strategy pipelines. The core
/// only needs to be able to carry them on the same bus; it never consumes
/// or produces them itself (spec.md §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildFailed {
    pub task_id: String,
    pub reason: String,
}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixAttempted {
    pub task_id: String,
    pub attempt: u32,
}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixSucceeded {
    pub task_id: String,
}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleted {
    pub task_id: String,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub enum Event {
    MessageSent(MessageSent),
    AgentResponse(AgentResponse),
    BuildFailed(BuildFailed),
    FixAttempted(FixAttempted),
    FixSucceeded(FixSucceeded),
    TaskCompleted(TaskCompleted),
}

impl Event {
    fn type_name(&self) -> &'static str {
        match self {
            Event::MessageSent(_) => "MessageSent",
            Event::AgentResponse(_) => "AgentResponse",
            Event::BuildFailed(_) => "BuildFailed",
            Event::FixAttempted(_) => "FixAttempted",
            Event::FixSucceeded(_) => "FixSucceeded",
            Event::TaskCompleted(_) => "TaskCompleted",
        }
    }

    fn to_payload(&self) -> serde_json::Value {
        match self {
            Event::MessageSent(e) => serde_json::to_value(e),
            Event::AgentResponse(e) => serde_json::to_value(e),
            Event::BuildFailed(e) => serde_json::to_value(e),
            Event::FixAttempted(e) => serde_json::to_value(e),
            Event::FixSucceeded(e) => serde_json::to_value(e),
            Event::TaskCompleted(e) => serde_json::to_value(e),
        }
        .unwrap_or(serde_json::Value::Null)
    }
}

/// Reliable at-least-once message transport.
///
/// Producers receive confirmation only after the bus has durably stored the
/// envelope. Consumers acknowledge after successful processing; on failure
/// the bus retries with bounded, increasing backoff, and moves the envelope
/// to the dead-letter sink on exhaustion.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Event) -> Result<(), crate::error::AppError>;

    /// Subscribe to envelopes of the given type name. The returned receiver
    /// is shared (`Arc<Mutex<..>>`) so a pool of competing consumer tasks
    /// can each pull from it — each envelope is processed by exactly one
    /// worker, but possibly redelivered (spec.md §5 "Bus consumers are
    /// competing"). Consumers are expected to be idempotent with respect to
    /// `messageId`, since duplicates are expected (spec.md §4.3).
    fn subscribe(&self, event_type: &str) -> std::sync::Arc<tokio::sync::Mutex<tokio::sync::mpsc::Receiver<Delivery>>>;

    /// Envelopes moved to the dead-letter sink after exhausting retries.
    async fn dead_letters(&self) -> Vec<EventEnvelope>;
}

/// A single delivery handed to a consumer, carrying enough state to requeue
/// itself with backoff on failure without the bus needing to track it.
pub struct Delivery {
    pub envelope: EventEnvelope,
    pub(crate) requeue: tokio::sync::mpsc::Sender<Delivery>,
    pub(crate) dead_letters: std::sync::Arc<tokio::sync::Mutex<Vec<EventEnvelope>>>,
    pub(crate) attempt: u32,
    pub(crate) max_attempts: u32,
    pub(crate) base_backoff: std::time::Duration,
}

impl Delivery {
    /// Acknowledge successful processing; nothing further happens.
    pub fn ack(self) {}

    /// Signal processing failure. Retries with exponential backoff up to
    /// `max_attempts`, then moves the envelope to the dead-letter sink.
    pub async fn nack(self) {
        if self.attempt >= self.max_attempts {
            tracing::error!(
                correlation_id = %self.envelope.correlation_id,
                event_type = %self.envelope.event_type,
                attempts = self.attempt,
                "moving envelope to dead-letter sink"
            );
            self.dead_letters.lock().await.push(self.envelope);
            return;
        }

        let backoff = self.base_backoff * 2u32.pow(self.attempt.saturating_sub(1));
        tracing::warn!(
            correlation_id = %self.envelope.correlation_id,
            event_type = %self.envelope.event_type,
            attempt = self.attempt,
            backoff_ms = backoff.as_millis() as u64,
            "retrying envelope after processing failure"
        );

        let next = Delivery {
            envelope: self.envelope,
            requeue: self.requeue.clone(),
            dead_letters: self.dead_letters,
            attempt: self.attempt + 1,
            max_attempts: self.max_attempts,
            base_backoff: self.base_backoff,
        };
        let requeue = self.requeue;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = requeue.send(next).await;
        });
    }
}
