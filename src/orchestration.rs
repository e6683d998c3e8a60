//! Consumes `MessageSent` off the bus, assembles context, classifies the
//! turn, calls the LLM, and delivers the reply (spec.md §4.5). A pool of
//! these run concurrently as competing consumers; each instance is
//! stateless between calls to `process`.

mod delivery;

pub use delivery::{BusReplyDelivery, GatewayCallbackDelivery, ReplyDelivery};

use crate::bus::{AgentResponse, Delivery, Event, EventBus, EventEnvelope, MessageSent};
use crate::classifier::HybridClassifier;
use crate::db::ConversationRepository;
use crate::domain::{ClassificationResult, Complexity, Message, MessageRole, Strategy, Task, TaskType};
use crate::error::{AppError, AppResult};
use crate::llm::{ContentBlock, LlmMessage, LlmRequest, LlmService, MessageRole as LlmRole, SystemContent};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const SYSTEM_PROMPT: &str = "You are a helpful software engineering assistant embedded in a chat product. \
Answer the user's message directly and concisely. You do not have the ability to run code or access \
files; if the request requires that, say so rather than inventing results.";

pub struct OrchestrationWorker {
    store: Arc<dyn ConversationRepository>,
    classifier: Arc<HybridClassifier>,
    llm: Arc<dyn LlmService>,
    delivery: Arc<dyn ReplyDelivery>,
    history_depth: u32,
    max_tokens: u32,
}

impl OrchestrationWorker {
    pub fn new(
        store: Arc<dyn ConversationRepository>,
        classifier: Arc<HybridClassifier>,
        llm: Arc<dyn LlmService>,
        delivery: Arc<dyn ReplyDelivery>,
        history_depth: u32,
        max_tokens: u32,
    ) -> Self {
        Self {
            store,
            classifier,
            llm,
            delivery,
            history_depth,
            max_tokens,
        }
    }

    /// Pulls deliveries from the bus until the channel closes or `shutdown`
    /// fires. Each delivery is handled on its own task so one slow LLM call
    /// never blocks the rest of the pool's queue. On cancellation, stops
    /// pulling new deliveries and waits for in-flight `handle` calls to
    /// finish, bounded by `grace_period` (spec.md §4.3 "Bus consumer
    /// cancellation (shutdown) must drain in-flight processing before
    /// unsubscribing, with a bounded grace period").
    pub async fn run(self: Arc<Self>, bus: Arc<dyn EventBus>, shutdown: CancellationToken, grace_period: std::time::Duration) {
        let rx = bus.subscribe("MessageSent");
        let in_flight = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let drained = Arc::new(tokio::sync::Notify::new());

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = async { rx.lock().await.recv().await } => next,
            };
            let Some(delivery) = delivery else { break };

            in_flight.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let worker = self.clone();
            let in_flight = in_flight.clone();
            let drained = drained.clone();
            tokio::spawn(async move {
                worker.handle(delivery).await;
                if in_flight.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) == 1 {
                    drained.notify_waiters();
                }
            });
        }

        let deadline = tokio::time::sleep(grace_period);
        tokio::pin!(deadline);
        while in_flight.load(std::sync::atomic::Ordering::SeqCst) > 0 {
            tokio::select! {
                _ = drained.notified() => {}
                _ = &mut deadline => {
                    tracing::warn!(
                        in_flight = in_flight.load(std::sync::atomic::Ordering::SeqCst),
                        "orchestration worker grace period elapsed with in-flight work remaining"
                    );
                    break;
                }
            }
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let envelope = delivery.envelope.clone();
        if let Err(e) = self.process(&envelope).await {
            tracing::error!(
                correlation_id = %envelope.correlation_id,
                error = %e,
                "orchestration pipeline failed after exhausting its own error handling"
            );
        }
        // Always ack: retrying a permanently-failing prompt forever helps no
        // one (spec.md §4.5 error handling). The user already got (or was
        // attempted) a synthetic error reply inside `process`.
        delivery.ack();
    }

    async fn process(&self, envelope: &EventEnvelope) -> AppResult<()> {
        let msg: MessageSent = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| AppError::InvalidArgument(format!("malformed MessageSent payload: {e}")))?;

        if !msg.role.eq_ignore_ascii_case("user") {
            return Ok(());
        }

        match self.run_pipeline(&msg).await {
            Ok(reply) => self.delivery.deliver(reply).await,
            Err(e) => {
                tracing::warn!(
                    conversation_id = %msg.conversation_id,
                    error = %e,
                    "turn pipeline failed, sending synthetic error reply"
                );
                let reply = delivery::error_reply(&msg.conversation_id, self.llm.model_id());
                self.delivery.deliver(reply).await
            }
        }
    }

    async fn run_pipeline(&self, msg: &MessageSent) -> AppResult<AgentResponse> {
        let classification = self.classifier.classify(&msg.content).await;

        // Fetch one extra so that dropping the current turn (already
        // persisted by the gateway before publishing) still leaves up to
        // `history_depth` prior messages, oldest first.
        let mut history = self
            .store
            .list_messages_for_service(&msg.conversation_id, self.history_depth + 1)
            .await?;
        history.retain(|m| m.id != msg.message_id && m.role != MessageRole::System);
        if history.len() > self.history_depth as usize {
            let drop = history.len() - self.history_depth as usize;
            history.drain(0..drop);
        }

        if classification.is_chitchat() {
            self.generate_chat_reply(msg, &history).await
        } else {
            self.materialize_task(msg, &classification).await
        }
    }

    async fn generate_chat_reply(&self, msg: &MessageSent, history: &[Message]) -> AppResult<AgentResponse> {
        let mut messages: Vec<LlmMessage> = history.iter().map(to_llm_message).collect();
        messages.push(LlmMessage {
            role: LlmRole::User,
            content: vec![ContentBlock::text(&msg.content)],
        });

        let request = LlmRequest {
            system: vec![SystemContent::new(SYSTEM_PROMPT)],
            messages,
            tools: vec![],
            max_tokens: Some(self.max_tokens),
        };

        let response = self
            .llm
            .complete(&request)
            .await
            .map_err(|e| AppError::Transient(e.message))?;

        Ok(AgentResponse {
            conversation_id: msg.conversation_id.clone(),
            message_id: Uuid::new_v4().to_string(),
            content: response.text(),
            tokens_used: response.usage.input_tokens + response.usage.output_tokens,
            model_name: self.llm.model_id().to_string(),
            produced_at: Utc::now(),
            is_error: false,
        })
    }

    /// Non-chitchat classification: persist the routing decision as a
    /// `System` message and reply with a single acknowledgement (spec.md
    /// §4.5 "Supplemented"). The strategies themselves are out of scope.
    async fn materialize_task(
        &self,
        msg: &MessageSent,
        classification: &ClassificationResult,
    ) -> AppResult<AgentResponse> {
        let task = Task::from_classification(Uuid::new_v4().to_string(), msg.conversation_id.clone(), classification);
        let record = serde_json::to_string(&task)
            .map_err(|e| AppError::InvalidArgument(format!("unserializable task record: {e}")))?;
        self.store
            .append_message(&msg.conversation_id, None, &record, MessageRole::System, false)
            .await?;

        let content = format!(
            "Routing this as a {} task ({} complexity); execution strategy `{}` would take over from here.",
            task_type_label(classification.task_type),
            complexity_label(classification.complexity),
            strategy_label(classification.suggested_strategy),
        );

        Ok(AgentResponse {
            conversation_id: msg.conversation_id.clone(),
            message_id: Uuid::new_v4().to_string(),
            content,
            tokens_used: 0,
            model_name: self.llm.model_id().to_string(),
            produced_at: Utc::now(),
            is_error: false,
        })
    }
}

fn to_llm_message(m: &Message) -> LlmMessage {
    let role = match m.role {
        MessageRole::Assistant => LlmRole::Assistant,
        _ => LlmRole::User,
    };
    LlmMessage {
        role,
        content: vec![ContentBlock::text(&m.content)],
    }
}

fn task_type_label(t: TaskType) -> &'static str {
    match t {
        TaskType::Chat => "Chat",
        TaskType::BugFix => "Bug Fix",
        TaskType::Feature => "Feature",
        TaskType::Refactor => "Refactor",
        TaskType::Question => "Question",
    }
}

fn complexity_label(c: Complexity) -> &'static str {
    match c {
        Complexity::Simple => "Simple",
        Complexity::Medium => "Medium",
        Complexity::Complex => "Complex",
        Complexity::Epic => "Epic",
    }
}

fn strategy_label(s: Strategy) -> &'static str {
    match s {
        Strategy::SingleShot => "SingleShot",
        Strategy::Iterative => "Iterative",
        Strategy::MultiAgent => "MultiAgent",
        Strategy::HybridEnsemble => "HybridEnsemble",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use crate::db::SqliteConversationStore;
    use crate::domain::UserId;
    use crate::llm::{LlmError, LlmResponse, Usage};
    use async_trait::async_trait;

    struct FakeLlm {
        reply: String,
    }

    #[async_trait]
    impl LlmService for FakeLlm {
        async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmError> {
            Ok(LlmResponse {
                content: vec![ContentBlock::text(self.reply.clone())],
                end_turn: true,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    ..Default::default()
                },
            })
        }

        fn model_id(&self) -> &str {
            "fake-model"
        }

        fn context_window(&self) -> usize {
            100_000
        }

        fn max_image_dimension(&self) -> Option<u32> {
            None
        }
    }

    async fn setup(reply: &str) -> (Arc<SqliteConversationStore>, Arc<OrchestrationWorker>, Arc<InMemoryEventBus>) {
        let store = Arc::new(SqliteConversationStore::open_in_memory().unwrap());
        let bus = Arc::new(InMemoryEventBus::new());
        let classifier = Arc::new(HybridClassifier::new(0.85, 0.70, None));
        let llm = Arc::new(FakeLlm { reply: reply.to_string() });
        let delivery = Arc::new(BusReplyDelivery::new(bus.clone()));
        let worker = Arc::new(OrchestrationWorker::new(store.clone(), classifier, llm, delivery, 10, 1024));
        (store, worker, bus)
    }

    #[tokio::test]
    async fn chitchat_turn_produces_direct_reply() {
        let (store, worker, bus) = setup("hey yourself!").await;
        let owner = UserId("u1".to_string());
        let conv = store.create_conversation(&owner, "Hi").await.unwrap();
        let user_msg = store
            .append_message(&conv.id, Some(owner.clone()), "hey there", MessageRole::User, false)
            .await
            .unwrap();

        let rx = bus.subscribe("MessageSent");
        bus.publish(Event::MessageSent(MessageSent {
            conversation_id: conv.id.clone(),
            message_id: user_msg.id.clone(),
            user_id: owner.0.clone(),
            content: user_msg.content.clone(),
            role: "user".to_string(),
            sent_at: user_msg.sent_at,
        }))
        .await
        .unwrap();

        let delivery = rx.lock().await.recv().await.unwrap();
        worker.clone().handle(delivery).await;

        let agent_rx = bus.subscribe("AgentResponse");
        let reply = agent_rx.lock().await.recv().await.unwrap();
        assert_eq!(reply.envelope.event_type, "AgentResponse");
        let payload: AgentResponse = serde_json::from_value(reply.envelope.payload.clone()).unwrap();
        assert_eq!(payload.content, "hey yourself!");
        assert!(!payload.is_error);
    }

    #[tokio::test]
    async fn task_shaped_turn_materializes_system_message_and_acks_with_summary() {
        let (store, worker, bus) = setup("unused").await;
        let owner = UserId("u1".to_string());
        let conv = store.create_conversation(&owner, "Hi").await.unwrap();
        let user_msg = store
            .append_message(
                &conv.id,
                Some(owner.clone()),
                "there's a bug causing a crash on startup, please fix it",
                MessageRole::User,
                false,
            )
            .await
            .unwrap();

        let rx = bus.subscribe("MessageSent");
        bus.publish(Event::MessageSent(MessageSent {
            conversation_id: conv.id.clone(),
            message_id: user_msg.id.clone(),
            user_id: owner.0.clone(),
            content: user_msg.content.clone(),
            role: "user".to_string(),
            sent_at: user_msg.sent_at,
        }))
        .await
        .unwrap();

        let delivery = rx.lock().await.recv().await.unwrap();
        worker.clone().handle(delivery).await;

        let history = store.list_messages_for_service(&conv.id, 50).await.unwrap();
        let system_msg = history.iter().find(|m| m.role == MessageRole::System).unwrap();
        let task: Task = serde_json::from_str(&system_msg.content).unwrap();
        assert!(!task.id.is_empty());
        assert_eq!(task.conversation_id, conv.id);
        assert_eq!(task.task_type, TaskType::BugFix);
        assert_eq!(task.status, crate::domain::TaskStatus::Created);

        let agent_rx = bus.subscribe("AgentResponse");
        let reply = agent_rx.lock().await.recv().await.unwrap();
        let payload: AgentResponse = serde_json::from_value(reply.envelope.payload.clone()).unwrap();
        assert!(payload.content.contains("Routing this as a Bug Fix task"));
    }

    #[tokio::test]
    async fn non_user_message_is_dropped_without_a_reply() {
        let (_store, worker, bus) = setup("unused").await;
        let rx = bus.subscribe("MessageSent");
        bus.publish(Event::MessageSent(MessageSent {
            conversation_id: "c1".to_string(),
            message_id: "m1".to_string(),
            user_id: "u1".to_string(),
            content: "hi".to_string(),
            role: "assistant".to_string(),
            sent_at: Utc::now(),
        }))
        .await
        .unwrap();

        let delivery = rx.lock().await.recv().await.unwrap();
        worker.clone().handle(delivery).await;

        let agent_rx = bus.subscribe("AgentResponse");
        let got = tokio::time::timeout(std::time::Duration::from_millis(100), agent_rx.lock().await.recv()).await;
        assert!(got.is_err(), "no AgentResponse should be published for a non-user message");
    }
}
