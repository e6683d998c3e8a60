//! The chat gateway: a duplex transport plus a REST surface over the same
//! conversation/presence state (spec.md §4.1).

pub mod dto;
mod hub;
mod rest;
mod ws;

pub use hub::{ConversationHub, GroupEvent};

use crate::auth::AuthVerifier;
use crate::bus::EventBus;
use crate::config::Config;
use crate::db::ConversationRepository;
use crate::llm::ModelRegistry;
use crate::presence::PresenceStore;
use axum::extract::FromRef;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ConversationRepository>,
    pub bus: Arc<dyn EventBus>,
    pub presence: Arc<dyn PresenceStore>,
    pub auth: AuthVerifier,
    pub config: Config,
    pub hub: Arc<ConversationHub>,
    pub llm_registry: Arc<ModelRegistry>,
}

impl FromRef<AppState> for AuthVerifier {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

impl FromRef<AppState> for Config {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/hubs/chat", get(ws::ws_handler))
        .route("/conversations", get(rest::list_conversations).post(rest::create_conversation))
        .route(
            "/conversations/:id",
            get(rest::get_conversation).put(rest::update_conversation).delete(rest::delete_conversation),
        )
        .route("/conversations/:id/messages", get(rest::list_messages))
        .route("/conversations/:id/agent-response", post(rest::agent_response))
        .route("/conversations/:id/messages/history", get(rest::messages_history))
        .route("/models", get(rest::list_models))
        .route("/healthz", get(rest::healthz))
        .route("/readyz", get(rest::readyz))
        .with_state(state)
}

/// Consumes `AgentResponse` off the bus, persists the assistant turn, and
/// fans it out over the hub (the gateway half of spec.md §4.1's "consumes
/// `AgentResponse` and notifies clients" responsibility). Runs for the
/// process lifetime; only the `Bus` delivery mode feeds this path — under
/// `GatewayCallback` mode the REST `agent-response` handler does the same
/// work synchronously per request.
///
/// Stops pulling new deliveries once `shutdown` fires; each delivery is
/// handled to completion inline, so cancellation never interrupts one
/// already in flight (spec.md §4.3's drain-before-unsubscribe requirement).
pub async fn run_agent_response_consumer(state: AppState, shutdown: tokio_util::sync::CancellationToken) {
    let rx = state.bus.subscribe("AgentResponse");
    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = async { rx.lock().await.recv().await } => next,
        };
        let Some(delivery) = delivery else { break };

        let payload: Result<crate::bus::AgentResponse, _> = serde_json::from_value(delivery.envelope.payload.clone());
        match payload {
            Ok(reply) => {
                if let Err(e) = apply_agent_response(&state, reply).await {
                    tracing::error!(error = %e, "failed to apply agent response");
                }
                delivery.ack();
            }
            Err(e) => {
                tracing::error!(error = %e, "malformed AgentResponse envelope, dropping");
                delivery.ack();
            }
        }
    }
}

async fn apply_agent_response(state: &AppState, reply: crate::bus::AgentResponse) -> crate::error::AppResult<()> {
    let role = crate::domain::MessageRole::Assistant;
    let message = state
        .store
        .append_message(&reply.conversation_id, None, &reply.content, role, reply.is_error)
        .await?;

    state.hub.broadcast_to_conversation(
        &reply.conversation_id,
        GroupEvent::all(dto::ServerMessage::ReceiveMessage { message: message.into() }),
    );
    state.hub.broadcast_to_conversation(
        &reply.conversation_id,
        GroupEvent::all(dto::ServerMessage::AgentTyping { is_typing: false }),
    );
    Ok(())
}
