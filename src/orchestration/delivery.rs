//! Reply delivery — exactly one of these is wired into the worker at
//! deployment time, selected by `Config.orchestration_delivery_mode`
//! (spec.md §4.5 step 5, §9 Open Question).

use crate::bus::{AgentResponse, Event, EventBus};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait ReplyDelivery: Send + Sync {
    async fn deliver(&self, reply: AgentResponse) -> AppResult<()>;
}

/// Default path: publish `AgentResponse` on the bus. Keeps the orchestrator
/// from needing to know where the gateway instance lives.
pub struct BusReplyDelivery {
    bus: Arc<dyn EventBus>,
}

impl BusReplyDelivery {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ReplyDelivery for BusReplyDelivery {
    async fn deliver(&self, reply: AgentResponse) -> AppResult<()> {
        self.bus.publish(Event::AgentResponse(reply)).await
    }
}

/// Alternative path: HTTP POST to the gateway's `InternalService` endpoint
/// (spec.md §6). Implemented and tested but not the default wire.
pub struct GatewayCallbackDelivery {
    client: reqwest::Client,
    base_url: String,
    internal_service_token: String,
    timeout: Duration,
}

impl GatewayCallbackDelivery {
    pub fn new(base_url: String, internal_service_token: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            internal_service_token,
            timeout,
        }
    }
}

#[async_trait]
impl ReplyDelivery for GatewayCallbackDelivery {
    async fn deliver(&self, reply: AgentResponse) -> AppResult<()> {
        let url = format!(
            "{}/conversations/{}/agent-response",
            self.base_url.trim_end_matches('/'),
            reply.conversation_id
        );

        let response = tokio::time::timeout(
            self.timeout,
            self.client
                .post(&url)
                .bearer_auth(&self.internal_service_token)
                .json(&reply)
                .send(),
        )
        .await
        .map_err(|_| AppError::Timeout("gateway callback".to_string()))?
        .map_err(|e| AppError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::Transient(format!(
                "gateway callback returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

pub fn error_reply(conversation_id: &str, model_name: &str) -> AgentResponse {
    AgentResponse {
        conversation_id: conversation_id.to_string(),
        message_id: uuid::Uuid::new_v4().to_string(),
        content: "Sorry, something went wrong generating a reply. Please try again.".to_string(),
        tokens_used: 0,
        model_name: model_name.to_string(),
        produced_at: Utc::now(),
        is_error: true,
    }
}
