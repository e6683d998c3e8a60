//! Wire types for the REST surface and the `/hubs/chat` duplex transport
//! (spec.md §6). Kept separate from `domain` so storage types can evolve
//! without touching the wire contract.

use crate::domain::{Conversation, Message, MessageRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDto {
    pub id: String,
    pub owner_user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Conversation> for ConversationDto {
    fn from(c: Conversation) -> Self {
        Self {
            id: c.id,
            owner_user_id: c.owner_user_id.0,
            title: c.title,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    pub id: String,
    pub conversation_id: String,
    pub sender_user_id: Option<String>,
    pub role: MessageRole,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub is_error: bool,
}

impl From<Message> for MessageDto {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            conversation_id: m.conversation_id,
            sender_user_id: m.sender_user_id.map(|u| u.0),
            role: m.role,
            content: m.content,
            sent_at: m.sent_at,
            is_error: m.is_error,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateConversationRequest {
    pub title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListConversationsQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub q: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesPageDto {
    pub items: Vec<MessageDto>,
    pub next_cursor: Option<String>,
}

/// Metadata surfaced as `ModelsResponse`; kept here (rather than in `llm`)
/// since it's a presentation concern of the gateway's surface, not the LLM
/// client abstraction itself.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    pub description: String,
    pub context_window: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
    pub default: String,
}

/// Inbound hub method call, dispatched over the `/hubs/chat` duplex
/// transport (spec.md §4.1 "Operations exposed to clients").
#[derive(Debug, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinConversation { conversation_id: String },
    LeaveConversation { conversation_id: String },
    SendMessage { conversation_id: String, content: String },
    TypingIndicator { conversation_id: String, is_typing: bool },
    GetOnlineUsers,
    GetUserOnlineStatus { user_id: String },
    GetUserLastSeen { user_id: String },
}

/// Server-initiated event sent down the duplex transport (spec.md §4.1
/// "Events the gateway emits to clients").
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    ReceiveMessage { message: MessageDto },
    AgentTyping { is_typing: bool },
    UserTyping { user_id: String, is_typing: bool },
    UserPresenceChanged {
        user_id: String,
        is_online: bool,
        last_seen_at: Option<DateTime<Utc>>,
    },
    OnlineUsers { user_ids: Vec<String> },
    UserOnlineStatus { user_id: String, is_online: bool },
    UserLastSeen { user_id: String, last_seen_at: Option<DateTime<Utc>> },
    Error { method: String, kind: String, message: String },
}
