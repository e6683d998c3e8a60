//! Per-conversation broadcast groups plus a global presence channel
//! (spec.md §4.1). One `broadcast::Sender` per conversation id, created
//! lazily on first join and kept alive for the process lifetime — cheap
//! enough given the core's scale and simpler than tearing groups down on
//! last-leave.

use super::dto::ServerMessage;
use dashmap::DashMap;
use tokio::sync::broadcast;

const GROUP_CHANNEL_CAPACITY: usize = 256;

/// A broadcast payload plus an optional "don't deliver back to this
/// connection" marker, used for typing indicators (spec.md §4.1: "broadcast
/// to *other* members of group only").
#[derive(Clone)]
pub struct GroupEvent {
    pub exclude_connection: Option<String>,
    pub message: ServerMessage,
}

impl GroupEvent {
    pub fn all(message: ServerMessage) -> Self {
        Self {
            exclude_connection: None,
            message,
        }
    }

    pub fn except(connection_id: impl Into<String>, message: ServerMessage) -> Self {
        Self {
            exclude_connection: Some(connection_id.into()),
            message,
        }
    }
}

pub struct ConversationHub {
    groups: DashMap<String, broadcast::Sender<GroupEvent>>,
    presence: broadcast::Sender<ServerMessage>,
}

impl ConversationHub {
    pub fn new() -> Self {
        let (presence, _) = broadcast::channel(GROUP_CHANNEL_CAPACITY);
        Self {
            groups: DashMap::new(),
            presence,
        }
    }

    pub fn subscribe_group(&self, conversation_id: &str) -> broadcast::Receiver<GroupEvent> {
        self.groups
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(GROUP_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn broadcast_to_conversation(&self, conversation_id: &str, event: GroupEvent) {
        if let Some(tx) = self.groups.get(conversation_id) {
            // No subscribers is not an error — a reply can arrive after
            // every client in the group has disconnected.
            let _ = tx.send(event);
        }
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<ServerMessage> {
        self.presence.subscribe()
    }

    pub fn broadcast_presence(&self, message: ServerMessage) {
        let _ = self.presence.send(message);
    }
}

impl Default for ConversationHub {
    fn default() -> Self {
        Self::new()
    }
}
