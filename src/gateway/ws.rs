//! `/hubs/chat` duplex transport: hub method dispatch, per-conversation
//! broadcast groups, and presence lifecycle (spec.md §4.1).

use super::dto::{ClientMessage, ServerMessage};
use super::hub::GroupEvent;
use super::AppState;
use crate::auth::AuthenticatedUser;
use crate::bus::{Event, MessageSent};
use crate::domain::{MessageRole, UserId};
use crate::presence::PresenceTransition;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

pub async fn ws_handler(
    AuthenticatedUser(user): AuthenticatedUser,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, user, state))
}

async fn handle_socket(mut socket: WebSocket, user: UserId, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();

    let transition = state.presence.mark_online(&user, &connection_id).await;
    announce_presence_if_changed(&state, &user, transition).await;

    let mut presence_rx = state.hub.subscribe_presence();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(128);
    let mut joined: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&text, &user, &connection_id, &state, &out_tx, &mut joined).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            presence_evt = presence_rx.recv() => {
                match presence_evt {
                    Ok(evt) => { if send(&mut socket, &evt).await.is_err() { break; } }
                    Err(_) => continue,
                }
            }
            Some(out_evt) = out_rx.recv() => {
                if send(&mut socket, &out_evt).await.is_err() { break; }
            }
        }
    }

    for (_, handle) in joined {
        handle.abort();
    }

    let transition = state.presence.mark_offline(&user, &connection_id).await;
    announce_presence_if_changed(&state, &user, transition).await;
}

async fn send(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text)).await
}

async fn announce_presence_if_changed(state: &AppState, user: &UserId, transition: PresenceTransition) {
    let is_online = match transition {
        PresenceTransition::BecameOnline => true,
        PresenceTransition::BecameOffline => false,
        PresenceTransition::None => return,
    };
    let last_seen_at = state.presence.last_seen(user).await;
    state.hub.broadcast_presence(ServerMessage::UserPresenceChanged {
        user_id: user.0.clone(),
        is_online,
        last_seen_at,
    });
}

#[allow(clippy::too_many_lines)]
async fn handle_client_message(
    text: &str,
    user: &UserId,
    connection_id: &str,
    state: &AppState,
    out_tx: &mpsc::Sender<ServerMessage>,
    joined: &mut HashMap<String, tokio::task::JoinHandle<()>>,
) {
    let parsed: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            let _ = out_tx
                .send(ServerMessage::Error {
                    method: "unknown".to_string(),
                    kind: "InvalidArgument".to_string(),
                    message: format!("malformed hub message: {e}"),
                })
                .await;
            return;
        }
    };

    match parsed {
        ClientMessage::JoinConversation { conversation_id } => {
            join_conversation(&conversation_id, user, connection_id, state, out_tx, joined).await;
        }
        ClientMessage::LeaveConversation { conversation_id } => {
            if let Some(handle) = joined.remove(&conversation_id) {
                handle.abort();
            }
        }
        ClientMessage::SendMessage { conversation_id, content } => {
            send_message(&conversation_id, &content, user, connection_id, state, out_tx).await;
        }
        ClientMessage::TypingIndicator { conversation_id, is_typing } => {
            state.hub.broadcast_to_conversation(
                &conversation_id,
                GroupEvent::except(
                    connection_id,
                    ServerMessage::UserTyping {
                        user_id: user.0.clone(),
                        is_typing,
                    },
                ),
            );
        }
        ClientMessage::GetOnlineUsers => {
            let user_ids = state.presence.online_users().await.into_iter().map(|u| u.0).collect();
            let _ = out_tx.send(ServerMessage::OnlineUsers { user_ids }).await;
        }
        ClientMessage::GetUserOnlineStatus { user_id } => {
            let is_online = state.presence.is_online(&UserId(user_id.clone())).await;
            let _ = out_tx.send(ServerMessage::UserOnlineStatus { user_id, is_online }).await;
        }
        ClientMessage::GetUserLastSeen { user_id } => {
            let last_seen_at = state.presence.last_seen(&UserId(user_id.clone())).await;
            let _ = out_tx.send(ServerMessage::UserLastSeen { user_id, last_seen_at }).await;
        }
    }
}

async fn join_conversation(
    conversation_id: &str,
    user: &UserId,
    connection_id: &str,
    state: &AppState,
    out_tx: &mpsc::Sender<ServerMessage>,
    joined: &mut HashMap<String, tokio::task::JoinHandle<()>>,
) {
    let conversation = match state.store.get_conversation(conversation_id).await {
        Ok(c) => c,
        Err(e) => {
            let _ = out_tx
                .send(ServerMessage::Error {
                    method: "joinConversation".to_string(),
                    kind: e.kind_name().to_string(),
                    message: e.to_string(),
                })
                .await;
            return;
        }
    };

    if !conversation.is_owned_by(user) {
        let _ = out_tx
            .send(ServerMessage::Error {
                method: "joinConversation".to_string(),
                kind: "Forbidden".to_string(),
                message: "you do not own this conversation".to_string(),
            })
            .await;
        return;
    }

    if let Some(old) = joined.remove(conversation_id) {
        old.abort();
    }

    let mut rx = state.hub.subscribe_group(conversation_id);
    let forward_tx = out_tx.clone();
    let my_connection = connection_id.to_string();
    let handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(evt) => {
                    if evt.exclude_connection.as_deref() == Some(my_connection.as_str()) {
                        continue;
                    }
                    if forward_tx.send(evt.message).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    joined.insert(conversation_id.to_string(), handle);
}

async fn send_message(
    conversation_id: &str,
    content: &str,
    user: &UserId,
    connection_id: &str,
    state: &AppState,
    out_tx: &mpsc::Sender<ServerMessage>,
) {
    let conversation = match state.store.get_conversation(conversation_id).await {
        Ok(c) => c,
        Err(e) => {
            let _ = out_tx
                .send(ServerMessage::Error {
                    method: "sendMessage".to_string(),
                    kind: e.kind_name().to_string(),
                    message: e.to_string(),
                })
                .await;
            return;
        }
    };
    if !conversation.is_owned_by(user) {
        let _ = out_tx
            .send(ServerMessage::Error {
                method: "sendMessage".to_string(),
                kind: "Forbidden".to_string(),
                message: "you do not own this conversation".to_string(),
            })
            .await;
        return;
    }

    let message = match state
        .store
        .append_message(conversation_id, Some(user.clone()), content, MessageRole::User, false)
        .await
    {
        Ok(m) => m,
        Err(e) => {
            let _ = out_tx
                .send(ServerMessage::Error {
                    method: "sendMessage".to_string(),
                    kind: e.kind_name().to_string(),
                    message: e.to_string(),
                })
                .await;
            return;
        }
    };

    state.hub.broadcast_to_conversation(
        conversation_id,
        GroupEvent::all(ServerMessage::ReceiveMessage { message: message.clone().into() }),
    );
    state
        .hub
        .broadcast_to_conversation(conversation_id, GroupEvent::all(ServerMessage::AgentTyping { is_typing: true }));

    // Best-effort from here per spec.md §4.1: the user message is already
    // persisted and echoed; a bus outage only degrades the agent reply.
    if let Err(e) = state
        .bus
        .publish(Event::MessageSent(MessageSent {
            conversation_id: conversation_id.to_string(),
            message_id: message.id.clone(),
            user_id: user.0.clone(),
            content: message.content.clone(),
            role: "User".to_string(),
            sent_at: message.sent_at,
        }))
        .await
    {
        tracing::warn!(conversation_id, error = %e, "failed to publish MessageSent, notifying client");
        let error_message = crate::domain::Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_user_id: None,
            role: MessageRole::Assistant,
            content: "Sorry, your message was saved but couldn't be routed to the assistant. Please try again."
                .to_string(),
            sent_at: Utc::now(),
            is_error: true,
        };
        state.hub.broadcast_to_conversation(
            conversation_id,
            GroupEvent::all(ServerMessage::ReceiveMessage { message: error_message.into() }),
        );
        state
            .hub
            .broadcast_to_conversation(conversation_id, GroupEvent::all(ServerMessage::AgentTyping { is_typing: false }));
    }
}
