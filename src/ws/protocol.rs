//! JSON wire protocol: every frame is `{"event": "<name>", "payload": {...}}`.
//!
//! [`ClientMessage`] is what a socket may send, [`ServerEvent`] is what the
//! server pushes. Inbound frames are dispatched here to the room, presence
//! and notification services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::Principal;
use crate::error::TransportError;
use crate::notify::model::{NotificationRecord, SubscriptionKey};
use crate::presence::status::{OnlineUser, PresenceStatus};
use crate::rooms::{RoomId, RoomKind};
use crate::state::AppState;
use crate::ws::lifecycle;

/// Longest chat message relayed through `send_message`.
pub const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename = "notification")]
    Notification(NotificationRecord),
    #[serde(rename = "notification-updated")]
    NotificationUpdated(NotificationRecord),
    UserJoinedRoom {
        room_id: RoomId,
        user_id: String,
        member_count: usize,
    },
    UserLeftRoom {
        room_id: RoomId,
        user_id: String,
        member_count: usize,
    },
    TypingStart {
        room_id: RoomId,
        user_id: String,
    },
    TypingStop {
        room_id: RoomId,
        user_id: String,
    },
    UserStatusChanged {
        user_id: String,
        agency_id: Option<String>,
        status: PresenceStatus,
        message: Option<String>,
        changed_at: DateTime<Utc>,
    },
    OnlineUsers {
        agency_id: Option<String>,
        users: Vec<OnlineUser>,
    },
    RoomJoined {
        room_id: RoomId,
        room_type: RoomKind,
        member_count: usize,
    },
    Message {
        id: String,
        room_id: RoomId,
        user_id: String,
        content: String,
        data: Option<serde_json::Value>,
        sent_at: DateTime<Utc>,
    },
    Error {
        code: u16,
        message: String,
    },
}

impl ServerEvent {
    pub fn error(code: u16, message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::Error {
            code,
            message: message.into(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Notification(_) => "notification",
            Self::NotificationUpdated(_) => "notification-updated",
            Self::UserJoinedRoom { .. } => "user_joined_room",
            Self::UserLeftRoom { .. } => "user_left_room",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::UserStatusChanged { .. } => "user_status_changed",
            Self::OnlineUsers { .. } => "online_users",
            Self::RoomJoined { .. } => "room_joined",
            Self::Message { .. } => "message",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
        #[serde(default)]
        room_type: Option<RoomKind>,
    },
    LeaveRoom {
        room_id: String,
    },
    SendMessage {
        room_id: String,
        content: String,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    TypingStart {
        room_id: String,
    },
    TypingStop {
        room_id: String,
    },
    StatusUpdate {
        status: PresenceStatus,
        #[serde(default)]
        message: Option<String>,
    },
    GetOnlineUsers {
        #[serde(default)]
        agency_id: Option<String>,
    },
    Heartbeat,
    MarkRead {
        id: String,
    },
    MarkAllRead,
}

pub fn encode(event: &ServerEvent) -> Result<String, TransportError> {
    serde_json::to_string(event).map_err(|e| TransportError::Malformed(e.to_string()))
}

pub fn decode(text: &str) -> Result<ClientMessage, TransportError> {
    serde_json::from_str(text).map_err(|e| TransportError::Malformed(e.to_string()))
}

/// Handle one inbound text frame from an authenticated connection.
pub async fn handle_text_message(
    text: &str,
    state: &AppState,
    connection_id: &str,
    principal: &Principal,
) {
    let message = match decode(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(
                connection_id = %connection_id,
                user_id = %principal.user_id,
                error = %e,
                "Rejected inbound frame"
            );
            reply(state, connection_id, ServerEvent::error(400, e.to_string()));
            return;
        }
    };

    dispatch(message, state, connection_id, principal).await;
}

async fn dispatch(
    message: ClientMessage,
    state: &AppState,
    connection_id: &str,
    principal: &Principal,
) {
    match message {
        ClientMessage::JoinRoom { room_id, room_type } => {
            let room = match parse_room(state, connection_id, &room_id) {
                Some(room) => room,
                None => return,
            };
            match lifecycle::join_room(state, connection_id, principal, &room, room_type) {
                Ok(outcome) => reply(
                    state,
                    connection_id,
                    Arc::new(ServerEvent::RoomJoined {
                        room_id: room,
                        room_type: outcome.kind,
                        member_count: outcome.member_count,
                    }),
                ),
                Err(reason) => reply(state, connection_id, ServerEvent::error(403, reason)),
            }
        }
        ClientMessage::LeaveRoom { room_id } => {
            if let Some(room) = parse_room(state, connection_id, &room_id) {
                lifecycle::leave_room(state, connection_id, &principal.user_id, &room);
            }
        }
        ClientMessage::SendMessage {
            room_id,
            content,
            data,
        } => {
            let Some(room) = parse_room(state, connection_id, &room_id) else {
                return;
            };
            if content.trim().is_empty() || content.len() > MAX_MESSAGE_LEN {
                reply(
                    state,
                    connection_id,
                    ServerEvent::error(400, "message content must be 1-4096 bytes"),
                );
                return;
            }
            if !state.rooms.is_connection_in_room(connection_id, &room) {
                reply(state, connection_id, ServerEvent::error(403, "not a member of this room"));
                return;
            }
            // Sending a message ends the sender's typing indicator.
            state.typing.stop(&room, &principal.user_id);
            let event = Arc::new(ServerEvent::Message {
                id: uuid::Uuid::now_v7().to_string(),
                room_id: room.clone(),
                user_id: principal.user_id.clone(),
                content,
                data,
                sent_at: Utc::now(),
            });
            state.rooms.send_to_room(&room, event, None);
        }
        ClientMessage::TypingStart { room_id } => {
            if let Some(room) = parse_room(state, connection_id, &room_id) {
                if state.rooms.is_connection_in_room(connection_id, &room) {
                    state.typing.start(&room, &principal.user_id);
                }
            }
        }
        ClientMessage::TypingStop { room_id } => {
            if let Some(room) = parse_room(state, connection_id, &room_id) {
                state.typing.stop(&room, &principal.user_id);
            }
        }
        ClientMessage::StatusUpdate { status, message } => {
            state.presence.set_status(principal, status, message);
        }
        ClientMessage::GetOnlineUsers { agency_id } => {
            // Tenant isolation: a principal only sees its own agency.
            let agency_id = match (&principal.agency_id, agency_id) {
                (Some(own), Some(requested)) if own != &requested => {
                    reply(state, connection_id, ServerEvent::error(403, "foreign agency"));
                    return;
                }
                (own, _) => own.clone(),
            };
            let users = state.presence.online_users(agency_id.as_deref());
            reply(
                state,
                connection_id,
                Arc::new(ServerEvent::OnlineUsers { agency_id, users }),
            );
        }
        ClientMessage::Heartbeat => {
            state.registry.heartbeat(connection_id);
        }
        ClientMessage::MarkRead { id } => {
            // Ownership check before the write; the update echoes back
            // through the change feed.
            match state.store.get_notification(&id).await {
                Ok(record) if visible_to(&record, principal) => {
                    if let Err(e) = state.store.mark_read(&id).await {
                        let (status, msg) = e.into_rejection();
                        reply(state, connection_id, ServerEvent::error(status.as_u16(), msg));
                    }
                }
                Ok(_) => reply(state, connection_id, ServerEvent::error(404, "notification not found")),
                Err(e) => {
                    let (status, msg) = e.into_rejection();
                    reply(state, connection_id, ServerEvent::error(status.as_u16(), msg));
                }
            }
        }
        ClientMessage::MarkAllRead => {
            let key = SubscriptionKey::new(principal.user_id.clone(), principal.agency_id.clone());
            if let Err(e) = state.store.mark_all_read(&key).await {
                let (status, msg) = e.into_rejection();
                reply(state, connection_id, ServerEvent::error(status.as_u16(), msg));
            }
        }
    }
}

/// Whether a principal may read or acknowledge a record.
pub fn visible_to(record: &NotificationRecord, principal: &Principal) -> bool {
    let key = SubscriptionKey::new(principal.user_id.clone(), principal.agency_id.clone());
    crate::notify::model::FeedFilter::for_key(key, []).matches(record)
}

fn parse_room(state: &AppState, connection_id: &str, raw: &str) -> Option<RoomId> {
    match RoomId::parse(raw) {
        Ok(room) => Some(room),
        Err(reason) => {
            reply(state, connection_id, ServerEvent::error(400, reason));
            None
        }
    }
}

fn reply(state: &AppState, connection_id: &str, event: Arc<ServerEvent>) {
    if let Err(e) = state.registry.send_to_connection(connection_id, event) {
        tracing::debug!(connection_id = %connection_id, error = %e, "Reply dropped");
    }
}
