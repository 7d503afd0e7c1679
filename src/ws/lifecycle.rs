//! Connection lifecycle: authenticate, connect, room moves, disconnect and
//! the heartbeat sweeper.
//!
//! Every path that ends a connection (socket close, read error, pong
//! timeout, idle sweep) goes through [`disconnect`], which is idempotent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::auth::{Principal, TokenVerifier};
use crate::error::AuthError;
use crate::notify::model::{FeedFilter, SubscriptionKey};
use crate::rooms::{JoinOutcome, RoomId, RoomKind};
use crate::state::AppState;
use crate::ws::protocol::ServerEvent;
use crate::ws::registry::{ConnectionEntry, ConnectionSender};

/// Close code sent to connections that stop answering.
pub const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Clone, Default)]
pub struct ConnectMeta {
    pub user_agent: Option<String>,
    pub remote_address: Option<SocketAddr>,
}

/// Verify the handshake token. Nothing is registered on failure.
pub async fn authenticate(
    verifier: &dyn TokenVerifier,
    token: Option<&str>,
) -> Result<Principal, AuthError> {
    let token = token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)?;
    verifier.verify_token(token).await
}

/// Rooms every connection joins on arrival.
pub fn default_rooms(principal: &Principal) -> Vec<RoomId> {
    let mut rooms = Vec::with_capacity(2);
    if let Some(agency_id) = &principal.agency_id {
        rooms.push(RoomId::tenant(agency_id));
    }
    rooms.push(RoomId::user(&principal.user_id));
    rooms
}

/// Register an authenticated connection, join its default rooms, announce
/// the user if this is their first connection and replay unread
/// notifications to this socket.
pub async fn connect(
    state: &AppState,
    principal: &Principal,
    sender: ConnectionSender,
    meta: ConnectMeta,
) -> ConnectionEntry {
    let mut entry = ConnectionEntry::new(
        principal.user_id.clone(),
        principal.agency_id.clone(),
        sender,
    );
    entry.user_agent = meta.user_agent;
    entry.remote_address = meta.remote_address;
    let connection_id = entry.connection_id.clone();

    let first = state.registry.register(entry.clone());
    for room in default_rooms(principal) {
        state.rooms.join(&connection_id, &principal.user_id, &room, None);
    }
    if first {
        state.presence.connected(principal);
    }

    catch_up(state, &connection_id, principal).await;

    tracing::info!(
        user_id = %principal.user_id,
        connection_id = %connection_id,
        first,
        "Connection established"
    );
    entry
}

/// Replay the most recent unread notifications, oldest first. Live events
/// may overlap; clients de-duplicate by id.
async fn catch_up(state: &AppState, connection_id: &str, principal: &Principal) {
    let key = SubscriptionKey::new(principal.user_id.clone(), principal.agency_id.clone());
    let limit = state.config.notifications.catch_up_limit;
    match state
        .store
        .recent_unread(&FeedFilter::for_key(key, []), limit)
        .await
    {
        Ok(records) => {
            let count = records.len();
            for record in records {
                if state
                    .registry
                    .send_to_connection(connection_id, Arc::new(ServerEvent::Notification(record)))
                    .is_err()
                {
                    return;
                }
            }
            if count > 0 {
                tracing::debug!(connection_id = %connection_id, count, "Replayed unread notifications");
            }
        }
        Err(e) => tracing::warn!(
            connection_id = %connection_id,
            error = %e,
            "Catch-up query failed"
        ),
    }
}

pub fn join_room(
    state: &AppState,
    connection_id: &str,
    principal: &Principal,
    room: &RoomId,
    kind: Option<RoomKind>,
) -> Result<JoinOutcome, String> {
    room.authorize(principal)?;
    Ok(state.rooms.join(connection_id, &principal.user_id, room, kind))
}

/// Leave one room. Typing stops once the user has no connection left in it.
pub fn leave_room(state: &AppState, connection_id: &str, user_id: &str, room: &RoomId) -> bool {
    match state.rooms.leave(connection_id, user_id, room) {
        Some(outcome) => {
            if outcome.member_left {
                state.typing.stop(room, user_id);
            }
            true
        }
        None => false,
    }
}

/// Tear down a connection: leave every room it joined (typing stops where
/// this was the user's last connection in the room), drop it from the
/// registry and announce the user offline if it was their last connection.
/// Returns false if the connection was already gone.
pub fn disconnect(state: &AppState, connection_id: &str) -> bool {
    let Some(entry) = state.registry.connection(connection_id) else {
        return false;
    };

    for room in state.rooms.rooms_of(connection_id) {
        leave_room(state, connection_id, &entry.user_id, &room);
    }

    match state.registry.unregister(connection_id) {
        Some(removed) => {
            if removed.last {
                state.typing.stop_everywhere(&entry.user_id);
                state
                    .presence
                    .disconnected(&entry.user_id, entry.agency_id.as_deref());
            }
            tracing::info!(
                user_id = %entry.user_id,
                connection_id = %connection_id,
                last = removed.last,
                "Connection closed"
            );
            true
        }
        None => false,
    }
}

/// Periodically close connections idle past the heartbeat timeout.
pub fn spawn_heartbeat_sweeper(state: AppState) -> JoinHandle<()> {
    let timeout = Duration::from_secs(state.config.presence.heartbeat_timeout_secs);
    let every = Duration::from_secs(state.config.presence.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for connection_id in state.registry.stale_connections(timeout) {
                tracing::warn!(connection_id = %connection_id, "Heartbeat timeout, closing connection");
                state
                    .registry
                    .close_connection(&connection_id, CLOSE_GOING_AWAY, "Heartbeat timeout");
                disconnect(&state, &connection_id);
            }
        }
        tracing::debug!("Heartbeat sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::presence::PresenceStatus;
    use crate::test_support::{principal, test_state, test_state_with_config};
    use crate::ws::registry::Outbound;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Arc<ServerEvent>> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Event(event) = frame {
                out.push(event);
            }
        }
        out
    }

    #[tokio::test]
    async fn missing_or_blank_token_is_rejected() {
        let state = test_state();
        let err = authenticate(state.verifier.as_ref(), None).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingToken));
        let err = authenticate(state.verifier.as_ref(), Some("  ")).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingToken));
        let err = authenticate(state.verifier.as_ref(), Some("garbage")).await.unwrap_err();
        assert_eq!(err.close_code(), 4002);
    }

    #[tokio::test]
    async fn connect_joins_default_rooms_and_announces_once() {
        let state = test_state();
        let alice = principal("alice", Some("ag1"));
        let bob = principal("bob", Some("ag1"));

        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        connect(&state, &bob, bob_tx, ConnectMeta::default()).await;
        drain(&mut bob_rx);

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let first = connect(&state, &alice, tx1, ConnectMeta::default()).await;
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let second = connect(&state, &alice, tx2, ConnectMeta::default()).await;

        let mut rooms = state.rooms.rooms_of(&first.connection_id);
        rooms.sort();
        assert_eq!(rooms, vec![RoomId::tenant("ag1"), RoomId::user("alice")]);

        let onlines = drain(&mut bob_rx)
            .into_iter()
            .filter(|e| matches!(e.as_ref(), ServerEvent::UserStatusChanged { .. }))
            .count();
        assert_eq!(onlines, 1);

        assert!(disconnect(&state, &first.connection_id));
        assert!(state.registry.is_online("alice"));
        assert!(disconnect(&state, &second.connection_id));
        assert!(!disconnect(&state, &second.connection_id));
        assert!(!state.registry.is_online("alice"));

        let offline: Vec<_> = drain(&mut bob_rx)
            .into_iter()
            .filter_map(|e| match e.as_ref() {
                ServerEvent::UserStatusChanged { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(offline, vec![crate::presence::PresenceStatus::Offline]);
    }

    #[tokio::test]
    async fn disconnect_stops_typing_in_joined_rooms() {
        let state = test_state();
        let alice = principal("alice", Some("ag1"));
        let bob = principal("bob", Some("ag1"));
        let project = RoomId::parse("project:9").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let a = connect(&state, &alice, tx, ConnectMeta::default()).await;
        let (tx, mut bob_rx) = mpsc::unbounded_channel();
        let b = connect(&state, &bob, tx, ConnectMeta::default()).await;
        join_room(&state, &a.connection_id, &alice, &project, None).unwrap();
        join_room(&state, &b.connection_id, &bob, &project, None).unwrap();
        state.typing.start(&project, "alice");
        drain(&mut bob_rx);

        disconnect(&state, &a.connection_id);

        // Room teardown order is unspecified; the offline notice comes last.
        let mut names: Vec<_> = drain(&mut bob_rx).iter().map(|e| e.name()).collect();
        assert_eq!(names.pop(), Some("user_status_changed"));
        names.sort();
        assert_eq!(names, vec!["typing_stop", "user_left_room", "user_left_room"]);
        assert!(!state.typing.is_typing(&project, "alice"));
        assert_eq!(state.rooms.members(&project), vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn typing_survives_closing_one_of_two_devices() {
        let state = test_state();
        let alice = principal("alice", Some("ag1"));
        let bob = principal("bob", Some("ag1"));
        let project = RoomId::parse("project:5").unwrap();

        let (tx, _laptop_rx) = mpsc::unbounded_channel();
        let laptop = connect(&state, &alice, tx, ConnectMeta::default()).await;
        let (tx, _phone_rx) = mpsc::unbounded_channel();
        let phone = connect(&state, &alice, tx, ConnectMeta::default()).await;
        let (tx, mut bob_rx) = mpsc::unbounded_channel();
        let b = connect(&state, &bob, tx, ConnectMeta::default()).await;
        for id in [&laptop.connection_id, &phone.connection_id] {
            join_room(&state, id, &alice, &project, None).unwrap();
        }
        join_room(&state, &b.connection_id, &bob, &project, None).unwrap();
        state.typing.start(&project, "alice");
        drain(&mut bob_rx);

        disconnect(&state, &laptop.connection_id);
        assert!(state.typing.is_typing(&project, "alice"));
        assert!(drain(&mut bob_rx).is_empty());

        disconnect(&state, &phone.connection_id);
        assert!(!state.typing.is_typing(&project, "alice"));
        let names: Vec<_> = drain(&mut bob_rx).iter().map(|e| e.name()).collect();
        assert_eq!(names.iter().filter(|n| **n == "typing_stop").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_tears_down_idle_connections() {
        let mut config = Config::default();
        config.presence.heartbeat_timeout_secs = 2;
        config.presence.sweep_interval_secs = 1;
        let state = test_state_with_config(config);
        let alice = principal("alice", Some("ag1"));
        let bob = principal("bob", Some("ag1"));
        let project = RoomId::parse("project:3").unwrap();

        let (tx, mut alice_rx) = mpsc::unbounded_channel();
        let a = connect(&state, &alice, tx, ConnectMeta::default()).await;
        let (tx, mut bob_rx) = mpsc::unbounded_channel();
        let b = connect(&state, &bob, tx, ConnectMeta::default()).await;
        join_room(&state, &a.connection_id, &alice, &project, None).unwrap();
        join_room(&state, &b.connection_id, &bob, &project, None).unwrap();
        state.typing.start(&project, "alice");
        drain(&mut bob_rx);

        let sweeper = spawn_heartbeat_sweeper(state.clone());
        // Bob keeps talking; alice goes silent.
        for _ in 0..4 {
            state.registry.heartbeat(&b.connection_id);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        assert!(!state.registry.is_online("alice"));
        assert!(state.registry.connections_of("alice").is_empty());
        assert!(state.registry.is_online("bob"));
        assert!(!state.typing.is_typing(&project, "alice"));
        assert_eq!(state.rooms.members(&project), vec!["bob".to_string()]);

        let events = drain(&mut bob_rx);
        assert!(events.iter().any(|e| matches!(
            e.as_ref(),
            ServerEvent::TypingStop { user_id, .. } if user_id == "alice"
        )));
        assert!(events.iter().any(|e| matches!(
            e.as_ref(),
            ServerEvent::UserLeftRoom { user_id, .. } if user_id == "alice"
        )));
        assert!(events.iter().any(|e| matches!(
            e.as_ref(),
            ServerEvent::UserStatusChanged { user_id, status: PresenceStatus::Offline, .. }
                if user_id == "alice"
        )));

        let mut close_code = None;
        while let Ok(frame) = alice_rx.try_recv() {
            if let Outbound::Close { code, .. } = frame {
                close_code = Some(code);
            }
        }
        assert_eq!(close_code, Some(CLOSE_GOING_AWAY));

        state.shutdown.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn foreign_tenant_room_is_refused() {
        let state = test_state();
        let alice = principal("alice", Some("ag1"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = connect(&state, &alice, tx, ConnectMeta::default()).await;
        assert!(join_room(&state, &a.connection_id, &alice, &RoomId::tenant("ag2"), None).is_err());
        assert_eq!(state.rooms.member_count(&RoomId::tenant("ag2")), 0);
    }

    #[tokio::test]
    async fn catch_up_replays_unread_oldest_first() {
        let state = test_state();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let out = state
                .events
                .create_event(
                    Some("alice"),
                    crate::notify::model::NotificationType::TaskComment,
                    serde_json::json!({}),
                    crate::notify::mapper::CreateOptions {
                        agency_id: Some("ag1".into()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            ids.push(out.id);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        connect(&state, &principal("alice", Some("ag1")), tx, ConnectMeta::default()).await;

        let replayed: Vec<String> = drain(&mut rx)
            .iter()
            .filter_map(|e| match e.as_ref() {
                ServerEvent::Notification(r) => Some(r.id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(replayed, ids);
    }
}
