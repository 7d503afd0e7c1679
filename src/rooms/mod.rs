//! Named rooms and their membership.
//!
//! Rooms are created on first join and dropped when the last member leaves.
//! Membership is a set of users, and each member keeps the set of its
//! connections that joined, so one tab leaving does not evict a user who is
//! still present on another.
//!
//! Fan-out holds the room's map entry for the duration of the send, which
//! serializes broadcasts per room and keeps the accepted order. Lock order
//! is rooms, then `by_connection`, then the connection registry.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::auth::Principal;
use crate::ws::protocol::ServerEvent;
use crate::ws::registry::{ConnectionId, ConnectionRegistry};

const MAX_ROOM_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Project,
    Tenant,
    Private,
    Public,
}

/// Room identifier, e.g. `tenant:ag1`, `user:u1`, `project:42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn tenant(agency_id: &str) -> Self {
        Self(format!("tenant:{}", agency_id))
    }

    pub fn user(user_id: &str) -> Self {
        Self(format!("user:{}", user_id))
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("room_id is empty".into());
        }
        if raw.len() > MAX_ROOM_ID_LEN {
            return Err(format!("room_id longer than {} bytes", MAX_ROOM_ID_LEN));
        }
        if raw.chars().any(char::is_control) {
            return Err("room_id contains control characters".into());
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Kind implied by the prefix. Unprefixed rooms are public.
    pub fn kind(&self) -> RoomKind {
        match self.0.split_once(':').map(|(prefix, _)| prefix) {
            Some("tenant") => RoomKind::Tenant,
            Some("user") => RoomKind::Private,
            Some("project") => RoomKind::Project,
            _ => RoomKind::Public,
        }
    }

    /// Check a principal may join. Tenant and user rooms are reserved for
    /// their owner.
    pub fn authorize(&self, principal: &Principal) -> Result<(), String> {
        if let Some(agency) = self.0.strip_prefix("tenant:") {
            if principal.agency_id.as_deref() != Some(agency) {
                return Err(format!("not a member of agency {}", agency));
            }
        }
        if let Some(user) = self.0.strip_prefix("user:") {
            if principal.user_id != user {
                return Err("private room of another user".into());
            }
        }
        Ok(())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Room {
    pub room_id: RoomId,
    pub kind: RoomKind,
    pub members: HashMap<String, HashSet<ConnectionId>>,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

impl Room {
    fn new(room_id: RoomId, kind: RoomKind) -> Self {
        Self {
            room_id,
            kind,
            members: HashMap::new(),
            created_at: Utc::now(),
            metadata: None,
        }
    }

    fn fan_out(&self, registry: &ConnectionRegistry, event: &Arc<ServerEvent>, exclude_user: Option<&str>) -> usize {
        let mut delivered = 0;
        for (user_id, connections) in &self.members {
            if exclude_user == Some(user_id.as_str()) {
                continue;
            }
            for connection_id in connections {
                match registry.send_to_connection(connection_id, event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => tracing::debug!(
                        room_id = %self.room_id,
                        error = %e,
                        "Room fan-out skipped a connection"
                    ),
                }
            }
        }
        delivered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub kind: RoomKind,
    pub member_count: usize,
    /// The user was not in the room before this join.
    pub new_member: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub member_count: usize,
    /// The user's last connection in the room left.
    pub member_left: bool,
}

#[derive(Clone)]
pub struct RoomManager {
    rooms: Arc<DashMap<RoomId, Room>>,
    by_connection: Arc<DashMap<ConnectionId, HashSet<RoomId>>>,
    registry: ConnectionRegistry,
}

impl RoomManager {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            by_connection: Arc::new(DashMap::new()),
            registry,
        }
    }

    /// Add a connection's user to a room. Joining twice is a no-op apart
    /// from the returned count. Existing members hear `user_joined_room`
    /// only when the user is new to the room.
    pub fn join(
        &self,
        connection_id: &str,
        user_id: &str,
        room_id: &RoomId,
        kind: Option<RoomKind>,
    ) -> JoinOutcome {
        let outcome = {
            let mut room = self
                .rooms
                .entry(room_id.clone())
                .or_insert_with(|| Room::new(room_id.clone(), kind.unwrap_or_else(|| room_id.kind())));
            let connections = room.members.entry(user_id.to_string()).or_default();
            let new_member = connections.is_empty();
            connections.insert(connection_id.to_string());
            let member_count = room.members.len();

            if new_member {
                let event = Arc::new(ServerEvent::UserJoinedRoom {
                    room_id: room_id.clone(),
                    user_id: user_id.to_string(),
                    member_count,
                });
                room.fan_out(&self.registry, &event, Some(user_id));
            }
            JoinOutcome {
                kind: room.kind,
                member_count,
                new_member,
            }
        };

        self.by_connection
            .entry(connection_id.to_string())
            .or_default()
            .insert(room_id.clone());

        if outcome.new_member {
            tracing::debug!(
                room_id = %room_id,
                user_id = %user_id,
                members = outcome.member_count,
                "User joined room"
            );
        }
        outcome
    }

    /// Remove a connection from a room. `None` if it was not in the room.
    pub fn leave(&self, connection_id: &str, user_id: &str, room_id: &RoomId) -> Option<LeaveOutcome> {
        let (outcome, empty) = {
            let mut room = self.rooms.get_mut(room_id)?;
            let connections = room.members.get_mut(user_id)?;
            if !connections.remove(connection_id) {
                return None;
            }
            let member_left = connections.is_empty();
            if member_left {
                room.members.remove(user_id);
                let event = Arc::new(ServerEvent::UserLeftRoom {
                    room_id: room_id.clone(),
                    user_id: user_id.to_string(),
                    member_count: room.members.len(),
                });
                room.fan_out(&self.registry, &event, None);
            }
            (
                LeaveOutcome {
                    member_count: room.members.len(),
                    member_left,
                },
                room.members.is_empty(),
            )
        };

        if empty {
            // Re-checked under the shard lock; a concurrent join may have won.
            if self.rooms.remove_if(room_id, |_, room| room.members.is_empty()).is_some() {
                tracing::debug!(room_id = %room_id, "Room dropped");
            }
        }

        if let Some(mut rooms) = self.by_connection.get_mut(connection_id) {
            rooms.remove(room_id);
        }
        self.by_connection
            .remove_if(connection_id, |_, rooms| rooms.is_empty());

        Some(outcome)
    }

    /// Send to every connection of every member. Returns connections reached.
    pub fn send_to_room(
        &self,
        room_id: &RoomId,
        event: Arc<ServerEvent>,
        exclude_user: Option<&str>,
    ) -> usize {
        match self.rooms.get_mut(room_id) {
            Some(room) => room.fan_out(&self.registry, &event, exclude_user),
            None => 0,
        }
    }

    pub fn rooms_of(&self, connection_id: &str) -> Vec<RoomId> {
        self.by_connection
            .get(connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_connection_in_room(&self, connection_id: &str, room_id: &RoomId) -> bool {
        self.by_connection
            .get(connection_id)
            .map(|rooms| rooms.contains(room_id))
            .unwrap_or(false)
    }

    pub fn members(&self, room_id: &RoomId) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|room| room.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, room_id: &RoomId) -> usize {
        self.rooms.get(room_id).map(|room| room.members.len()).unwrap_or(0)
    }

    pub fn room(&self, room_id: &RoomId) -> Option<Room> {
        self.rooms.get(room_id).map(|room| room.clone())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::registry::{ConnectionEntry, Outbound};
    use tokio::sync::mpsc;

    struct Client {
        connection_id: String,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    impl Client {
        fn events(&mut self) -> Vec<String> {
            let mut names = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                if let Outbound::Event(event) = frame {
                    names.push(event.name().to_string());
                }
            }
            names
        }
    }

    fn connect(registry: &ConnectionRegistry, user: &str) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = ConnectionEntry::new(user, Some("ag1".into()), tx);
        let connection_id = entry.connection_id.clone();
        registry.register(entry);
        Client { connection_id, rx }
    }

    fn room(raw: &str) -> RoomId {
        RoomId::parse(raw).unwrap()
    }

    #[test]
    fn kind_follows_prefix() {
        assert_eq!(RoomId::tenant("ag1").kind(), RoomKind::Tenant);
        assert_eq!(RoomId::user("u1").kind(), RoomKind::Private);
        assert_eq!(room("project:7").kind(), RoomKind::Project);
        assert_eq!(room("lobby").kind(), RoomKind::Public);
        assert!(RoomId::parse("  ").is_err());
        assert!(RoomId::parse(&"x".repeat(200)).is_err());
    }

    #[test]
    fn reserved_rooms_require_ownership() {
        let principal = Principal {
            user_id: "u1".into(),
            agency_id: Some("ag1".into()),
            role: "member".into(),
        };
        assert!(RoomId::tenant("ag1").authorize(&principal).is_ok());
        assert!(RoomId::tenant("ag2").authorize(&principal).is_err());
        assert!(RoomId::user("u1").authorize(&principal).is_ok());
        assert!(RoomId::user("u2").authorize(&principal).is_err());
        assert!(room("project:1").authorize(&principal).is_ok());
    }

    #[test]
    fn join_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let rooms = RoomManager::new(registry.clone());
        let mut alice = connect(&registry, "alice");
        let mut bob = connect(&registry, "bob");
        let r = room("project:1");

        rooms.join(&bob.connection_id, "bob", &r, None);
        let first = rooms.join(&alice.connection_id, "alice", &r, None);
        let second = rooms.join(&alice.connection_id, "alice", &r, None);

        assert!(first.new_member);
        assert!(!second.new_member);
        assert_eq!(second.member_count, 2);
        assert_eq!(bob.events(), vec!["user_joined_room"]);
        assert!(alice.events().is_empty());
    }

    #[test]
    fn second_tab_keeps_user_in_room() {
        let registry = ConnectionRegistry::new();
        let rooms = RoomManager::new(registry.clone());
        let tab1 = connect(&registry, "alice");
        let tab2 = connect(&registry, "alice");
        let mut bob = connect(&registry, "bob");
        let r = room("project:1");

        rooms.join(&tab1.connection_id, "alice", &r, None);
        rooms.join(&tab2.connection_id, "alice", &r, None);
        rooms.join(&bob.connection_id, "bob", &r, None);

        let out = rooms.leave(&tab1.connection_id, "alice", &r).unwrap();
        assert!(!out.member_left);
        assert!(bob.events().is_empty());

        let out = rooms.leave(&tab2.connection_id, "alice", &r).unwrap();
        assert!(out.member_left);
        assert_eq!(out.member_count, 1);
        assert_eq!(bob.events(), vec!["user_left_room"]);
    }

    #[test]
    fn empty_room_is_dropped() {
        let registry = ConnectionRegistry::new();
        let rooms = RoomManager::new(registry.clone());
        let alice = connect(&registry, "alice");
        let r = room("project:1");

        rooms.join(&alice.connection_id, "alice", &r, Some(RoomKind::Project));
        assert_eq!(rooms.room_count(), 1);
        assert!(rooms.is_connection_in_room(&alice.connection_id, &r));

        rooms.leave(&alice.connection_id, "alice", &r).unwrap();
        assert_eq!(rooms.room_count(), 0);
        assert!(rooms.rooms_of(&alice.connection_id).is_empty());
        assert!(rooms.leave(&alice.connection_id, "alice", &r).is_none());
    }

    #[test]
    fn send_to_room_can_exclude_sender() {
        let registry = ConnectionRegistry::new();
        let rooms = RoomManager::new(registry.clone());
        let mut alice = connect(&registry, "alice");
        let mut bob = connect(&registry, "bob");
        let r = room("lobby");
        rooms.join(&alice.connection_id, "alice", &r, None);
        rooms.join(&bob.connection_id, "bob", &r, None);
        alice.events();
        bob.events();

        let event = ServerEvent::error(500, "x");
        assert_eq!(rooms.send_to_room(&r, event.clone(), Some("alice")), 1);
        assert!(alice.events().is_empty());
        assert_eq!(bob.events(), vec!["error"]);
        assert_eq!(rooms.send_to_room(&room("nowhere"), event, None), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_joins_count_each_user_once() {
        let registry = ConnectionRegistry::new();
        let rooms = RoomManager::new(registry.clone());
        let r = room("project:busy");

        let mut clients = Vec::new();
        for i in 0..20 {
            let user = format!("u{}", i % 10);
            clients.push((user.clone(), connect(&registry, &user)));
        }

        let mut handles = Vec::new();
        for (user, client) in &clients {
            let rooms = rooms.clone();
            let r = r.clone();
            let user = user.clone();
            let connection_id = client.connection_id.clone();
            handles.push(tokio::spawn(async move {
                rooms.join(&connection_id, &user, &r, None).new_member
            }));
        }

        let mut new_members = 0;
        for handle in handles {
            if handle.await.unwrap() {
                new_members += 1;
            }
        }
        assert_eq!(new_members, 10);
        assert_eq!(rooms.member_count(&r), 10);
    }
}
