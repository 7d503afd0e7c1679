//! User presence: online/offline transitions and custom statuses.
//!
//! Presence is broadcast to the user's tenant room. `online` goes out only
//! on a user's first connection and `offline` only after the last one
//! closes; status updates in between are broadcast as they arrive.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::Principal;
use crate::rooms::{RoomId, RoomManager};
use crate::state::AppState;
use crate::ws::protocol::ServerEvent;
use crate::ws::registry::ConnectionRegistry;

/// Longest custom status message kept.
const MAX_STATUS_MESSAGE_LEN: usize = 140;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

#[derive(Debug, Clone)]
struct UserStatus {
    agency_id: Option<String>,
    status: PresenceStatus,
    message: Option<String>,
    since: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub user_id: String,
    pub agency_id: Option<String>,
    pub status: PresenceStatus,
    pub message: Option<String>,
    pub since: DateTime<Utc>,
    pub connections: usize,
}

#[derive(Clone)]
pub struct PresenceTracker {
    statuses: Arc<DashMap<String, UserStatus>>,
    rooms: RoomManager,
    registry: ConnectionRegistry,
}

impl PresenceTracker {
    pub fn new(rooms: RoomManager, registry: ConnectionRegistry) -> Self {
        Self {
            statuses: Arc::new(DashMap::new()),
            rooms,
            registry,
        }
    }

    /// First connection of a user came up.
    ///
    /// Transitions are applied and announced while holding the user's status
    /// entry, and only if the registry still agrees, so a racing
    /// [`disconnected`](Self::disconnected) from an older socket cannot
    /// leave a connected user marked offline.
    pub fn connected(&self, principal: &Principal) -> bool {
        let entry = self.statuses.entry(principal.user_id.clone());
        if !self.registry.is_online(&principal.user_id) {
            tracing::debug!(user_id = %principal.user_id, "Online transition superseded");
            return false;
        }
        let since = Utc::now();
        let _status = entry.insert(UserStatus {
            agency_id: principal.agency_id.clone(),
            status: PresenceStatus::Online,
            message: None,
            since,
        });
        self.announce(
            &principal.user_id,
            principal.agency_id.as_deref(),
            PresenceStatus::Online,
            None,
            since,
        );
        tracing::info!(user_id = %principal.user_id, "User online");
        true
    }

    /// Last connection of a user went away. Ignored when the user has
    /// reconnected in the meantime.
    pub fn disconnected(&self, user_id: &str, agency_id: Option<&str>) -> bool {
        let entry = self.statuses.entry(user_id.to_string());
        if self.registry.is_online(user_id) {
            tracing::debug!(user_id = %user_id, "Offline transition superseded");
            return false;
        }
        self.announce(user_id, agency_id, PresenceStatus::Offline, None, Utc::now());
        if let Entry::Occupied(status) = entry {
            status.remove();
        }
        tracing::info!(user_id = %user_id, "User offline");
        true
    }

    /// Custom status. `offline` here means "appear offline" and does not
    /// remove the user from the online list of their own connections.
    pub fn set_status(&self, principal: &Principal, status: PresenceStatus, message: Option<String>) {
        let message = message
            .map(|m| m.trim().chars().take(MAX_STATUS_MESSAGE_LEN).collect::<String>())
            .filter(|m| !m.is_empty());
        let since = Utc::now();
        self.statuses.insert(
            principal.user_id.clone(),
            UserStatus {
                agency_id: principal.agency_id.clone(),
                status,
                message: message.clone(),
                since,
            },
        );
        self.announce(
            &principal.user_id,
            principal.agency_id.as_deref(),
            status,
            message,
            since,
        );
    }

    pub fn status_of(&self, user_id: &str) -> Option<PresenceStatus> {
        self.statuses.get(user_id).map(|s| s.status)
    }

    /// Users with at least one live connection, optionally limited to one
    /// agency. Sorted by user id.
    pub fn online_users(&self, agency_id: Option<&str>) -> Vec<OnlineUser> {
        let mut users: Vec<OnlineUser> = self
            .statuses
            .iter()
            .filter(|s| agency_id.is_none() || s.agency_id.as_deref() == agency_id)
            .filter_map(|s| {
                let connections = self.registry.connections_of(s.key()).len();
                (connections > 0).then(|| OnlineUser {
                    user_id: s.key().clone(),
                    agency_id: s.agency_id.clone(),
                    status: s.status,
                    message: s.message.clone(),
                    since: s.since,
                    connections,
                })
            })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    fn announce(
        &self,
        user_id: &str,
        agency_id: Option<&str>,
        status: PresenceStatus,
        message: Option<String>,
        changed_at: DateTime<Utc>,
    ) {
        let Some(agency_id) = agency_id else {
            return;
        };
        let event = Arc::new(ServerEvent::UserStatusChanged {
            user_id: user_id.to_string(),
            agency_id: Some(agency_id.to_string()),
            status,
            message,
            changed_at,
        });
        self.rooms
            .send_to_room(&RoomId::tenant(agency_id), event, Some(user_id));
    }
}

#[derive(Debug, Deserialize)]
pub struct OnlineQuery {
    pub agency_id: Option<String>,
}

/// GET /api/presence/online — Online users of the caller's agency.
pub async fn get_online_users(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<OnlineQuery>,
) -> Result<Json<Vec<OnlineUser>>, (StatusCode, String)> {
    let agency_id = match (&principal.agency_id, query.agency_id) {
        (Some(own), Some(requested)) if own != &requested => {
            return Err((StatusCode::FORBIDDEN, "foreign agency".to_string()));
        }
        (own, _) => own.clone(),
    };
    Ok(Json(state.presence.online_users(agency_id.as_deref())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::registry::{ConnectionEntry, Outbound};
    use tokio::sync::mpsc;

    fn principal(user: &str, agency: &str) -> Principal {
        Principal {
            user_id: user.into(),
            agency_id: Some(agency.into()),
            role: "member".into(),
        }
    }

    fn setup() -> (ConnectionRegistry, RoomManager, PresenceTracker) {
        let registry = ConnectionRegistry::new();
        let rooms = RoomManager::new(registry.clone());
        let presence = PresenceTracker::new(rooms.clone(), registry.clone());
        (registry, rooms, presence)
    }

    fn join_tenant(
        registry: &ConnectionRegistry,
        rooms: &RoomManager,
        p: &Principal,
    ) -> (String, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = ConnectionEntry::new(p.user_id.clone(), p.agency_id.clone(), tx);
        let id = entry.connection_id.clone();
        registry.register(entry);
        rooms.join(&id, &p.user_id, &RoomId::tenant(p.agency_id.as_deref().unwrap()), None);
        (id, rx)
    }

    fn statuses(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<(String, PresenceStatus)> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Event(event) = frame {
                if let ServerEvent::UserStatusChanged { user_id, status, .. } = event.as_ref() {
                    out.push((user_id.clone(), *status));
                }
            }
        }
        out
    }

    #[test]
    fn transitions_reach_tenant_only() {
        let (registry, rooms, presence) = setup();
        let alice = principal("alice", "ag1");
        let bob = principal("bob", "ag1");
        let carol = principal("carol", "ag2");
        let (_, mut bob_rx) = join_tenant(&registry, &rooms, &bob);
        let (_, mut carol_rx) = join_tenant(&registry, &rooms, &carol);
        let (alice_conn, _alice_rx) = join_tenant(&registry, &rooms, &alice);

        assert!(presence.connected(&alice));
        presence.set_status(&alice, PresenceStatus::Busy, Some("  in a call ".into()));
        assert!(registry.unregister(&alice_conn).unwrap().last);
        assert!(presence.disconnected("alice", Some("ag1")));

        assert_eq!(
            statuses(&mut bob_rx),
            vec![
                ("alice".to_string(), PresenceStatus::Online),
                ("alice".to_string(), PresenceStatus::Busy),
                ("alice".to_string(), PresenceStatus::Offline),
            ]
        );
        assert!(statuses(&mut carol_rx).is_empty());
        assert_eq!(presence.status_of("alice"), None);
    }

    #[test]
    fn online_users_are_scoped_by_agency() {
        let (registry, rooms, presence) = setup();
        let alice = principal("alice", "ag1");
        let carol = principal("carol", "ag2");
        let _a = join_tenant(&registry, &rooms, &alice);
        let _c = join_tenant(&registry, &rooms, &carol);
        presence.connected(&alice);
        presence.connected(&carol);
        presence.set_status(&alice, PresenceStatus::Away, None);

        let ag1 = presence.online_users(Some("ag1"));
        assert_eq!(ag1.len(), 1);
        assert_eq!(ag1[0].user_id, "alice");
        assert_eq!(ag1[0].status, PresenceStatus::Away);
        assert_eq!(ag1[0].connections, 1);
        assert_eq!(presence.online_users(None).len(), 2);
    }

    #[test]
    fn stale_offline_after_reload_is_ignored() {
        let (registry, rooms, presence) = setup();
        let alice = principal("alice", "ag1");
        let bob = principal("bob", "ag1");
        let (_, mut bob_rx) = join_tenant(&registry, &rooms, &bob);
        let (old_conn, _old_rx) = join_tenant(&registry, &rooms, &alice);
        presence.connected(&alice);

        // The old socket's teardown sees its last connection go, then the
        // reloaded page registers and announces before the teardown does.
        assert!(registry.unregister(&old_conn).unwrap().last);
        let (_new_conn, _new_rx) = join_tenant(&registry, &rooms, &alice);
        assert!(presence.connected(&alice));
        assert!(!presence.disconnected("alice", Some("ag1")));

        assert_eq!(presence.status_of("alice"), Some(PresenceStatus::Online));
        let online = presence.online_users(Some("ag1"));
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].user_id, "alice");
        assert_eq!(
            statuses(&mut bob_rx),
            vec![
                ("alice".to_string(), PresenceStatus::Online),
                ("alice".to_string(), PresenceStatus::Online),
            ]
        );
    }

    #[test]
    fn online_after_connection_already_gone_is_ignored() {
        let (registry, rooms, presence) = setup();
        let alice = principal("alice", "ag1");
        let bob = principal("bob", "ag1");
        let (_, mut bob_rx) = join_tenant(&registry, &rooms, &bob);
        let (conn, _rx) = join_tenant(&registry, &rooms, &alice);

        // The socket closed before its online transition ran.
        assert!(registry.unregister(&conn).unwrap().last);
        assert!(presence.disconnected("alice", Some("ag1")));
        assert!(!presence.connected(&alice));

        assert_eq!(presence.status_of("alice"), None);
        assert_eq!(
            statuses(&mut bob_rx),
            vec![("alice".to_string(), PresenceStatus::Offline)]
        );
    }
}
