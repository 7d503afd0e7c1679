//! Connection registry: every live socket, indexed by connection and by user.
//!
//! A user may hold many connections (tabs, devices); a connection belongs to
//! exactly one user. Both maps are only mutated through this type. Lock order
//! is always `by_user` before `connections`, and register/unregister hold the
//! user's `by_user` entry while touching `connections`, so first-connection
//! and last-connection transitions are decided exactly once.

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::DeliveryError;
use crate::ws::protocol::ServerEvent;

pub type ConnectionId = String;

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(Arc<ServerEvent>),
    Ping(Bytes),
    Pong(Bytes),
    Close { code: u16, reason: String },
}

/// Sender half of a connection's outbound queue.
pub type ConnectionSender = mpsc::UnboundedSender<Outbound>;

#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub agency_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: Instant,
    pub user_agent: Option<String>,
    pub remote_address: Option<SocketAddr>,
    pub sender: ConnectionSender,
}

impl ConnectionEntry {
    pub fn new(
        user_id: impl Into<String>,
        agency_id: Option<String>,
        sender: ConnectionSender,
    ) -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            agency_id,
            connected_at: Utc::now(),
            last_activity_at: Instant::now(),
            user_agent: None,
            remote_address: None,
            sender,
        }
    }
}

/// Result of removing a connection.
#[derive(Debug)]
pub struct Unregistered {
    pub entry: ConnectionEntry,
    /// The user has no connections left.
    pub last: bool,
}

#[derive(Default)]
struct Inner {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    by_user: DashMap<String, HashSet<ConnectionId>>,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Returns true if it is the user's first.
    pub fn register(&self, entry: ConnectionEntry) -> bool {
        let mut ids = self.inner.by_user.entry(entry.user_id.clone()).or_default();
        let first = ids.is_empty();
        ids.insert(entry.connection_id.clone());
        tracing::debug!(
            user_id = %entry.user_id,
            connection_id = %entry.connection_id,
            connections = ids.len(),
            "Connection registered"
        );
        self.inner
            .connections
            .insert(entry.connection_id.clone(), entry);
        first
    }

    /// Remove a connection. `None` if it was already gone.
    pub fn unregister(&self, connection_id: &str) -> Option<Unregistered> {
        let user_id = self.inner.connections.get(connection_id)?.user_id.clone();
        match self.inner.by_user.entry(user_id) {
            Entry::Occupied(mut ids) => {
                let (_, entry) = self.inner.connections.remove(connection_id)?;
                ids.get_mut().remove(connection_id);
                let last = ids.get().is_empty();
                if last {
                    ids.remove();
                }
                tracing::debug!(
                    user_id = %entry.user_id,
                    connection_id = %connection_id,
                    last,
                    "Connection unregistered"
                );
                Some(Unregistered { entry, last })
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Refresh a connection's activity timestamp.
    pub fn heartbeat(&self, connection_id: &str) -> bool {
        match self.inner.connections.get_mut(connection_id) {
            Some(mut entry) => {
                entry.last_activity_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Connections idle for longer than `timeout`.
    pub fn stale_connections(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        self.inner
            .connections
            .iter()
            .filter(|e| now.saturating_duration_since(e.last_activity_at) > timeout)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn connection(&self, connection_id: &str) -> Option<ConnectionEntry> {
        self.inner.connections.get(connection_id).map(|e| e.clone())
    }

    pub fn connections_of(&self, user_id: &str) -> Vec<ConnectionId> {
        self.inner
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn send_to_connection(
        &self,
        connection_id: &str,
        event: Arc<ServerEvent>,
    ) -> Result<(), DeliveryError> {
        self.send_outbound(connection_id, Outbound::Event(event))
    }

    pub(crate) fn send_outbound(
        &self,
        connection_id: &str,
        frame: Outbound,
    ) -> Result<(), DeliveryError> {
        let gone = || DeliveryError::ConnectionGone {
            connection_id: connection_id.to_string(),
        };
        let entry = self.inner.connections.get(connection_id).ok_or_else(gone)?;
        entry.sender.send(frame).map_err(|_| gone())
    }

    /// Send to every connection of a user. Returns how many accepted it.
    pub fn send_to_user(&self, user_id: &str, event: Arc<ServerEvent>) -> usize {
        self.connections_of(user_id)
            .iter()
            .filter(|id| self.send_to_connection(id, event.clone()).is_ok())
            .count()
    }

    /// Send to every live connection.
    pub fn broadcast(&self, event: Arc<ServerEvent>) -> usize {
        self.inner
            .connections
            .iter()
            .filter(|e| e.sender.send(Outbound::Event(event.clone())).is_ok())
            .count()
    }

    /// Ask a connection's writer to close the socket.
    pub fn close_connection(&self, connection_id: &str, code: u16, reason: &str) -> bool {
        self.send_outbound(
            connection_id,
            Outbound::Close {
                code,
                reason: reason.to_string(),
            },
        )
        .is_ok()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner
            .by_user
            .get(user_id)
            .map(|ids| !ids.is_empty())
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn user_count(&self) -> usize {
        self.inner.by_user.len()
    }
}
