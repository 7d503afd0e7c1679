//! Error taxonomy for the real-time core.
//!
//! Each failure class has its own type so callers can tell a rejected
//! handshake from a dropped socket, a feed outage, a failed write or a
//! single undeliverable recipient.

use axum::http::StatusCode;
use thiserror::Error;

/// Handshake rejected. No connection state is created.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing auth token")]
    MissingToken,
    #[error("token expired")]
    Expired,
    #[error("token invalid: {0}")]
    Invalid(String),
}

impl AuthError {
    /// WebSocket close code sent back before the socket is dropped.
    pub fn close_code(&self) -> u16 {
        match self {
            AuthError::Expired => 4001,
            AuthError::MissingToken | AuthError::Invalid(_) => 4002,
        }
    }
}

/// Transport-level failure on a live socket. Always treated as a disconnect.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection {0} is closed")]
    Closed(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Event-source subscription failure.
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
    #[error("subscribe failed: {0}")]
    Connect(String),
    #[error("subscriber lagged behind by {0} events")]
    Lagged(u64),
    #[error("event source closed")]
    Closed,
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<SubscriptionError>,
    },
}

/// Failed read or write against the persistent store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database lock poisoned")]
    Lock,
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("corrupt column {column}: {reason}")]
    Corrupt { column: &'static str, reason: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid input: {0}")]
    Invalid(String),
}

impl PersistenceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PersistenceError::NotFound(_) => StatusCode::NOT_FOUND,
            PersistenceError::Invalid(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Map to the `(StatusCode, String)` rejection used by the REST handlers.
    pub fn into_rejection(self) -> (StatusCode, String) {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Persistence failure");
        }
        (status, self.to_string())
    }
}

/// Delivery to one recipient failed. Never aborts delivery to the others.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("connection {connection_id} is gone")]
    ConnectionGone { connection_id: String },
    #[error("push endpoint {endpoint} rejected delivery with status {status}")]
    PushRejected { endpoint: String, status: u16 },
    #[error("push endpoint {endpoint} unreachable: {reason}")]
    PushUnreachable { endpoint: String, reason: String },
    #[error("{channel} channel failed: {reason}")]
    Channel {
        channel: &'static str,
        reason: String,
    },
}

impl DeliveryError {
    /// The push service reported the subscription as permanently gone.
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            DeliveryError::PushRejected { status: 404 | 410, .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_close_codes() {
        assert_eq!(AuthError::Expired.close_code(), 4001);
        assert_eq!(AuthError::Invalid("bad".into()).close_code(), 4002);
        assert_eq!(AuthError::MissingToken.close_code(), 4002);
    }

    #[test]
    fn gone_push_statuses() {
        let gone = DeliveryError::PushRejected {
            endpoint: "e".into(),
            status: 410,
        };
        let throttled = DeliveryError::PushRejected {
            endpoint: "e".into(),
            status: 429,
        };
        assert!(gone.is_gone());
        assert!(!throttled.is_gone());
    }
}
