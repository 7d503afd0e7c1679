use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking — no migration table needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "-- Migration 1: Notification records

-- seq gives a total arrival order; created_at alone can tie.
CREATE TABLE notifications (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    type TEXT NOT NULL,
    title TEXT NOT NULL,
    message TEXT NOT NULL,
    data TEXT NOT NULL DEFAULT '{}',
    user_id TEXT,
    agency_id TEXT,
    priority TEXT NOT NULL,
    channels TEXT NOT NULL DEFAULT '[\"in_app\"]',
    read INTEGER NOT NULL DEFAULT 0,
    read_at TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT,
    action_url TEXT,
    action_label TEXT,
    idempotency_key TEXT
);

-- Idempotency keys are scoped to one recipient in one agency.
CREATE UNIQUE INDEX idx_notifications_idempotency
    ON notifications(COALESCE(agency_id, ''), COALESCE(user_id, ''), idempotency_key)
    WHERE idempotency_key IS NOT NULL;

CREATE INDEX idx_notifications_user ON notifications(user_id, agency_id, read);
CREATE INDEX idx_notifications_agency ON notifications(agency_id, read, created_at);
",
        ),
        M::up(
            "-- Migration 2: Push subscriptions

CREATE TABLE push_subscriptions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    agency_id TEXT,
    endpoint TEXT NOT NULL,
    p256dh TEXT NOT NULL,
    auth TEXT NOT NULL,
    device_type TEXT NOT NULL DEFAULT 'desktop',
    browser TEXT,
    os TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    notification_types TEXT NOT NULL,
    quiet_start TEXT,
    quiet_end TEXT,
    timezone TEXT NOT NULL DEFAULT 'UTC',
    is_active INTEGER NOT NULL DEFAULT 1,
    failure_count INTEGER NOT NULL DEFAULT 0,
    last_used_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (user_id, endpoint)
);

CREATE INDEX idx_push_user ON push_subscriptions(user_id, is_active);
CREATE INDEX idx_push_agency ON push_subscriptions(agency_id, is_active);
",
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_valid() {
        assert!(migrations().validate().is_ok());
    }
}
