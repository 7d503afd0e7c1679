//! SQLite implementation of [`NotificationStore`].
//!
//! rusqlite is synchronous, so every call runs under `spawn_blocking` while
//! holding the shared connection mutex. Feed publication happens after the
//! blocking section returns.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;

use super::{InsertOutcome, ListQuery, NotificationStore};
use crate::db::DbPool;
use crate::error::PersistenceError;
use crate::notify::feed::{ChangeFeed, FeedOp};
use crate::notify::model::{
    FeedFilter, NewNotification, NotificationRecord, NotificationType, SubscriptionKey,
};
use crate::push::model::{
    parse_hhmm, parse_timezone, DeviceInfo, DeviceType, NewPushSubscription, PushKeys,
    PushPreferences, PushSubscription, QuietHours,
};

const NOTIFICATION_COLUMNS: &str = "id, type, title, message, data, user_id, agency_id, \
     priority, channels, read, read_at, created_at, expires_at, action_url, action_label";

const PUSH_COLUMNS: &str = "id, user_id, agency_id, endpoint, p256dh, auth, device_type, \
     browser, os, enabled, notification_types, quiet_start, quiet_end, timezone, is_active, \
     failure_count, last_used_at, created_at, updated_at";

/// Fixed-width RFC 3339 so lexical order equals chronological order.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion(idx: usize, reason: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, reason.into())
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e.to_string()))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<NotificationRecord> {
    let kind: String = row.get(1)?;
    let data: String = row.get(4)?;
    let priority: String = row.get(7)?;
    let channels: String = row.get(8)?;
    let read_at: Option<String> = row.get(10)?;
    let created_at: String = row.get(11)?;
    let expires_at: Option<String> = row.get(12)?;

    Ok(NotificationRecord {
        id: row.get(0)?,
        kind: kind.parse().map_err(|e: String| conversion(1, e))?,
        title: row.get(2)?,
        message: row.get(3)?,
        data: serde_json::from_str(&data).map_err(|e| conversion(4, e.to_string()))?,
        user_id: row.get(5)?,
        agency_id: row.get(6)?,
        priority: priority.parse().map_err(|e: String| conversion(7, e))?,
        channels: serde_json::from_str(&channels).map_err(|e| conversion(8, e.to_string()))?,
        read: row.get(9)?,
        read_at: read_at.map(|raw| parse_ts(10, raw)).transpose()?,
        created_at: parse_ts(11, created_at)?,
        expires_at: expires_at.map(|raw| parse_ts(12, raw)).transpose()?,
        action_url: row.get(13)?,
        action_label: row.get(14)?,
    })
}

fn row_to_push(row: &Row<'_>) -> rusqlite::Result<PushSubscription> {
    let device_type: String = row.get(6)?;
    let types: String = row.get(10)?;
    let quiet_start: Option<String> = row.get(11)?;
    let quiet_end: Option<String> = row.get(12)?;
    let failure_count: i64 = row.get(15)?;
    let last_used_at: Option<String> = row.get(16)?;
    let created_at: String = row.get(17)?;
    let updated_at: String = row.get(18)?;

    let quiet_hours = match (quiet_start, quiet_end) {
        (Some(start), Some(end)) => Some(QuietHours {
            start: parse_hhmm(&start).map_err(|e| conversion(11, e))?,
            end: parse_hhmm(&end).map_err(|e| conversion(12, e))?,
        }),
        _ => None,
    };

    Ok(PushSubscription {
        id: row.get(0)?,
        user_id: row.get(1)?,
        agency_id: row.get(2)?,
        endpoint: row.get(3)?,
        keys: PushKeys {
            p256dh: row.get(4)?,
            auth: row.get(5)?,
        },
        device: DeviceInfo {
            device_type: DeviceType::parse(&device_type),
            browser: row.get(7)?,
            os: row.get(8)?,
        },
        enabled: row.get(9)?,
        notification_types: serde_json::from_str(&types)
            .map_err(|e| conversion(10, e.to_string()))?,
        quiet_hours,
        timezone: row.get(13)?,
        is_active: row.get(14)?,
        failure_count: failure_count.max(0) as u32,
        last_used_at: last_used_at.map(|raw| parse_ts(16, raw)).transpose()?,
        created_at: parse_ts(17, created_at)?,
        updated_at: parse_ts(18, updated_at)?,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, PersistenceError> {
    serde_json::to_string(value).map_err(|e| PersistenceError::Invalid(e.to_string()))
}

/// WHERE-clause builder with positional arguments.
#[derive(Default)]
struct Clause {
    parts: Vec<String>,
    args: Vec<Value>,
}

impl Clause {
    fn push(&mut self, sql: impl Into<String>, args: impl IntoIterator<Item = Value>) {
        self.parts.push(sql.into());
        self.args.extend(args);
    }

    /// Same visibility rule as [`FeedFilter::matches`].
    fn key(&mut self, key: &SubscriptionKey) {
        let user = Value::Text(key.user_id.clone());
        match &key.agency_id {
            Some(agency) => self.push(
                "((user_id = ? AND agency_id = ?) OR (user_id IS NULL AND agency_id = ?))",
                [user, Value::Text(agency.clone()), Value::Text(agency.clone())],
            ),
            None => self.push("user_id = ?", [user]),
        }
    }

    fn types(&mut self, types: &BTreeSet<NotificationType>) {
        if types.is_empty() {
            return;
        }
        let placeholders = vec!["?"; types.len()].join(", ");
        self.push(
            format!("type IN ({})", placeholders),
            types.iter().map(|t| Value::Text(t.as_str().to_string())),
        );
    }

    fn sql(&self) -> String {
        if self.parts.is_empty() {
            "1 = 1".to_string()
        } else {
            self.parts.join(" AND ")
        }
    }
}

fn fetch_record(conn: &Connection, id: &str) -> Result<NotificationRecord, PersistenceError> {
    conn.query_row(
        &format!("SELECT {} FROM notifications WHERE id = ?1", NOTIFICATION_COLUMNS),
        params![id],
        row_to_record,
    )
    .optional()?
    .ok_or_else(|| PersistenceError::NotFound(format!("notification {}", id)))
}

fn fetch_push(conn: &Connection, id: &str) -> Result<PushSubscription, PersistenceError> {
    conn.query_row(
        &format!("SELECT {} FROM push_subscriptions WHERE id = ?1", PUSH_COLUMNS),
        params![id],
        row_to_push,
    )
    .optional()?
    .ok_or_else(|| PersistenceError::NotFound(format!("push subscription {}", id)))
}

fn query_records(
    conn: &Connection,
    sql: &str,
    args: Vec<Value>,
) -> Result<Vec<NotificationRecord>, PersistenceError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(args), row_to_record)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// SQLite-backed store that publishes its writes on a [`ChangeFeed`].
#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
    feed: ChangeFeed,
}

impl SqliteStore {
    pub fn new(db: DbPool, feed: ChangeFeed) -> Self {
        Self { db, feed }
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(&Connection) -> Result<T, PersistenceError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| PersistenceError::Lock)?;
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl NotificationStore for SqliteStore {
    async fn insert_notification(
        &self,
        new: NewNotification,
    ) -> Result<InsertOutcome, PersistenceError> {
        let outcome = self
            .with_conn(move |conn| {
                if let Some(key) = &new.idempotency_key {
                    let existing = conn
                        .query_row(
                            &format!(
                                "SELECT {} FROM notifications
                                 WHERE idempotency_key = ?1 AND agency_id IS ?2 AND user_id IS ?3",
                                NOTIFICATION_COLUMNS
                            ),
                            params![key, new.agency_id, new.user_id],
                            row_to_record,
                        )
                        .optional()?;
                    if let Some(record) = existing {
                        return Ok(InsertOutcome {
                            record,
                            created: false,
                        });
                    }
                }

                let id = uuid::Uuid::now_v7().to_string();
                conn.execute(
                    "INSERT INTO notifications (id, type, title, message, data, user_id, agency_id,
                        priority, channels, read, created_at, expires_at, action_url, action_label,
                        idempotency_key)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11, ?12, ?13, ?14)",
                    params![
                        id,
                        new.kind.as_str(),
                        new.title,
                        new.message,
                        to_json(&new.data)?,
                        new.user_id,
                        new.agency_id,
                        new.priority.as_str(),
                        to_json(&new.channels)?,
                        ts(Utc::now()),
                        new.expires_at.map(ts),
                        new.action_url,
                        new.action_label,
                        new.idempotency_key,
                    ],
                )?;

                Ok(InsertOutcome {
                    record: fetch_record(conn, &id)?,
                    created: true,
                })
            })
            .await?;

        if outcome.created {
            self.feed.publish(FeedOp::Insert, outcome.record.clone());
        }
        Ok(outcome)
    }

    async fn get_notification(&self, id: &str) -> Result<NotificationRecord, PersistenceError> {
        let id = id.to_string();
        self.with_conn(move |conn| fetch_record(conn, &id)).await
    }

    async fn list_notifications(
        &self,
        key: &SubscriptionKey,
        query: ListQuery,
    ) -> Result<Vec<NotificationRecord>, PersistenceError> {
        let mut clause = Clause::default();
        clause.key(key);
        if query.unread_only {
            clause.push("read = 0", []);
        }
        if let Some(before) = query.before_id {
            clause.push(
                "seq < (SELECT seq FROM notifications WHERE id = ?)",
                [Value::Text(before)],
            );
        }
        let sql = format!(
            "SELECT {} FROM notifications WHERE {} ORDER BY seq DESC LIMIT {}",
            NOTIFICATION_COLUMNS,
            clause.sql(),
            query.limit.max(1)
        );
        let args = clause.args;
        self.with_conn(move |conn| query_records(conn, &sql, args))
            .await
    }

    async fn recent_unread(
        &self,
        filter: &FeedFilter,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, PersistenceError> {
        let mut clause = Clause::default();
        clause.push("read = 0", []);
        clause.push(
            "(expires_at IS NULL OR expires_at > ?)",
            [Value::Text(ts(Utc::now()))],
        );
        if let Some(key) = &filter.key {
            clause.key(key);
        }
        clause.types(&filter.types);
        let sql = format!(
            "SELECT {} FROM notifications WHERE {} ORDER BY seq DESC LIMIT {}",
            NOTIFICATION_COLUMNS,
            clause.sql(),
            limit
        );
        let args = clause.args;
        let mut records = self
            .with_conn(move |conn| query_records(conn, &sql, args))
            .await?;
        records.reverse();
        Ok(records)
    }

    async fn mark_read(&self, id: &str) -> Result<NotificationRecord, PersistenceError> {
        let id = id.to_string();
        let (record, changed) = self
            .with_conn(move |conn| {
                let changed = conn.execute(
                    "UPDATE notifications SET read = 1, read_at = ?2 WHERE id = ?1 AND read = 0",
                    params![id, ts(Utc::now())],
                )?;
                Ok((fetch_record(conn, &id)?, changed > 0))
            })
            .await?;

        if changed {
            self.feed.publish(FeedOp::Update, record.clone());
        }
        Ok(record)
    }

    async fn mark_all_read(&self, key: &SubscriptionKey) -> Result<usize, PersistenceError> {
        let mut clause = Clause::default();
        clause.push("read = 0", []);
        clause.key(key);
        let where_sql = clause.sql();
        let args = clause.args;

        let updated = self
            .with_conn(move |conn| {
                let select = format!(
                    "SELECT {} FROM notifications WHERE {} ORDER BY seq ASC",
                    NOTIFICATION_COLUMNS, where_sql
                );
                let mut records = query_records(conn, &select, args.clone())?;
                if records.is_empty() {
                    return Ok(records);
                }

                let now = Utc::now();
                let mut update_args = vec![Value::Text(ts(now))];
                update_args.extend(args);
                conn.execute(
                    &format!(
                        "UPDATE notifications SET read = 1, read_at = ? WHERE {}",
                        where_sql
                    ),
                    params_from_iter(update_args),
                )?;

                for record in records.iter_mut() {
                    record.read = true;
                    record.read_at = Some(now);
                }
                Ok(records)
            })
            .await?;

        let count = updated.len();
        for record in updated {
            self.feed.publish(FeedOp::Update, record);
        }
        Ok(count)
    }

    async fn delete_old_read(
        &self,
        agency_id: Option<&str>,
        older_than_days: u32,
    ) -> Result<usize, PersistenceError> {
        let cutoff = ts(Utc::now() - Duration::days(i64::from(older_than_days)));
        let agency = agency_id.map(str::to_string);
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM notifications
                 WHERE read = 1 AND created_at < ?1 AND (?2 IS NULL OR agency_id = ?2)",
                params![cutoff, agency],
            )?;
            Ok(deleted)
        })
        .await
    }

    async fn upsert_push_subscription(
        &self,
        new: NewPushSubscription,
    ) -> Result<PushSubscription, PersistenceError> {
        new.validate()?;
        self.with_conn(move |conn| {
            let now = ts(Utc::now());
            let types = new
                .notification_types
                .clone()
                .unwrap_or_else(|| NotificationType::ALL.into_iter().collect());
            let quiet_start = new.quiet_hours.map(|q| q.start.format("%H:%M").to_string());
            let quiet_end = new.quiet_hours.map(|q| q.end.format("%H:%M").to_string());

            conn.execute(
                "INSERT INTO push_subscriptions (id, user_id, agency_id, endpoint, p256dh, auth,
                    device_type, browser, os, enabled, notification_types, quiet_start, quiet_end,
                    timezone, is_active, failure_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?11, ?12, ?13, 1, 0, ?14, ?14)
                 ON CONFLICT (user_id, endpoint) DO UPDATE SET
                    agency_id = excluded.agency_id,
                    p256dh = excluded.p256dh,
                    auth = excluded.auth,
                    device_type = excluded.device_type,
                    browser = excluded.browser,
                    os = excluded.os,
                    enabled = 1,
                    notification_types = excluded.notification_types,
                    quiet_start = excluded.quiet_start,
                    quiet_end = excluded.quiet_end,
                    timezone = excluded.timezone,
                    is_active = 1,
                    failure_count = 0,
                    updated_at = excluded.updated_at",
                params![
                    uuid::Uuid::now_v7().to_string(),
                    new.user_id,
                    new.agency_id,
                    new.endpoint,
                    new.keys.p256dh,
                    new.keys.auth,
                    new.device.device_type.as_str(),
                    new.device.browser,
                    new.device.os,
                    to_json(&types)?,
                    quiet_start,
                    quiet_end,
                    new.timezone.clone().unwrap_or_else(|| "UTC".to_string()),
                    now,
                ],
            )?;

            let id: String = conn.query_row(
                "SELECT id FROM push_subscriptions WHERE user_id = ?1 AND endpoint = ?2",
                params![new.user_id, new.endpoint],
                |row| row.get(0),
            )?;
            fetch_push(conn, &id)
        })
        .await
    }

    async fn get_push_subscription(&self, id: &str) -> Result<PushSubscription, PersistenceError> {
        let id = id.to_string();
        self.with_conn(move |conn| fetch_push(conn, &id)).await
    }

    async fn update_push_preferences(
        &self,
        id: &str,
        prefs: PushPreferences,
    ) -> Result<PushSubscription, PersistenceError> {
        if let Some(tz) = &prefs.timezone {
            parse_timezone(tz)?;
        }
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut sub = fetch_push(conn, &id)?;
            if let Some(enabled) = prefs.enabled {
                sub.enabled = enabled;
            }
            if let Some(types) = prefs.notification_types {
                sub.notification_types = types;
            }
            if let Some(quiet) = prefs.quiet_hours {
                sub.quiet_hours = quiet;
            }
            if let Some(tz) = prefs.timezone {
                sub.timezone = tz;
            }

            conn.execute(
                "UPDATE push_subscriptions SET enabled = ?2, notification_types = ?3,
                    quiet_start = ?4, quiet_end = ?5, timezone = ?6, updated_at = ?7
                 WHERE id = ?1",
                params![
                    id,
                    sub.enabled,
                    to_json(&sub.notification_types)?,
                    sub.quiet_hours.map(|q| q.start.format("%H:%M").to_string()),
                    sub.quiet_hours.map(|q| q.end.format("%H:%M").to_string()),
                    sub.timezone,
                    ts(Utc::now()),
                ],
            )?;
            fetch_push(conn, &id)
        })
        .await
    }

    async fn disable_push_subscription(&self, id: &str) -> Result<(), PersistenceError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE push_subscriptions SET enabled = 0, updated_at = ?2 WHERE id = ?1",
                params![id, ts(Utc::now())],
            )?;
            if changed == 0 {
                return Err(PersistenceError::NotFound(format!("push subscription {}", id)));
            }
            Ok(())
        })
        .await
    }

    async fn push_targets(
        &self,
        user_id: Option<&str>,
        agency_id: Option<&str>,
    ) -> Result<Vec<PushSubscription>, PersistenceError> {
        let user = user_id.map(str::to_string);
        let agency = agency_id.map(str::to_string);
        self.with_conn(move |conn| {
            let (sql, args) = match (user, agency) {
                (Some(user), agency) => (
                    format!(
                        "SELECT {} FROM push_subscriptions
                         WHERE user_id = ?1 AND is_active = 1 AND enabled = 1
                           AND (?2 IS NULL OR agency_id IS NULL OR agency_id = ?2)",
                        PUSH_COLUMNS
                    ),
                    vec![Value::Text(user), agency.map(Value::Text).unwrap_or(Value::Null)],
                ),
                (None, Some(agency)) => (
                    format!(
                        "SELECT {} FROM push_subscriptions
                         WHERE agency_id = ?1 AND is_active = 1 AND enabled = 1",
                        PUSH_COLUMNS
                    ),
                    vec![Value::Text(agency)],
                ),
                (None, None) => return Ok(Vec::new()),
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args), row_to_push)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn record_push_result(
        &self,
        id: &str,
        delivered: bool,
        max_failures: u32,
    ) -> Result<bool, PersistenceError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let now = ts(Utc::now());
            if delivered {
                conn.execute(
                    "UPDATE push_subscriptions SET failure_count = 0, last_used_at = ?2 WHERE id = ?1",
                    params![id, now],
                )?;
                return Ok(false);
            }

            let was_active: bool = conn
                .query_row(
                    "SELECT is_active FROM push_subscriptions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| PersistenceError::NotFound(format!("push subscription {}", id)))?;
            conn.execute(
                "UPDATE push_subscriptions SET
                    failure_count = failure_count + 1,
                    is_active = CASE WHEN failure_count + 1 >= ?2 THEN 0 ELSE is_active END,
                    updated_at = ?3
                 WHERE id = ?1",
                params![id, max_failures, now],
            )?;
            let is_active: bool = conn.query_row(
                "SELECT is_active FROM push_subscriptions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            Ok(was_active && !is_active)
        })
        .await
    }

    async fn deactivate_push_subscription(&self, id: &str) -> Result<(), PersistenceError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE push_subscriptions SET is_active = 0, updated_at = ?2 WHERE id = ?1",
                params![id, ts(Utc::now())],
            )?;
            Ok(())
        })
        .await
    }
}
