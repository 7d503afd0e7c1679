//! Persistence contract for notification records and push subscriptions.
//!
//! The store is the source of truth. Every successful write to a
//! notification is published on the change feed, which is what makes the
//! store an event source for the delivery side.

pub mod sqlite;

use async_trait::async_trait;

use crate::error::PersistenceError;
use crate::notify::model::{FeedFilter, NewNotification, NotificationRecord, SubscriptionKey};
use crate::push::model::{NewPushSubscription, PushPreferences, PushSubscription};

pub use sqlite::SqliteStore;

#[derive(Debug, Clone)]
pub struct InsertOutcome {
    pub record: NotificationRecord,
    /// False when an earlier insert with the same idempotency key won.
    pub created: bool,
}

/// Page of a user's notification list, newest first.
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub unread_only: bool,
    pub limit: usize,
    /// Only records created strictly before this record's position.
    pub before_id: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            unread_only: false,
            limit: 50,
            before_id: None,
        }
    }
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert_notification(
        &self,
        new: NewNotification,
    ) -> Result<InsertOutcome, PersistenceError>;

    async fn get_notification(&self, id: &str) -> Result<NotificationRecord, PersistenceError>;

    async fn list_notifications(
        &self,
        key: &SubscriptionKey,
        query: ListQuery,
    ) -> Result<Vec<NotificationRecord>, PersistenceError>;

    /// The `limit` most recent unread, unexpired records matching `filter`,
    /// returned oldest first.
    async fn recent_unread(
        &self,
        filter: &FeedFilter,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, PersistenceError>;

    /// Idempotent: an already-read record is returned unchanged.
    async fn mark_read(&self, id: &str) -> Result<NotificationRecord, PersistenceError>;

    /// Returns how many records flipped to read.
    async fn mark_all_read(&self, key: &SubscriptionKey) -> Result<usize, PersistenceError>;

    /// Delete read records older than the cutoff. `None` covers every agency.
    async fn delete_old_read(
        &self,
        agency_id: Option<&str>,
        older_than_days: u32,
    ) -> Result<usize, PersistenceError>;

    /// Insert or refresh on `(user_id, endpoint)`. Re-registering reactivates.
    async fn upsert_push_subscription(
        &self,
        new: NewPushSubscription,
    ) -> Result<PushSubscription, PersistenceError>;

    async fn get_push_subscription(&self, id: &str) -> Result<PushSubscription, PersistenceError>;

    async fn update_push_preferences(
        &self,
        id: &str,
        prefs: PushPreferences,
    ) -> Result<PushSubscription, PersistenceError>;

    /// User opt-out. The row is kept.
    async fn disable_push_subscription(&self, id: &str) -> Result<(), PersistenceError>;

    /// Active, enabled subscriptions for one user, or for a whole agency when
    /// `user_id` is `None`.
    async fn push_targets(
        &self,
        user_id: Option<&str>,
        agency_id: Option<&str>,
    ) -> Result<Vec<PushSubscription>, PersistenceError>;

    /// Track a delivery attempt. Returns true if this failure deactivated the
    /// subscription.
    async fn record_push_result(
        &self,
        id: &str,
        delivered: bool,
        max_failures: u32,
    ) -> Result<bool, PersistenceError>;

    async fn deactivate_push_subscription(&self, id: &str) -> Result<(), PersistenceError>;
}
