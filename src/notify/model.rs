//! Notification record types shared by the store, the feed, the mapper and
//! the delivery manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Domain event types that can raise a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    TaskAssigned,
    TaskCompleted,
    TaskOverdue,
    TaskComment,
    DeadlineApproaching,
    ProjectCreated,
    ProjectUpdated,
    ProjectCompleted,
    PaymentReceived,
    PaymentFailed,
    InvoiceCreated,
    InvoiceOverdue,
    MessageReceived,
    TeamMemberAdded,
    SystemAlert,
    SystemUpdate,
}

impl NotificationType {
    pub const ALL: [NotificationType; 16] = [
        Self::TaskAssigned,
        Self::TaskCompleted,
        Self::TaskOverdue,
        Self::TaskComment,
        Self::DeadlineApproaching,
        Self::ProjectCreated,
        Self::ProjectUpdated,
        Self::ProjectCompleted,
        Self::PaymentReceived,
        Self::PaymentFailed,
        Self::InvoiceCreated,
        Self::InvoiceOverdue,
        Self::MessageReceived,
        Self::TeamMemberAdded,
        Self::SystemAlert,
        Self::SystemUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskAssigned => "task_assigned",
            Self::TaskCompleted => "task_completed",
            Self::TaskOverdue => "task_overdue",
            Self::TaskComment => "task_comment",
            Self::DeadlineApproaching => "deadline_approaching",
            Self::ProjectCreated => "project_created",
            Self::ProjectUpdated => "project_updated",
            Self::ProjectCompleted => "project_completed",
            Self::PaymentReceived => "payment_received",
            Self::PaymentFailed => "payment_failed",
            Self::InvoiceCreated => "invoice_created",
            Self::InvoiceOverdue => "invoice_overdue",
            Self::MessageReceived => "message_received",
            Self::TeamMemberAdded => "team_member_added",
            Self::SystemAlert => "system_alert",
            Self::SystemUpdate => "system_update",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown notification type '{}'", s))
    }
}

/// Delivery priority. `normal` and `critical` are accepted as aliases for
/// `medium` and `urgent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[serde(alias = "normal")]
    Medium,
    High,
    #[serde(alias = "critical")]
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    /// Web Push `Urgency` header value.
    pub fn push_urgency(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "normal",
            Self::High | Self::Urgent => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" | "normal" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" | "critical" => Ok(Self::Urgent),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Outbound channels a notification is routed through once recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    /// Live sockets plus the persisted unread list.
    InApp,
    /// Registered push endpoints.
    Push,
}

/// A persisted notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
    /// `None` means the record is addressed to the whole agency.
    pub user_id: Option<String>,
    pub agency_id: Option<String>,
    pub priority: Priority,
    pub channels: BTreeSet<DeliveryChannel>,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub action_url: Option<String>,
    pub action_label: Option<String>,
}

impl NotificationRecord {
    pub fn is_broadcast(&self) -> bool {
        self.user_id.is_none()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// A record about to be persisted. The store assigns `id` and `created_at`.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub kind: NotificationType,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
    pub user_id: Option<String>,
    pub agency_id: Option<String>,
    pub priority: Priority,
    pub channels: BTreeSet<DeliveryChannel>,
    pub expires_at: Option<DateTime<Utc>>,
    pub action_url: Option<String>,
    pub action_label: Option<String>,
    /// Caller-supplied key that makes retried inserts a no-op.
    pub idempotency_key: Option<String>,
}

/// Recipient scope of a subscription: one user, optionally inside one agency.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub user_id: String,
    pub agency_id: Option<String>,
}

impl SubscriptionKey {
    pub fn new(user_id: impl Into<String>, agency_id: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            agency_id,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.agency_id {
            Some(agency) => write!(f, "{}@{}", self.user_id, agency),
            None => f.write_str(&self.user_id),
        }
    }
}

/// Which records a subscriber wants to see.
#[derive(Debug, Clone, Default)]
pub struct FeedFilter {
    pub key: Option<SubscriptionKey>,
    /// Empty means every type.
    pub types: BTreeSet<NotificationType>,
}

impl FeedFilter {
    /// A filter that matches everything. Used by the socket dispatcher.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_key(key: SubscriptionKey, types: impl IntoIterator<Item = NotificationType>) -> Self {
        Self {
            key: Some(key),
            types: types.into_iter().collect(),
        }
    }

    /// Records addressed to the user (in the agency, if one is set) or
    /// broadcast to the user's agency.
    pub fn matches(&self, record: &NotificationRecord) -> bool {
        if !self.types.is_empty() && !self.types.contains(&record.kind) {
            return false;
        }
        let Some(key) = &self.key else {
            return true;
        };
        match &record.user_id {
            Some(user_id) => {
                user_id == &key.user_id
                    && (key.agency_id.is_none() || key.agency_id == record.agency_id)
            }
            None => key.agency_id.is_some() && key.agency_id == record.agency_id,
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_record(
    id: &str,
    user_id: Option<&str>,
    agency_id: Option<&str>,
    kind: NotificationType,
) -> NotificationRecord {
    NotificationRecord {
        id: id.to_string(),
        kind,
        title: "title".to_string(),
        message: "message".to_string(),
        data: serde_json::json!({}),
        user_id: user_id.map(str::to_string),
        agency_id: agency_id.map(str::to_string),
        priority: Priority::Medium,
        channels: [DeliveryChannel::InApp].into_iter().collect(),
        read: false,
        read_at: None,
        created_at: Utc::now(),
        expires_at: None,
        action_url: None,
        action_label: None,
    }
}
