//! Event mapper: the single entry point domain code uses to raise a
//! notification.
//!
//! Each event type has a default route (channels + priority) that callers may
//! override. The record is persisted first; the store's change feed then
//! carries it to live sockets and embedded delivery managers. When the
//! resolved channels include push, the record is also fanned out to the
//! recipient's push subscriptions.

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::PersistenceError;
use crate::notify::model::{DeliveryChannel, NewNotification, NotificationType, Priority};
use crate::push::PushService;
use crate::store::NotificationStore;

/// Default delivery route of an event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRoute {
    pub push: bool,
    pub priority: Priority,
}

impl EventRoute {
    pub fn channels(&self) -> BTreeSet<DeliveryChannel> {
        let mut channels = BTreeSet::from([DeliveryChannel::InApp]);
        if self.push {
            channels.insert(DeliveryChannel::Push);
        }
        channels
    }
}

pub fn route_for(kind: NotificationType) -> EventRoute {
    use NotificationType::*;
    let (push, priority) = match kind {
        TaskAssigned => (true, Priority::High),
        TaskCompleted => (false, Priority::Medium),
        TaskOverdue => (true, Priority::Urgent),
        TaskComment => (false, Priority::Medium),
        DeadlineApproaching => (true, Priority::High),
        ProjectCreated | ProjectUpdated => (false, Priority::Low),
        ProjectCompleted => (true, Priority::Medium),
        PaymentReceived => (true, Priority::Medium),
        PaymentFailed => (true, Priority::Urgent),
        InvoiceCreated => (false, Priority::Medium),
        InvoiceOverdue => (true, Priority::High),
        MessageReceived => (true, Priority::Medium),
        TeamMemberAdded => (false, Priority::Low),
        SystemAlert => (true, Priority::Urgent),
        SystemUpdate => (false, Priority::Low),
    };
    EventRoute { push, priority }
}

/// Optional overrides for [`EventMapper::create_event`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub agency_id: Option<String>,
    /// Replaces the default channels. An empty set keeps the default.
    pub channels: Option<BTreeSet<DeliveryChannel>>,
    pub priority: Option<Priority>,
    pub title: Option<String>,
    pub message: Option<String>,
    pub action_url: Option<String>,
    pub action_label: Option<String>,
    pub expires_in: Option<Duration>,
    /// Retrying with the same key returns the original record.
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventOutcome {
    pub id: String,
    /// False when the idempotency key matched an earlier event.
    pub created: bool,
}

#[derive(Clone)]
pub struct EventMapper {
    store: Arc<dyn NotificationStore>,
    push: PushService,
}

impl EventMapper {
    pub fn new(store: Arc<dyn NotificationStore>, push: PushService) -> Self {
        Self { store, push }
    }

    /// Record a domain event for one user, or for the whole agency when
    /// `user_id` is `None`.
    pub async fn create_event(
        &self,
        user_id: Option<&str>,
        kind: NotificationType,
        data: Value,
        opts: CreateOptions,
    ) -> Result<EventOutcome, PersistenceError> {
        if user_id.is_none() && opts.agency_id.is_none() {
            return Err(PersistenceError::Invalid(
                "an event needs a user or an agency".into(),
            ));
        }
        if user_id.is_some_and(str::is_empty) {
            return Err(PersistenceError::Invalid("user_id is empty".into()));
        }

        let route = route_for(kind);
        let channels = opts
            .channels
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| route.channels());
        let (default_title, default_message) = default_copy(kind, &data);

        let expires_at = match opts.expires_in {
            Some(ttl) => Some(Utc::now().checked_add_signed(ttl).ok_or_else(|| {
                PersistenceError::Invalid("expiry is out of range".into())
            })?),
            None => None,
        };

        let new = NewNotification {
            kind,
            title: opts.title.unwrap_or(default_title),
            message: opts.message.unwrap_or(default_message),
            data,
            user_id: user_id.map(str::to_string),
            agency_id: opts.agency_id,
            priority: opts.priority.unwrap_or(route.priority),
            channels,
            expires_at,
            action_url: opts.action_url,
            action_label: opts.action_label,
            idempotency_key: opts.idempotency_key,
        };

        let outcome = self.store.insert_notification(new).await?;
        let record = outcome.record;

        if !outcome.created {
            tracing::debug!(notification_id = %record.id, "Duplicate event ignored");
            return Ok(EventOutcome {
                id: record.id,
                created: false,
            });
        }

        tracing::info!(
            notification_id = %record.id,
            kind = %record.kind,
            user_id = ?record.user_id,
            agency_id = ?record.agency_id,
            priority = record.priority.as_str(),
            "Notification created"
        );

        if record.channels.contains(&DeliveryChannel::Push) {
            self.push.fan_out(&record).await;
        }

        Ok(EventOutcome {
            id: record.id,
            created: true,
        })
    }

    pub async fn notify_task_assigned(
        &self,
        user_id: &str,
        agency_id: Option<&str>,
        task_id: &str,
        task_title: &str,
        assigned_by: &str,
    ) -> Result<EventOutcome, PersistenceError> {
        self.create_event(
            Some(user_id),
            NotificationType::TaskAssigned,
            json!({ "task_id": task_id, "task_title": task_title, "assigned_by": assigned_by }),
            CreateOptions {
                agency_id: agency_id.map(str::to_string),
                action_url: Some(format!("/tasks/{}", task_id)),
                action_label: Some("View task".into()),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn notify_task_overdue(
        &self,
        user_id: &str,
        agency_id: Option<&str>,
        task_id: &str,
        task_title: &str,
    ) -> Result<EventOutcome, PersistenceError> {
        self.create_event(
            Some(user_id),
            NotificationType::TaskOverdue,
            json!({ "task_id": task_id, "task_title": task_title }),
            CreateOptions {
                agency_id: agency_id.map(str::to_string),
                action_url: Some(format!("/tasks/{}", task_id)),
                action_label: Some("View task".into()),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn notify_payment_received(
        &self,
        user_id: &str,
        agency_id: Option<&str>,
        invoice_id: &str,
        amount: f64,
        currency: &str,
    ) -> Result<EventOutcome, PersistenceError> {
        self.create_event(
            Some(user_id),
            NotificationType::PaymentReceived,
            json!({ "invoice_id": invoice_id, "amount": amount, "currency": currency }),
            CreateOptions {
                agency_id: agency_id.map(str::to_string),
                action_url: Some(format!("/invoices/{}", invoice_id)),
                action_label: Some("View invoice".into()),
                ..Default::default()
            },
        )
        .await
    }

    /// `user_id` of `None` tells the whole agency.
    pub async fn notify_project_completed(
        &self,
        user_id: Option<&str>,
        agency_id: Option<&str>,
        project_id: &str,
        project_name: &str,
    ) -> Result<EventOutcome, PersistenceError> {
        self.create_event(
            user_id,
            NotificationType::ProjectCompleted,
            json!({ "project_id": project_id, "project_name": project_name }),
            CreateOptions {
                agency_id: agency_id.map(str::to_string),
                action_url: Some(format!("/projects/{}", project_id)),
                action_label: Some("View project".into()),
                ..Default::default()
            },
        )
        .await
    }

    /// Agency-wide alert.
    pub async fn notify_system_alert(
        &self,
        agency_id: &str,
        title: &str,
        message: &str,
    ) -> Result<EventOutcome, PersistenceError> {
        self.create_event(
            None,
            NotificationType::SystemAlert,
            json!({}),
            CreateOptions {
                agency_id: Some(agency_id.to_string()),
                title: Some(title.to_string()),
                message: Some(message.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn notify_message_received(
        &self,
        user_id: &str,
        agency_id: Option<&str>,
        from_user: &str,
        conversation_id: &str,
        preview: &str,
    ) -> Result<EventOutcome, PersistenceError> {
        self.create_event(
            Some(user_id),
            NotificationType::MessageReceived,
            json!({ "from_user": from_user, "conversation_id": conversation_id, "preview": preview }),
            CreateOptions {
                agency_id: agency_id.map(str::to_string),
                action_url: Some(format!("/messages/{}", conversation_id)),
                action_label: Some("Reply".into()),
                ..Default::default()
            },
        )
        .await
    }
}

/// Title and message used when the caller supplies none.
fn default_copy(kind: NotificationType, data: &Value) -> (String, String) {
    let field = |name: &str| data.get(name).and_then(Value::as_str).map(str::to_string);
    let task = || field("task_title").unwrap_or_else(|| "a task".into());
    let project = || field("project_name").unwrap_or_else(|| "A project".into());

    use NotificationType::*;
    match kind {
        TaskAssigned => ("New task assigned".into(), format!("You were assigned {}", task())),
        TaskCompleted => ("Task completed".into(), format!("{} was completed", task())),
        TaskOverdue => ("Task overdue".into(), format!("{} is past its due date", task())),
        TaskComment => ("New comment".into(), format!("New comment on {}", task())),
        DeadlineApproaching => ("Deadline approaching".into(), format!("{} is due soon", task())),
        ProjectCreated => ("Project created".into(), format!("{} was created", project())),
        ProjectUpdated => ("Project updated".into(), format!("{} was updated", project())),
        ProjectCompleted => ("Project completed".into(), format!("{} is complete", project())),
        PaymentReceived => {
            let amount = data
                .get("amount")
                .map(|a| match a.as_f64() {
                    Some(n) => format!("{:.2}", n),
                    None => a.to_string(),
                })
                .unwrap_or_default();
            let currency = field("currency").unwrap_or_default();
            let what = format!("{} {}", amount, currency);
            let what = what.trim();
            if what.is_empty() {
                ("Payment received".into(), "A payment was received".into())
            } else {
                ("Payment received".into(), format!("Payment of {} received", what))
            }
        }
        PaymentFailed => ("Payment failed".into(), "A payment could not be processed".into()),
        InvoiceCreated => ("Invoice created".into(), "A new invoice was created".into()),
        InvoiceOverdue => ("Invoice overdue".into(), "An invoice is past its due date".into()),
        MessageReceived => {
            let from = field("from_user").unwrap_or_else(|| "someone".into());
            let preview = field("preview").unwrap_or_default();
            (format!("Message from {}", from), preview)
        }
        TeamMemberAdded => ("New team member".into(), "A team member was added".into()),
        SystemAlert => ("System alert".into(), field("message").unwrap_or_default()),
        SystemUpdate => ("System update".into(), field("message").unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_state_with_sender, RecordingPushSender};
    use crate::push::model::{DeviceInfo, NewPushSubscription, PushKeys};

    fn device(user: &str, agency: &str, endpoint: &str) -> NewPushSubscription {
        NewPushSubscription {
            user_id: user.into(),
            agency_id: Some(agency.into()),
            endpoint: endpoint.into(),
            keys: PushKeys {
                p256dh: "BNcRdreALRFXTkOOUHK1EtK2wtaz5Ry4YfYCA_0QTpQtUbVlUls0VJXg7A8u-Ts1XbjhazAkj7I99e8QcYP7DkM".into(),
                auth: "tBHItJI5svbpez7KI4CCXg".into(),
            },
            device: DeviceInfo::default(),
            notification_types: None,
            quiet_hours: None,
            timezone: None,
        }
    }

    #[test]
    fn default_routes() {
        assert_eq!(route_for(NotificationType::TaskOverdue).priority, Priority::Urgent);
        assert_eq!(route_for(NotificationType::PaymentReceived).priority, Priority::Medium);
        assert_eq!(route_for(NotificationType::SystemAlert).priority, Priority::Urgent);
        assert!(route_for(NotificationType::TaskAssigned).push);
        assert!(!route_for(NotificationType::TaskComment).push);
        assert_eq!(
            route_for(NotificationType::ProjectCreated).channels(),
            BTreeSet::from([DeliveryChannel::InApp])
        );
    }

    #[tokio::test]
    async fn overrides_replace_defaults() {
        let state = crate::test_support::test_state();
        let out = state
            .events
            .create_event(
                Some("u1"),
                NotificationType::TaskOverdue,
                json!({ "task_title": "Ship it" }),
                CreateOptions {
                    priority: Some(Priority::Low),
                    channels: Some(BTreeSet::new()),
                    title: Some("Custom".into()),
                    expires_in: Some(Duration::hours(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let record = state.store.get_notification(&out.id).await.unwrap();
        assert_eq!(record.priority, Priority::Low);
        assert_eq!(record.title, "Custom");
        assert_eq!(record.message, "Ship it is past its due date");
        assert!(record.channels.contains(&DeliveryChannel::Push));
        assert!(record.expires_at.is_some());
    }

    #[tokio::test]
    async fn recipientless_event_is_invalid() {
        let state = crate::test_support::test_state();
        let err = state
            .events
            .create_event(None, NotificationType::SystemAlert, json!({}), CreateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Invalid(_)));
    }

    #[tokio::test]
    async fn unrepresentable_expiry_is_invalid() {
        let state = crate::test_support::test_state();
        let err = state
            .events
            .create_event(
                Some("u1"),
                NotificationType::TaskAssigned,
                json!({}),
                CreateOptions {
                    expires_in: Some(Duration::MAX),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Invalid(_)));
        assert!(state
            .store
            .list_notifications(
                &crate::notify::model::SubscriptionKey::new("u1", None),
                Default::default()
            )
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn idempotent_retry_pushes_once() {
        let sender = Arc::new(RecordingPushSender::default());
        let state = test_state_with_sender(sender.clone());
        state
            .push
            .register_subscription(device("u1", "ag1", "https://push.example/u1"))
            .await
            .unwrap();

        let opts = CreateOptions {
            agency_id: Some("ag1".into()),
            idempotency_key: Some("task-7-overdue".into()),
            ..Default::default()
        };
        let first = state
            .events
            .create_event(Some("u1"), NotificationType::TaskOverdue, json!({}), opts.clone())
            .await
            .unwrap();
        let second = state
            .events
            .create_event(Some("u1"), NotificationType::TaskOverdue, json!({}), opts)
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(sender.endpoints().len(), 1);
    }

    #[tokio::test]
    async fn in_app_only_events_skip_push() {
        let sender = Arc::new(RecordingPushSender::default());
        let state = test_state_with_sender(sender.clone());
        state
            .push
            .register_subscription(device("u1", "ag1", "https://push.example/u1"))
            .await
            .unwrap();

        state
            .events
            .create_event(
                Some("u1"),
                NotificationType::TaskComment,
                json!({}),
                CreateOptions {
                    agency_id: Some("ag1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(sender.endpoints().is_empty());

        state
            .events
            .notify_task_assigned("u1", Some("ag1"), "t1", "Write docs", "boss")
            .await
            .unwrap();
        assert_eq!(sender.endpoints(), vec!["https://push.example/u1".to_string()]);
    }

    #[tokio::test]
    async fn broadcast_alert_reaches_every_agency_device() {
        let sender = Arc::new(RecordingPushSender::default());
        let state = test_state_with_sender(sender.clone());
        for (user, endpoint) in [("a", "https://push.example/a"), ("b", "https://push.example/b")] {
            state
                .push
                .register_subscription(device(user, "ag1", endpoint))
                .await
                .unwrap();
        }
        state
            .push
            .register_subscription(device("c", "ag2", "https://push.example/c"))
            .await
            .unwrap();

        let out = state
            .events
            .notify_system_alert("ag1", "Maintenance", "Down at 22:00")
            .await
            .unwrap();
        let record = state.store.get_notification(&out.id).await.unwrap();
        assert!(record.is_broadcast());
        assert_eq!(record.priority, Priority::Urgent);

        let mut endpoints = sender.endpoints();
        endpoints.sort();
        assert_eq!(endpoints, vec!["https://push.example/a", "https://push.example/b"]);
    }

    #[test]
    fn payment_copy_formats_amount() {
        let (title, message) = default_copy(
            NotificationType::PaymentReceived,
            &json!({ "amount": 120.5, "currency": "EUR" }),
        );
        assert_eq!(title, "Payment received");
        assert_eq!(message, "Payment of 120.50 EUR received");
    }
}
