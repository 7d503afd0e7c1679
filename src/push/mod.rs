//! Push registration and fan-out.
//!
//! Subscriptions are upserted per `(user_id, endpoint)`. Fan-out sends one
//! record to every active, enabled subscription of its recipient that wants
//! the record's type and is outside its quiet hours. Failures are tracked per
//! subscription; a 404/410 from the push service or too many consecutive
//! failures deactivate it without deleting the row.

pub mod model;
pub mod routes;
pub mod sender;

use chrono::Utc;
use futures_util::future::join_all;
use std::sync::Arc;

use crate::config::PushConfig;
use crate::error::PersistenceError;
use crate::notify::model::NotificationRecord;
use crate::store::NotificationStore;

use model::{endpoint_tag, NewPushSubscription, PushPreferences, PushSubscription};
use sender::{PushPayload, PushSender};

pub use sender::HttpPushSender;

/// Outcome of one fan-out, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Subscriptions that passed the type and quiet-hours checks.
    pub targeted: usize,
    pub sent: usize,
    pub failed: usize,
    pub deactivated: usize,
}

#[derive(Clone)]
pub struct PushService {
    store: Arc<dyn NotificationStore>,
    sender: Arc<dyn PushSender>,
    config: PushConfig,
}

impl PushService {
    pub fn new(store: Arc<dyn NotificationStore>, sender: Arc<dyn PushSender>, config: PushConfig) -> Self {
        Self {
            store,
            sender,
            config,
        }
    }

    /// Register a device. Registering the same endpoint again refreshes the
    /// keys and reactivates it.
    pub async fn register_subscription(
        &self,
        new: NewPushSubscription,
    ) -> Result<PushSubscription, PersistenceError> {
        new.validate()?;
        let endpoint = endpoint_tag(&new.endpoint);
        let subscription = self.store.upsert_push_subscription(new).await?;
        tracing::info!(
            subscription_id = %subscription.id,
            user_id = %subscription.user_id,
            endpoint = %endpoint,
            device = subscription.device.device_type.as_str(),
            "Push subscription registered"
        );
        Ok(subscription)
    }

    pub async fn subscription(&self, id: &str) -> Result<PushSubscription, PersistenceError> {
        self.store.get_push_subscription(id).await
    }

    pub async fn disable_subscription(&self, id: &str) -> Result<(), PersistenceError> {
        self.store.disable_push_subscription(id).await?;
        tracing::info!(subscription_id = %id, "Push subscription disabled");
        Ok(())
    }

    pub async fn update_preferences(
        &self,
        id: &str,
        prefs: PushPreferences,
    ) -> Result<PushSubscription, PersistenceError> {
        self.store.update_push_preferences(id, prefs).await
    }

    /// Push one record to its recipients. Never fails the caller: store and
    /// delivery errors are logged and counted.
    pub async fn fan_out(&self, record: &NotificationRecord) -> FanOutReport {
        let mut report = FanOutReport::default();
        if !self.config.enabled {
            return report;
        }

        let targets = match self
            .store
            .push_targets(record.user_id.as_deref(), record.agency_id.as_deref())
            .await
        {
            Ok(targets) => targets,
            Err(e) => {
                tracing::error!(notification_id = %record.id, error = %e, "Push target lookup failed");
                return report;
            }
        };

        let now = Utc::now();
        let eligible: Vec<PushSubscription> = targets
            .into_iter()
            .filter(|s| s.accepts(record.kind, now))
            .collect();
        report.targeted = eligible.len();
        if eligible.is_empty() {
            return report;
        }

        let payload = PushPayload::from_record(record);
        let results = join_all(eligible.iter().map(|subscription| {
            let payload = &payload;
            async move { (subscription, self.sender.send(subscription, payload).await) }
        }))
        .await;

        for (subscription, result) in results {
            match result {
                Ok(()) => {
                    report.sent += 1;
                    if let Err(e) = self.store.record_push_result(&subscription.id, true, self.config.max_failures).await {
                        tracing::warn!(subscription_id = %subscription.id, error = %e, "Failed to record push success");
                    }
                }
                Err(err) if err.is_gone() => {
                    report.failed += 1;
                    report.deactivated += 1;
                    tracing::info!(
                        subscription_id = %subscription.id,
                        user_id = %subscription.user_id,
                        error = %err,
                        "Push endpoint gone, deactivating"
                    );
                    if let Err(e) = self.store.deactivate_push_subscription(&subscription.id).await {
                        tracing::warn!(subscription_id = %subscription.id, error = %e, "Failed to deactivate subscription");
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        user_id = %subscription.user_id,
                        error = %err,
                        "Push delivery failed"
                    );
                    match self
                        .store
                        .record_push_result(&subscription.id, false, self.config.max_failures)
                        .await
                    {
                        Ok(true) => {
                            report.deactivated += 1;
                            tracing::info!(subscription_id = %subscription.id, "Push subscription deactivated after repeated failures");
                        }
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!(subscription_id = %subscription.id, error = %e, "Failed to record push failure")
                        }
                    }
                }
            }
        }

        tracing::debug!(
            notification_id = %record.id,
            targeted = report.targeted,
            sent = report.sent,
            failed = report.failed,
            "Push fan-out finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_db;
    use crate::notify::feed::ChangeFeed;
    use crate::notify::model::{sample_record, NotificationType};
    use crate::push::model::{DeviceInfo, PushKeys, QuietHours};
    use crate::store::SqliteStore;
    use crate::test_support::RecordingPushSender;

    fn request(user: &str, agency: Option<&str>, endpoint: &str) -> NewPushSubscription {
        NewPushSubscription {
            user_id: user.into(),
            agency_id: agency.map(str::to_string),
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

    fn service(sender: Arc<RecordingPushSender>) -> PushService {
        let store = Arc::new(SqliteStore::new(init_memory_db().unwrap(), ChangeFeed::new(16)));
        PushService::new(store, sender, PushConfig::default())
    }

    #[tokio::test]
    async fn fan_out_skips_unwanted_types_and_quiet_hours() {
        let sender = Arc::new(RecordingPushSender::default());
        let push = service(sender.clone());

        push.register_subscription(request("u1", Some("ag1"), "https://push.example/all"))
            .await
            .unwrap();
        let mut payments_only = request("u1", Some("ag1"), "https://push.example/payments");
        payments_only.notification_types = Some([NotificationType::PaymentReceived].into_iter().collect());
        push.register_subscription(payments_only).await.unwrap();
        let mut quiet_now = request("u1", Some("ag1"), "https://push.example/quiet");
        let now = Utc::now().time();
        quiet_now.quiet_hours = Some(QuietHours {
            start: now - chrono::Duration::hours(1),
            end: now + chrono::Duration::hours(1),
        });
        push.register_subscription(quiet_now).await.unwrap();

        let record = sample_record("n1", Some("u1"), Some("ag1"), NotificationType::TaskOverdue);
        let report = push.fan_out(&record).await;

        assert_eq!(report.targeted, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(sender.endpoints(), vec!["https://push.example/all".to_string()]);
    }

    #[tokio::test]
    async fn gone_endpoint_is_deactivated_immediately() {
        let sender = Arc::new(RecordingPushSender::default());
        sender.respond_with("https://push.example/gone", 410);
        let push = service(sender.clone());
        let sub = push
            .register_subscription(request("u1", None, "https://push.example/gone"))
            .await
            .unwrap();

        let record = sample_record("n1", Some("u1"), None, NotificationType::SystemAlert);
        let report = push.fan_out(&record).await;
        assert_eq!(report.deactivated, 1);
        assert!(!push.subscription(&sub.id).await.unwrap().is_active);

        // Re-registering brings it back.
        let again = push
            .register_subscription(request("u1", None, "https://push.example/gone"))
            .await
            .unwrap();
        assert_eq!(again.id, sub.id);
        assert!(again.is_active);
    }

    #[tokio::test]
    async fn repeated_failures_deactivate_after_threshold() {
        let sender = Arc::new(RecordingPushSender::default());
        sender.respond_with("https://push.example/flaky", 500);
        let push = service(sender.clone());
        let sub = push
            .register_subscription(request("u1", None, "https://push.example/flaky"))
            .await
            .unwrap();
        let record = sample_record("n1", Some("u1"), None, NotificationType::SystemAlert);

        assert_eq!(push.fan_out(&record).await.deactivated, 0);
        assert_eq!(push.fan_out(&record).await.deactivated, 0);
        assert_eq!(push.fan_out(&record).await.deactivated, 1);
        assert_eq!(push.fan_out(&record).await.targeted, 0);
        assert_eq!(push.subscription(&sub.id).await.unwrap().failure_count, 3);
    }

    #[tokio::test]
    async fn disabled_push_does_nothing() {
        let sender = Arc::new(RecordingPushSender::default());
        let store = Arc::new(SqliteStore::new(init_memory_db().unwrap(), ChangeFeed::new(16)));
        let push = PushService::new(
            store,
            sender.clone(),
            PushConfig {
                enabled: false,
                ..Default::default()
            },
        );
        push.register_subscription(request("u1", None, "https://push.example/a"))
            .await
            .unwrap();
        let record = sample_record("n1", Some("u1"), None, NotificationType::SystemAlert);
        assert_eq!(push.fan_out(&record).await, FanOutReport::default());
        assert!(sender.endpoints().is_empty());
    }

    #[tokio::test]
    async fn invalid_registration_is_rejected() {
        let push = service(Arc::new(RecordingPushSender::default()));
        let mut bad = request("u1", None, "ftp://push.example/a");
        assert!(matches!(
            push.register_subscription(bad.clone()).await,
            Err(PersistenceError::Invalid(_))
        ));
        bad.endpoint = "https://push.example/a".into();
        bad.timezone = Some("Nowhere/City".into());
        assert!(push.register_subscription(bad).await.is_err());
    }
}
