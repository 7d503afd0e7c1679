//! Outbound push delivery.
//!
//! The payload is posted as JSON to the subscription endpoint with the Web
//! Push `TTL` and `Urgency` headers. Payload encryption for browser push
//! services is left to a relay in front of the endpoint.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::config::PushConfig;
use crate::error::DeliveryError;
use crate::notify::model::{NotificationRecord, NotificationType, Priority};
use crate::push::model::{endpoint_tag, PushSubscription};

/// Body of one push message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushPayload {
    pub notification_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub require_interaction: bool,
    pub action_url: Option<String>,
    pub action_label: Option<String>,
    pub data: serde_json::Value,
    /// Collapses repeated pushes for the same record on the device.
    pub tag: String,
}

impl PushPayload {
    pub fn from_record(record: &NotificationRecord) -> Self {
        Self {
            notification_id: record.id.clone(),
            kind: record.kind,
            title: record.title.clone(),
            body: record.message.clone(),
            priority: record.priority,
            require_interaction: record.priority == Priority::Urgent,
            action_url: record.action_url.clone(),
            action_label: record.action_label.clone(),
            data: record.data.clone(),
            tag: format!("{}-{}", record.kind, record.id),
        }
    }
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(
        &self,
        subscription: &PushSubscription,
        payload: &PushPayload,
    ) -> Result<(), DeliveryError>;
}

pub struct HttpPushSender {
    client: reqwest::Client,
    ttl_secs: u32,
}

impl HttpPushSender {
    pub fn new(config: &PushConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            ttl_secs: config.ttl_secs,
        })
    }
}

#[async_trait]
impl PushSender for HttpPushSender {
    async fn send(
        &self,
        subscription: &PushSubscription,
        payload: &PushPayload,
    ) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&subscription.endpoint)
            .header("TTL", self.ttl_secs.to_string())
            .header("Urgency", payload.priority.push_urgency())
            .header("Topic", &payload.tag[..payload.tag.len().min(32)])
            .json(payload)
            .send()
            .await
            .map_err(|e| DeliveryError::PushUnreachable {
                endpoint: endpoint_tag(&subscription.endpoint),
                reason: e.without_url().to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(DeliveryError::PushRejected {
            endpoint: endpoint_tag(&subscription.endpoint),
            status: status.as_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::model::sample_record;

    #[test]
    fn urgent_payload_requires_interaction() {
        let mut record = sample_record("n1", Some("u1"), Some("ag1"), NotificationType::SystemAlert);
        record.priority = Priority::Urgent;
        let payload = PushPayload::from_record(&record);
        assert!(payload.require_interaction);
        assert_eq!(payload.tag, "system_alert-n1");

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "system_alert");
        assert_eq!(json["priority"], "urgent");
        assert_eq!(json["body"], "message");
    }
}
