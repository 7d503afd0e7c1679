//! Push subscription records and the rules that decide whether a
//! subscription currently accepts a notification.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::error::PersistenceError;
use crate::notify::model::NotificationType;

/// Encryption material handed out by the browser push service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

impl PushKeys {
    /// Both keys must be unpadded base64url.
    pub fn validate(&self) -> Result<(), PersistenceError> {
        for (name, value) in [("p256dh", &self.p256dh), ("auth", &self.auth)] {
            let trimmed = value.trim_end_matches('=');
            let decoded = URL_SAFE_NO_PAD
                .decode(trimmed)
                .map_err(|_| PersistenceError::Invalid(format!("{} is not base64url", name)))?;
            if decoded.is_empty() {
                return Err(PersistenceError::Invalid(format!("{} is empty", name)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[default]
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
            Self::Tablet => "tablet",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "mobile" => Self::Mobile,
            "tablet" => Self::Tablet,
            _ => Self::Desktop,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceInfo {
    #[serde(default)]
    pub device_type: DeviceType,
    pub browser: Option<String>,
    pub os: Option<String>,
}

/// Daily window, in the subscription's timezone, during which push is held
/// back. `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn contains(&self, local: NaiveTime) -> bool {
        if self.start == self.end {
            return false;
        }
        if self.start < self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_hhmm(&raw).map_err(serde::de::Error::custom)
    }
}

pub(crate) fn parse_hhmm(raw: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| format!("'{}' is not HH:MM", raw))
}

pub(crate) fn parse_timezone(raw: &str) -> Result<Tz, PersistenceError> {
    raw.parse::<Tz>()
        .map_err(|_| PersistenceError::Invalid(format!("unknown timezone '{}'", raw)))
}

/// Short stable tag for an endpoint. Endpoints are bearer capabilities, so
/// logs carry this instead of the URL.
pub fn endpoint_tag(endpoint: &str) -> String {
    let digest = Sha256::digest(endpoint.as_bytes());
    hex::encode(&digest[..6])
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushSubscription {
    pub id: String,
    pub user_id: String,
    pub agency_id: Option<String>,
    pub endpoint: String,
    pub keys: PushKeys,
    pub device: DeviceInfo,
    pub enabled: bool,
    pub notification_types: BTreeSet<NotificationType>,
    pub quiet_hours: Option<QuietHours>,
    pub timezone: String,
    pub is_active: bool,
    pub failure_count: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PushSubscription {
    /// Quiet hours apply at `now` in the subscription's own timezone.
    /// An unparseable timezone falls back to UTC.
    pub fn in_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        let Some(window) = self.quiet_hours else {
            return false;
        };
        let tz: Tz = self.timezone.parse().unwrap_or(chrono_tz::UTC);
        window.contains(now.with_timezone(&tz).time())
    }

    /// Whether a notification of `kind` should be pushed here right now.
    pub fn accepts(&self, kind: NotificationType, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.enabled
            && self.notification_types.contains(&kind)
            && !self.in_quiet_hours(now)
    }
}

/// Registration request for a device.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPushSubscription {
    pub user_id: String,
    pub agency_id: Option<String>,
    pub endpoint: String,
    pub keys: PushKeys,
    #[serde(default)]
    pub device: DeviceInfo,
    /// Defaults to every type.
    pub notification_types: Option<BTreeSet<NotificationType>>,
    pub quiet_hours: Option<QuietHours>,
    pub timezone: Option<String>,
}

impl NewPushSubscription {
    pub fn validate(&self) -> Result<(), PersistenceError> {
        if self.user_id.is_empty() {
            return Err(PersistenceError::Invalid("user_id is empty".into()));
        }
        if !(self.endpoint.starts_with("https://") || self.endpoint.starts_with("http://")) {
            return Err(PersistenceError::Invalid(
                "endpoint must be an http(s) URL".into(),
            ));
        }
        self.keys.validate()?;
        if let Some(tz) = &self.timezone {
            parse_timezone(tz)?;
        }
        Ok(())
    }
}

/// Partial update of a subscription's delivery preferences.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushPreferences {
    pub enabled: Option<bool>,
    pub notification_types: Option<BTreeSet<NotificationType>>,
    /// `Some(None)` clears the window.
    #[serde(default, deserialize_with = "double_option")]
    pub quiet_hours: Option<Option<QuietHours>>,
    pub timezone: Option<String>,
}

fn double_option<'de, D>(d: D) -> Result<Option<Option<QuietHours>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<QuietHours>::deserialize(d).map(Some)
}
