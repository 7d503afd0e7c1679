//! REST endpoints for push subscriptions.
//!
//! POST   /api/push/subscriptions      — register (or refresh) this device
//! PUT    /api/push/subscriptions/{id} — update delivery preferences
//! DELETE /api/push/subscriptions/{id} — opt out; the row is kept

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::collections::BTreeSet;

use crate::auth::Principal;
use crate::notify::model::NotificationType;
use crate::push::model::{DeviceInfo, NewPushSubscription, PushKeys, PushPreferences, PushSubscription, QuietHours};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub endpoint: String,
    pub keys: PushKeys,
    #[serde(default)]
    pub device: DeviceInfo,
    pub notification_types: Option<BTreeSet<NotificationType>>,
    pub quiet_hours: Option<QuietHours>,
    pub timezone: Option<String>,
}

/// POST /api/push/subscriptions
pub async fn register_subscription(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<PushSubscription>), (StatusCode, String)> {
    let new = NewPushSubscription {
        user_id: principal.user_id,
        agency_id: principal.agency_id,
        endpoint: body.endpoint,
        keys: body.keys,
        device: body.device,
        notification_types: body.notification_types,
        quiet_hours: body.quiet_hours,
        timezone: body.timezone,
    };
    let subscription = state
        .push
        .register_subscription(new)
        .await
        .map_err(|e| e.into_rejection())?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

/// PUT /api/push/subscriptions/{id}
pub async fn update_subscription(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    Json(prefs): Json<PushPreferences>,
) -> Result<Json<PushSubscription>, (StatusCode, String)> {
    owned_subscription(&state, &principal, &id).await?;
    let updated = state
        .push
        .update_preferences(&id, prefs)
        .await
        .map_err(|e| e.into_rejection())?;
    Ok(Json(updated))
}

/// DELETE /api/push/subscriptions/{id}
pub async fn delete_subscription(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    owned_subscription(&state, &principal, &id).await?;
    state
        .push
        .disable_subscription(&id)
        .await
        .map_err(|e| e.into_rejection())?;
    Ok(StatusCode::NO_CONTENT)
}

/// Someone else's subscription is reported as missing.
async fn owned_subscription(
    state: &AppState,
    principal: &Principal,
    id: &str,
) -> Result<PushSubscription, (StatusCode, String)> {
    let subscription = state
        .push
        .subscription(id)
        .await
        .map_err(|e| e.into_rejection())?;
    if subscription.user_id != principal.user_id {
        return Err((StatusCode::NOT_FOUND, format!("push subscription {} not found", id)));
    }
    Ok(subscription)
}
