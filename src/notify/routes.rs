//! REST endpoints for notifications.
//!
//! GET  /api/notifications           — the caller's notifications, newest first
//! POST /api/notifications/{id}/read — mark one read (idempotent)
//! POST /api/notifications/read-all  — mark all of the caller's unread read
//! POST /api/events                  — raise a domain event (admin/service only)

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::collections::BTreeSet;

use crate::auth::Principal;
use crate::notify::mapper::{CreateOptions, EventOutcome};
use crate::notify::model::{DeliveryChannel, NotificationRecord, NotificationType, Priority, SubscriptionKey};
use crate::store::ListQuery;
use crate::state::AppState;
use crate::ws::protocol::visible_to;

/// Largest page returned by the list endpoint.
const MAX_PAGE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub unread_only: bool,
    pub limit: Option<usize>,
    /// Id of the last record of the previous page.
    pub before: Option<String>,
}

/// GET /api/notifications
pub async fn list_notifications(
    State(state): State<AppState>,
    principal: Principal,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<NotificationRecord>>, (StatusCode, String)> {
    let key = SubscriptionKey::new(principal.user_id, principal.agency_id);
    let query = ListQuery {
        unread_only: params.unread_only,
        limit: params.limit.unwrap_or(50).clamp(1, MAX_PAGE),
        before_id: params.before,
    };
    let records = state
        .store
        .list_notifications(&key, query)
        .await
        .map_err(|e| e.into_rejection())?;
    Ok(Json(records))
}

/// POST /api/notifications/{id}/read
pub async fn mark_read(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> Result<Json<NotificationRecord>, (StatusCode, String)> {
    let record = state
        .store
        .get_notification(&id)
        .await
        .map_err(|e| e.into_rejection())?;
    if !visible_to(&record, &principal) {
        return Err((StatusCode::NOT_FOUND, format!("notification {} not found", id)));
    }
    let record = state
        .store
        .mark_read(&id)
        .await
        .map_err(|e| e.into_rejection())?;
    Ok(Json(record))
}

/// POST /api/notifications/read-all
pub async fn mark_all_read(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let key = SubscriptionKey::new(principal.user_id, principal.agency_id);
    let updated = state
        .store
        .mark_all_read(&key)
        .await
        .map_err(|e| e.into_rejection())?;
    Ok(Json(serde_json::json!({ "updated": updated })))
}

#[derive(Debug, Deserialize)]
pub struct CreateEventRequest {
    /// Omit to address the whole agency.
    pub user_id: Option<String>,
    pub agency_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    #[serde(default)]
    pub data: serde_json::Value,
    pub channels: Option<BTreeSet<DeliveryChannel>>,
    pub priority: Option<Priority>,
    pub title: Option<String>,
    pub message: Option<String>,
    pub action_url: Option<String>,
    pub action_label: Option<String>,
    pub expires_in_secs: Option<i64>,
    pub idempotency_key: Option<String>,
}

/// Longest notification lifetime a publisher may request (one year).
const MAX_EXPIRES_IN_SECS: i64 = 365 * 24 * 3600;

/// POST /api/events
///
/// Publishers bound to an agency may only raise events inside it.
/// Returns 201 for a new event and 200 when the idempotency key matched.
pub async fn create_event(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<CreateEventRequest>,
) -> Result<(StatusCode, Json<EventOutcome>), (StatusCode, String)> {
    if !principal.can_publish_events() {
        return Err((StatusCode::FORBIDDEN, "role may not publish events".to_string()));
    }

    let agency_id = match (&principal.agency_id, body.agency_id) {
        (Some(own), Some(requested)) if own != &requested => {
            return Err((StatusCode::FORBIDDEN, "foreign agency".to_string()));
        }
        (own, requested) => requested.or_else(|| own.clone()),
    };

    let expires_in = match body.expires_in_secs {
        Some(secs) if secs <= 0 => {
            return Err((StatusCode::BAD_REQUEST, "expires_in_secs must be positive".to_string()));
        }
        Some(secs) if secs > MAX_EXPIRES_IN_SECS => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("expires_in_secs must be at most {}", MAX_EXPIRES_IN_SECS),
            ));
        }
        Some(secs) => Some(chrono::Duration::try_seconds(secs).ok_or_else(|| {
            (StatusCode::BAD_REQUEST, "expires_in_secs is out of range".to_string())
        })?),
        None => None,
    };

    let opts = CreateOptions {
        agency_id,
        channels: body.channels,
        priority: body.priority,
        title: body.title,
        message: body.message,
        action_url: body.action_url,
        action_label: body.action_label,
        expires_in,
        idempotency_key: body.idempotency_key,
    };
    let data = if body.data.is_null() {
        serde_json::json!({})
    } else {
        body.data
    };

    let outcome = state
        .events
        .create_event(body.user_id.as_deref(), body.kind, data, opts)
        .await
        .map_err(|e| e.into_rejection())?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}
