//! Change feed → live sockets.
//!
//! Inserts go out as `notification` and updates as `notification-updated`,
//! to every connection of the addressed user or, for agency broadcasts, to
//! the agency's tenant room.

use chrono::Utc;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::error::SubscriptionError;
use crate::notify::feed::{EventSource, FeedEvent, FeedOp};
use crate::notify::model::FeedFilter;
use crate::rooms::RoomId;
use crate::state::AppState;
use crate::ws::protocol::ServerEvent;

/// Subscribe to the feed, then spawn the routing loop. The subscription is
/// live when this returns, so no write after it is missed.
pub async fn spawn_dispatcher(state: AppState) -> Result<JoinHandle<()>, SubscriptionError> {
    let mut stream = state.feed.subscribe(FeedFilter::all()).await?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        route(&state, event);
                    }
                    Some(Err(SubscriptionError::Lagged(missed))) => {
                        // Clients recover missed records on their next catch-up.
                        tracing::warn!(missed, "Notification dispatcher lagged behind the feed");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Notification feed error");
                    }
                    None => {
                        tracing::warn!("Notification feed closed");
                        break;
                    }
                },
            }
        }
        tracing::debug!("Notification dispatcher stopped");
    }))
}

/// Deliver one feed event to live sockets. Returns connections reached.
pub fn route(state: &AppState, event: FeedEvent) -> usize {
    let FeedEvent { op, record } = event;
    if op == FeedOp::Insert && record.is_expired(Utc::now()) {
        return 0;
    }

    let user_id = record.user_id.clone();
    let agency_id = record.agency_id.clone();
    let id = record.id.clone();
    let frame = Arc::new(match op {
        FeedOp::Insert => ServerEvent::Notification(record),
        FeedOp::Update => ServerEvent::NotificationUpdated(record),
    });

    let reached = match (user_id.as_deref(), agency_id.as_deref()) {
        (Some(user_id), _) => state.registry.send_to_user(user_id, frame),
        (None, Some(agency_id)) => state.rooms.send_to_room(&RoomId::tenant(agency_id), frame, None),
        (None, None) => 0,
    };
    tracing::debug!(notification_id = %id, op = ?op, reached, "Notification dispatched");
    reached
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::model::NotificationType;
    use crate::test_support::{principal, test_state};
    use crate::ws::lifecycle::{connect, ConnectMeta};
    use crate::ws::registry::Outbound;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Arc<ServerEvent> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for an event")
                .expect("connection closed");
            if let Outbound::Event(event) = frame {
                if matches!(event.as_ref(), ServerEvent::Notification(_) | ServerEvent::NotificationUpdated(_)) {
                    return event;
                }
            }
        }
    }

    #[tokio::test]
    async fn inserts_and_updates_reach_the_addressee_only() {
        let state = test_state();
        let dispatcher = spawn_dispatcher(state.clone()).await.unwrap();

        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        connect(&state, &principal("a", Some("ag1")), a_tx, ConnectMeta::default()).await;
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        connect(&state, &principal("b", Some("ag1")), b_tx, ConnectMeta::default()).await;

        let out = state
            .events
            .notify_task_overdue("a", Some("ag1"), "t1", "Report")
            .await
            .unwrap();
        match next_event(&mut a_rx).await.as_ref() {
            ServerEvent::Notification(record) => assert_eq!(record.id, out.id),
            other => panic!("unexpected {:?}", other),
        }

        state.store.mark_read(&out.id).await.unwrap();
        match next_event(&mut a_rx).await.as_ref() {
            ServerEvent::NotificationUpdated(record) => assert!(record.read),
            other => panic!("unexpected {:?}", other),
        }

        let alert = state
            .events
            .notify_system_alert("ag1", "Heads up", "Deploy at noon")
            .await
            .unwrap();
        match next_event(&mut b_rx).await.as_ref() {
            // B's first notification is the broadcast; the overdue task never reached B.
            ServerEvent::Notification(record) => assert_eq!(record.id, alert.id),
            other => panic!("unexpected {:?}", other),
        }

        state.shutdown.cancel();
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn expired_inserts_are_dropped() {
        let state = test_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        connect(&state, &principal("a", None), tx, ConnectMeta::default()).await;
        while rx.try_recv().is_ok() {}

        let mut record = crate::notify::model::sample_record("x", Some("a"), None, NotificationType::SystemUpdate);
        record.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert_eq!(route(&state, FeedEvent { op: FeedOp::Insert, record: record.clone() }), 0);
        assert_eq!(route(&state, FeedEvent { op: FeedOp::Update, record }), 1);
    }
}
