//! Change feed: the push stream of inserted/updated notification records.
//!
//! The store publishes every successful write here. Consumers subscribe
//! through the [`EventSource`] trait so the delivery manager can be driven by
//! any feed implementation, not only the in-process one.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::error::SubscriptionError;
use crate::notify::model::{FeedFilter, NotificationRecord};

/// Events buffered per subscriber before it is reported as lagging.
pub const FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedOp {
    Insert,
    Update,
}

#[derive(Debug, Clone)]
pub struct FeedEvent {
    pub op: FeedOp,
    pub record: NotificationRecord,
}

/// A live subscription. Dropping it unsubscribes.
pub type FeedStream = BoxStream<'static, Result<FeedEvent, SubscriptionError>>;

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, filter: FeedFilter) -> Result<FeedStream, SubscriptionError>;
}

/// In-process change feed backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<FeedEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a change. Returns how many subscribers saw it.
    pub fn publish(&self, op: FeedOp, record: NotificationRecord) -> usize {
        self.sender.send(FeedEvent { op, record }).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(FEED_CAPACITY)
    }
}

#[async_trait]
impl EventSource for ChangeFeed {
    async fn subscribe(&self, filter: FeedFilter) -> Result<FeedStream, SubscriptionError> {
        Ok(filtered(self.sender.subscribe(), filter))
    }
}

/// Turn a raw broadcast receiver into a filtered stream. A lag is surfaced
/// as an error item; a closed channel ends the stream.
fn filtered(rx: broadcast::Receiver<FeedEvent>, filter: FeedFilter) -> FeedStream {
    stream::unfold((rx, filter), |(mut rx, filter)| async move {
        loop {
            match rx.recv().await {
                Ok(event) if filter.matches(&event.record) => {
                    return Some((Ok(event), (rx, filter)));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    return Some((Err(SubscriptionError::Lagged(missed)), (rx, filter)));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
