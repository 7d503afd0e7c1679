//! Embeddable notification delivery manager.
//!
//! A [`DeliveryManager`] turns an [`EventSource`] plus a [`NotificationStore`]
//! into per-recipient streams of [`DeliveryEvent`]s:
//!
//! - every successful (re)subscription replays recent unread records as one
//!   `CatchUp` batch, oldest first
//! - inserts are rendered through the enabled [`LocalChannel`]s while the
//!   [`ConnectivityMonitor`] reports online, and queued in arrival order
//!   while offline; the queue is flushed in order on the next online
//!   transition
//! - source errors trigger reconnects on an exponential schedule until the
//!   attempts run out or the handle is closed
//!
//! Each subscription is one task that owns its queue, so per-recipient
//! order never depends on lock fairness.

use chrono::Utc;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{DeliveryError, PersistenceError, SubscriptionError};
use crate::notify::backoff::ReconnectPolicy;
use crate::notify::feed::{EventSource, FeedEvent, FeedOp};
use crate::notify::model::{FeedFilter, NotificationRecord, NotificationType, Priority, SubscriptionKey};
use crate::store::NotificationStore;

/// User-level switches for local rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub show_toast: bool,
    pub play_sound: bool,
    pub show_desktop: bool,
    pub auto_hide: bool,
    pub hide_delay_ms: u64,
    /// How many rendered notifications stay visible at once.
    pub max_notifications: usize,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            show_toast: true,
            play_sound: true,
            show_desktop: true,
            auto_hide: true,
            hide_delay_ms: 5000,
            max_notifications: 5,
        }
    }
}

/// How one record is rendered locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPlan {
    pub toast: bool,
    pub desktop: bool,
    pub sound: bool,
    /// The alert stays until the user acts on it.
    pub require_interaction: bool,
    pub auto_hide_after: Option<Duration>,
}

impl RenderPlan {
    pub fn for_record(record: &NotificationRecord, settings: &DeliverySettings) -> Self {
        let urgent = record.priority == Priority::Urgent;
        Self {
            toast: settings.show_toast,
            desktop: settings.show_desktop && record.priority >= Priority::Medium,
            sound: settings.play_sound && record.priority >= Priority::High,
            require_interaction: urgent,
            auto_hide_after: (!urgent && settings.auto_hide)
                .then(|| Duration::from_millis(settings.hide_delay_ms)),
        }
    }

    pub fn enables(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Toast => self.toast,
            ChannelKind::Desktop => self.desktop,
            ChannelKind::Sound => self.sound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Toast,
    Desktop,
    Sound,
}

/// A local rendering surface (in-app toast, OS notification, sound).
/// Rendering is best-effort: failures are logged and never block delivery.
pub trait LocalChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    fn render(&self, record: &NotificationRecord, plan: &RenderPlan) -> Result<(), DeliveryError>;
}

/// Explicit online/offline signal for the delivering side.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn on_online(&self) {
        self.set(true);
    }

    pub fn on_offline(&self) {
        self.set(false);
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Receiver that wakes on every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    fn set(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            tracing::info!(online, "Connectivity changed");
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[derive(Debug, Clone)]
pub enum DeliveryEvent {
    /// Recent unread records after a (re)subscription, oldest first.
    CatchUp(Vec<NotificationRecord>),
    Delivered {
        record: NotificationRecord,
        plan: RenderPlan,
    },
    Updated(NotificationRecord),
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    /// The subscription gave up. No further events follow.
    Failed(SubscriptionError),
}

/// A live subscription. Dropping it cancels the subscription.
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    events: mpsc::UnboundedReceiver<DeliveryEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Next event, or `None` once the subscription has stopped.
    pub async fn next_event(&mut self) -> Option<DeliveryEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<DeliveryEvent> {
        self.events.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the subscription, including any pending reconnect, and wait for
    /// its task to finish.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct DeliveryManager {
    source: Arc<dyn EventSource>,
    store: Arc<dyn NotificationStore>,
    channels: Arc<Vec<Arc<dyn LocalChannel>>>,
    settings: Arc<watch::Sender<DeliverySettings>>,
    connectivity: ConnectivityMonitor,
    policy: ReconnectPolicy,
    catch_up_limit: usize,
    visible: Arc<Mutex<VecDeque<String>>>,
    cancel: CancellationToken,
}

impl DeliveryManager {
    pub fn new(source: Arc<dyn EventSource>, store: Arc<dyn NotificationStore>) -> Self {
        let (settings, _) = watch::channel(DeliverySettings::default());
        Self {
            source,
            store,
            channels: Arc::new(Vec::new()),
            settings: Arc::new(settings),
            connectivity: ConnectivityMonitor::default(),
            policy: ReconnectPolicy::default(),
            catch_up_limit: 20,
            visible: Arc::new(Mutex::new(VecDeque::new())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_channels(mut self, channels: Vec<Arc<dyn LocalChannel>>) -> Self {
        self.channels = Arc::new(channels);
        self
    }

    pub fn with_settings(self, settings: DeliverySettings) -> Self {
        self.settings.send_replace(settings);
        self
    }

    pub fn with_connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_catch_up_limit(mut self, limit: usize) -> Self {
        self.catch_up_limit = limit;
        self
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn settings(&self) -> DeliverySettings {
        self.settings.borrow().clone()
    }

    /// Takes effect for the next rendered record of every subscription.
    pub fn update_settings(&self, settings: DeliverySettings) {
        self.settings.send_replace(settings);
    }

    /// Ids of the currently visible rendered notifications, oldest first.
    pub fn visible_notifications(&self) -> Vec<String> {
        lock_visible(&self.visible).iter().cloned().collect()
    }

    /// Start delivering records for one recipient. An empty `types` means
    /// every type.
    pub fn subscribe(
        &self,
        user_id: &str,
        agency_id: Option<&str>,
        types: impl IntoIterator<Item = NotificationType>,
    ) -> SubscriptionHandle {
        let key = SubscriptionKey::new(user_id, agency_id.map(str::to_string));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.child_token();

        let worker = SubscriptionWorker {
            filter: FeedFilter::for_key(key.clone(), types),
            source: self.source.clone(),
            store: self.store.clone(),
            channels: self.channels.clone(),
            settings: self.settings.subscribe(),
            connectivity: self.connectivity.clone(),
            policy: self.policy,
            catch_up_limit: self.catch_up_limit,
            visible: self.visible.clone(),
            events: events_tx,
            cancel: cancel.clone(),
        };
        tracing::debug!(key = %key, "Delivery subscription started");
        let task = tokio::spawn(worker.run());

        SubscriptionHandle {
            key,
            events: events_rx,
            cancel,
            task: Some(task),
        }
    }

    /// Idempotent; an already-read record is returned as is.
    pub async fn mark_read(&self, id: &str) -> Result<NotificationRecord, PersistenceError> {
        self.store.mark_read(id).await
    }

    pub async fn mark_all_read(
        &self,
        user_id: &str,
        agency_id: Option<&str>,
    ) -> Result<usize, PersistenceError> {
        let key = SubscriptionKey::new(user_id, agency_id.map(str::to_string));
        self.store.mark_all_read(&key).await
    }

    /// Delete read records older than `older_than_days`.
    pub async fn cleanup_old(
        &self,
        agency_id: Option<&str>,
        older_than_days: u32,
    ) -> Result<usize, PersistenceError> {
        let deleted = self.store.delete_old_read(agency_id, older_than_days).await?;
        tracing::info!(agency_id = ?agency_id, deleted, "Old notifications cleaned up");
        Ok(deleted)
    }

    /// Cancel every subscription created by this manager.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for DeliveryManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock_visible(visible: &Mutex<VecDeque<String>>) -> std::sync::MutexGuard<'_, VecDeque<String>> {
    visible.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct SubscriptionWorker {
    filter: FeedFilter,
    source: Arc<dyn EventSource>,
    store: Arc<dyn NotificationStore>,
    channels: Arc<Vec<Arc<dyn LocalChannel>>>,
    settings: watch::Receiver<DeliverySettings>,
    connectivity: ConnectivityMonitor,
    policy: ReconnectPolicy,
    catch_up_limit: usize,
    visible: Arc<Mutex<VecDeque<String>>>,
    events: mpsc::UnboundedSender<DeliveryEvent>,
    cancel: CancellationToken,
}

impl SubscriptionWorker {
    async fn run(self) {
        let mut queue: VecDeque<NotificationRecord> = VecDeque::new();
        let mut online_rx = self.connectivity.subscribe();
        let mut attempt = 0u32;

        'subscribe: loop {
            let subscribed = tokio::select! {
                _ = self.cancel.cancelled() => break 'subscribe,
                result = self.source.subscribe(self.filter.clone()) => result,
            };
            let mut stream = match subscribed {
                Ok(stream) => stream,
                Err(e) => {
                    if self.retry(&mut attempt, e).await {
                        continue 'subscribe;
                    }
                    break 'subscribe;
                }
            };

            attempt = 0;
            self.catch_up().await;
            if self.connectivity.is_online() {
                self.flush(&mut queue);
            }

            let failure = loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break 'subscribe,
                    changed = online_rx.changed() => {
                        if changed.is_ok() && *online_rx.borrow_and_update() {
                            self.flush(&mut queue);
                        }
                    }
                    item = stream.next() => match item {
                        Some(Ok(event)) => self.handle(event, &mut queue),
                        Some(Err(e)) => break e,
                        None => break SubscriptionError::Closed,
                    },
                }
            };

            drop(stream);
            if !self.retry(&mut attempt, failure).await {
                break 'subscribe;
            }
        }

        if !queue.is_empty() {
            tracing::debug!(
                key = ?self.filter.key,
                pending = queue.len(),
                "Subscription stopped with queued notifications; they remain unread in the store"
            );
        }
    }

    /// Wait out the next backoff delay. False when retries are exhausted or
    /// the subscription was closed meanwhile.
    async fn retry(&self, attempt: &mut u32, error: SubscriptionError) -> bool {
        let Some(delay) = self.policy.delay(*attempt) else {
            tracing::error!(
                key = ?self.filter.key,
                attempts = *attempt,
                error = %error,
                "Subscription retries exhausted"
            );
            self.emit(DeliveryEvent::Failed(SubscriptionError::RetriesExhausted {
                attempts: *attempt,
                last: Box::new(error),
            }));
            return false;
        };
        *attempt += 1;
        tracing::warn!(
            key = ?self.filter.key,
            attempt = *attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Subscription failed, reconnecting"
        );
        self.emit(DeliveryEvent::Reconnecting {
            attempt: *attempt,
            delay,
        });
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn catch_up(&self) {
        let records = match self.store.recent_unread(&self.filter, self.catch_up_limit).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(key = ?self.filter.key, error = %e, "Catch-up query failed");
                Vec::new()
            }
        };
        self.emit(DeliveryEvent::CatchUp(records));
    }

    fn handle(&self, event: FeedEvent, queue: &mut VecDeque<NotificationRecord>) {
        match event.op {
            FeedOp::Insert => {
                if event.record.is_expired(Utc::now()) {
                    return;
                }
                if self.connectivity.is_online() {
                    self.flush(queue);
                    self.deliver(event.record);
                } else {
                    queue.push_back(event.record);
                }
            }
            FeedOp::Update => self.emit(DeliveryEvent::Updated(event.record)),
        }
    }

    fn flush(&self, queue: &mut VecDeque<NotificationRecord>) {
        if !queue.is_empty() {
            tracing::debug!(key = ?self.filter.key, count = queue.len(), "Flushing queued notifications");
        }
        while let Some(record) = queue.pop_front() {
            self.deliver(record);
        }
    }

    fn deliver(&self, record: NotificationRecord) {
        let settings = self.settings.borrow().clone();
        let plan = RenderPlan::for_record(&record, &settings);

        for channel in self.channels.iter() {
            if !plan.enables(channel.kind()) {
                continue;
            }
            if let Err(e) = channel.render(&record, &plan) {
                tracing::warn!(
                    notification_id = %record.id,
                    channel = ?channel.kind(),
                    error = %e,
                    "Local channel failed"
                );
            }
        }

        {
            let mut visible = lock_visible(&self.visible);
            visible.push_back(record.id.clone());
            while visible.len() > settings.max_notifications {
                visible.pop_front();
            }
        }

        self.emit(DeliveryEvent::Delivered { record, plan });
    }

    fn emit(&self, event: DeliveryEvent) {
        // A dropped handle cancels the token, so a failed send only happens
        // while shutting down.
        let _ = self.events.send(event);
    }
}
