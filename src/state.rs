use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::db::DbPool;
use crate::notify::backoff::ReconnectPolicy;
use crate::notify::delivery::{DeliveryManager, LocalChannel};
use crate::notify::feed::ChangeFeed;
use crate::notify::mapper::EventMapper;
use crate::presence::{PresenceTracker, TypingTracker};
use crate::push::sender::PushSender;
use crate::push::PushService;
use crate::rooms::RoomManager;
use crate::store::{NotificationStore, SqliteStore};
use crate::ws::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
/// Every service is an explicit instance; cloning shares them.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// Notification and push subscription persistence
    pub store: Arc<dyn NotificationStore>,
    /// Change feed the store publishes every write to
    pub feed: ChangeFeed,
    /// Handshake and bearer token verification
    pub verifier: Arc<dyn TokenVerifier>,
    /// Active WebSocket connections per user
    pub registry: ConnectionRegistry,
    pub rooms: RoomManager,
    pub presence: PresenceTracker,
    pub typing: TypingTracker,
    /// Entry point for raising notifications
    pub events: EventMapper,
    pub push: PushService,
    pub config: Arc<Config>,
    /// Cancelled once on shutdown; background loops select on it
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        db: DbPool,
        config: Config,
        verifier: Arc<dyn TokenVerifier>,
        push_sender: Arc<dyn PushSender>,
    ) -> Self {
        let feed = ChangeFeed::default();
        let store: Arc<dyn NotificationStore> = Arc::new(SqliteStore::new(db.clone(), feed.clone()));

        let registry = ConnectionRegistry::new();
        let rooms = RoomManager::new(registry.clone());
        let presence = PresenceTracker::new(rooms.clone(), registry.clone());
        let typing = TypingTracker::new(
            rooms.clone(),
            Duration::from_secs(config.presence.typing_timeout_secs),
        );

        let push = PushService::new(store.clone(), push_sender, config.push.clone());
        let events = EventMapper::new(store.clone(), push.clone());

        Self {
            db,
            store,
            feed,
            verifier,
            registry,
            rooms,
            presence,
            typing,
            events,
            push,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    /// An embedded delivery manager over this process's store and feed,
    /// configured from the `[delivery]` section.
    pub fn delivery_manager(&self, channels: Vec<Arc<dyn LocalChannel>>) -> DeliveryManager {
        let delivery = &self.config.delivery;
        DeliveryManager::new(Arc::new(self.feed.clone()), self.store.clone())
            .with_channels(channels)
            .with_settings(delivery.settings.clone())
            .with_policy(ReconnectPolicy::new(
                Duration::from_millis(delivery.reconnect_base_ms),
                delivery.max_attempts,
            ))
            .with_catch_up_limit(self.config.notifications.catch_up_limit)
    }
}
