pub mod backoff;
pub mod delivery;
pub mod dispatch;
pub mod feed;
pub mod mapper;
pub mod model;
pub mod retention;
pub mod routes;

pub use delivery::{ConnectivityMonitor, DeliveryEvent, DeliveryManager, DeliverySettings, SubscriptionHandle};
pub use feed::{ChangeFeed, EventSource};
pub use mapper::{CreateOptions, EventMapper, EventOutcome};
