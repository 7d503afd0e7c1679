pub mod status;
pub mod typing;

pub use status::{OnlineUser, PresenceStatus, PresenceTracker};
pub use typing::TypingTracker;
