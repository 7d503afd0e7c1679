pub mod actor;
pub mod handler;
pub mod lifecycle;
pub mod protocol;
pub mod registry;

pub use protocol::{ClientMessage, ServerEvent};
pub use registry::{ConnectionEntry, ConnectionId, ConnectionRegistry, ConnectionSender, Outbound};
